//! vecbase server — REST façade over the [`vecbase_core`] engine.
//!
//! Re-exports the core so consumers (main.rs, integration tests) use one
//! set of import paths.

pub use vecbase_core::*;

pub mod api;
pub mod config;
