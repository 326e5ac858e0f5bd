//! vecbase core — in-memory vector database engine.
//!
//! Owns the entity store (libraries → documents → chunks), the three
//! nearest-neighbour index variants behind one contract, the query pipeline
//! combining similarity ranking with metadata filtering, and the snapshot
//! codec. The HTTP layer in `vecbase-server` is a thin façade over
//! [`Database`].

pub mod db;
pub mod error;
pub mod filter;
pub mod index;
pub mod model;
pub mod snapshot;
pub mod store;
pub mod vector;

pub use db::{Database, LibraryStats, SearchHit};
pub use error::{Error, Result};
pub use filter::{Filter, MetaValue, Metadata, Predicate};
pub use index::{AnyIndex, Hit, IndexStats, VectorIndex};
pub use model::{Chunk, Document, IndexConfig, IndexKind, Library, LshParams};
pub use snapshot::Snapshot;
