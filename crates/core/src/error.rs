use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the core. The core recovers nothing locally:
/// every failure returns to the caller with its kind and a human-readable
/// cause, and the HTTP layer maps kinds to status codes.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown library/document/chunk id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation precondition unmet (build on empty library, dimension
    /// mismatch after the first chunk fixed it, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed input: non-finite vector, unsupported filter form,
    /// non-positive k.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Approximate search returned fewer than k results in strict mode.
    #[error("degraded: {0}")]
    Degraded(String),

    /// Snapshot read/write/decode failure.
    #[error("io: {0}")]
    Io(String),

    /// Invariant violation. Logged and re-raised, never swallowed.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn conflict(what: impl std::fmt::Display) -> Self {
        Error::Conflict(what.to_string())
    }

    pub fn invalid(what: impl std::fmt::Display) -> Self {
        Error::Invalid(what.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

// serde_json only appears on the snapshot path, so a decode failure is a
// snapshot I/O failure from the caller's point of view.
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Io(format!("snapshot decode failed: {e}"))
    }
}
