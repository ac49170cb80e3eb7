//! Error types for particle-tracks

use thiserror::Error;

/// Result type alias for particle-tracks operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for particle-tracks
#[derive(Error, Debug)]
pub enum Error {
    /// A rank's disordered log is absent; no reorder is possible
    #[error("Missing disordered log for species '{species}' (rank {rank})")]
    MissingSource { species: String, rank: u32 },

    /// A rank has no latest count in the final time-group
    #[error("Rank {rank} is missing from the final time-group")]
    InconsistentRankCount { rank: u32 },

    /// An identifier maps outside the global slot space (corrupted input)
    #[error("Identifier {id:#x} maps to slot {slot}, outside [0, {total_slots})")]
    SlotOutOfRange {
        id: u64,
        slot: i64,
        total_slots: u64,
    },

    /// Another reorder holds the store lock
    #[error("Another reorder is running against this store (lock held by {holder})")]
    ConcurrentReorder { holder: String },

    /// Malformed selector query
    #[error("Selector syntax error: {message} in `{fragment}`")]
    SelectorSyntax { message: String, fragment: String },

    /// Selector or fetch references an undefined property
    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    /// Operation aborted through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a selector syntax error carrying the offending fragment
    pub fn selector(message: impl Into<String>, fragment: impl Into<String>) -> Self {
        Error::SelectorSyntax {
            message: message.into(),
            fragment: fragment.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Configuration(e.to_string())
    }
}
