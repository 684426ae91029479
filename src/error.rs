use thiserror::Error;

/// Errors raised by the descriptor stores, the nearest-neighbour index and
/// IQR sessions.
///
/// Returning fewer neighbours than requested is not an error: `nn` hands back
/// a partial result when the index holds fewer ids than asked for.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{namespace}/{uuid} not found")]
    NotFound { namespace: String, uuid: String },

    #[error("descriptor {type_label}/{uuid} has no vector")]
    NotComputed { type_label: String, uuid: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{uuid} is already an example of the opposite polarity")]
    Conflict { uuid: String },

    #[error("session {session} is unavailable ({state})")]
    SessionUnavailable { session: String, state: String },

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("hash code {0} is not in the hash index")]
    UnknownHashCode(String),

    #[error("refine was cancelled")]
    Cancelled,

    #[error("refine exceeded its deadline")]
    TimedOut,

    #[cfg(feature = "persistence")]
    #[error("serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "persistence")]
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "rocksdb")]
    #[error("rocksdb {operation} failed: {source}")]
    RocksDb {
        operation: &'static str,
        #[source]
        source: rocksdb::Error,
    },
}

impl Error {
    pub(crate) fn not_found(namespace: impl Into<String>, uuid: impl Into<String>) -> Self {
        Error::NotFound {
            namespace: namespace.into(),
            uuid: uuid.into(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
