//! Error types for the commit path, the transaction log and the view projection

use thiserror::Error;

/// Result type alias for metagraph operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for metagraph
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or view definition rejected at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Graph store error
    #[error("Store error: {0}")]
    Store(String),

    /// A nested write was attempted while the thread holds a read transaction
    #[error("Can't promote a read transaction to a write transaction")]
    TransactionPromotion,

    /// A write task failed; carries the task's own error
    #[error(transparent)]
    Task(Box<dyn std::error::Error + Send + Sync>),

    /// A write task panicked
    #[error("Write task panicked: {0}")]
    TaskPanicked(String),

    /// The caller stopped waiting for the outcome of its write
    #[error("Interrupted while waiting for the write to complete")]
    Interrupted,

    /// The batch scheduler is shut down or its worker is gone
    #[error("Batch scheduler is closed")]
    SchedulerClosed,

    /// Transaction log content is inconsistent
    #[error("Corrupt transaction log: {0}")]
    CorruptLog(String),

    /// Transaction record could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Replaying the transaction log failed
    #[error("Recovery failed at record {index}: {source}")]
    Recovery {
        index: u64,
        #[source]
        source: Box<Error>,
    },

    /// Term or statement syntax error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Unknown view or column in a request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Relational projection error
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an arbitrary task error so it reaches the submitting caller unchanged
    pub fn task(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Task(err.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
