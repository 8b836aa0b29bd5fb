//! Error types for the balance smoother

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The event payload is missing fields or cannot be parsed.
    /// Never retried; the event is dead-lettered.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Filter state could not be read or written.
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    /// Filter state was persisted but the output record could not be appended.
    #[error("Output sink unavailable: {0}")]
    SinkUnavailable(String),

    /// Another writer advanced this user's state between load and persist.
    #[error("Concurrent update of state for user {user_id} (expected version {expected:?})")]
    Conflict {
        user_id: String,
        expected: Option<i64>,
    },

    #[error("Numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    #[error("Event source error: {0}")]
    Source(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Whether retrying the same read-modify-write may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
