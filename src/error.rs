//! Error types for catalyst-content

use thiserror::Error;

use crate::types::MalformedRecord;

#[derive(Error, Debug)]
pub enum CatalystError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Content unavailable: {0}")]
    ContentUnavailable(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Challenge failed: {0}")]
    Challenge(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// One record of a history stream was unreadable; the stream itself is fine
    #[error("Malformed record {0}")]
    MalformedRecord(Box<MalformedRecord>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for CatalystError {
    fn from(e: rusqlite::Error) -> Self {
        CatalystError::Database(e.to_string())
    }
}

impl CatalystError {
    /// Whether retrying the same operation later can succeed without
    /// any change to the input.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            CatalystError::Validation(_)
                | CatalystError::HashMismatch { .. }
                | CatalystError::Parse(_)
                | CatalystError::MalformedRecord(_)
                | CatalystError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CatalystError>;
