//! Error types for CNES ingestion
//!
//! Only setup and I/O failures that stop a job surface as [`CnesError`].
//! Per-identifier lookup failures are values (`LookupOutcome::Failure`), never
//! errors.

use thiserror::Error;

/// Result type alias for CNES operations
pub type Result<T> = std::result::Result<T, CnesError>;

/// Main error type for CNES ingestion
#[derive(Error, Debug)]
pub enum CnesError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Reference data error: {0}")]
    ReferenceData(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Report error: {0}")]
    Report(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl CnesError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a reference data error
    pub fn reference_data(msg: impl Into<String>) -> Self {
        Self::ReferenceData(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a report error
    pub fn report(msg: impl Into<String>) -> Self {
        Self::Report(msg.into())
    }
}
