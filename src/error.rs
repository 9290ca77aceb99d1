//! Error types for the triage loop engine
//!
//! This module provides the engine's error taxonomy using thiserror for
//! structured error definitions and anyhow for error propagation at the
//! binary boundary.

use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Eligible population below the configured minimum (a skip, not a failure)
    #[error("Insufficient data: {count} eligible records, minimum is {minimum}")]
    InsufficientData { count: usize, minimum: usize },

    /// Clustering capability timed out or returned an unusable response
    #[error("External capability error: {0}")]
    ExternalCapability(String),

    /// Rejected input (verification config, period selection)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store transaction failed and was rolled back
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Whether re-running the same unit later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ExternalCapability(_)
                | EngineError::Persistence(_)
                | EngineError::Database(_)
                | EngineError::Http(_)
        )
    }

    /// Short machine-readable kind, stored alongside failure markers
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InsufficientData { .. } => "insufficient_data",
            EngineError::ExternalCapability(_) => "external_capability",
            EngineError::Validation(_) => "validation",
            EngineError::Persistence(_) => "persistence",
            EngineError::Database(_) => "database",
            EngineError::NotFound(_) => "not_found",
            EngineError::Config(_) => "config",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
            EngineError::Http(_) => "http",
            EngineError::Other(_) => "other",
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<libsql::Error> for EngineError {
    fn from(err: libsql::Error) -> Self {
        EngineError::Database(err.to_string())
    }
}

/// Convert anyhow::Error to EngineError
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Other(err.to_string())
    }
}
