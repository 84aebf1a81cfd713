//! Grid-specific error types

use thiserror::Error;

/// Errors that can occur in grid engine and backtest operations
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Exchange unavailable during {operation}: {reason}")]
    ExternalUnavailable { operation: String, reason: String },

    #[error("Local state disagrees with exchange for order {order_id}: {detail}")]
    InconsistentState { order_id: String, detail: String },

    #[error("Corrupt order snapshot {path}: {reason}")]
    CorruptPersistence { path: String, reason: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("State persistence error: {0}")]
    StatePersistence(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Historical data error: {0}")]
    DataLoad(String),

    #[error("Settings error: {0}")]
    Settings(String),
}

impl GridError {
    /// Shorthand for a failed gateway call
    pub fn unavailable(operation: impl Into<String>, reason: impl ToString) -> Self {
        GridError::ExternalUnavailable {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors the per-bar loop recovers from by trying again on a later bar
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GridError::ExternalUnavailable { .. } | GridError::InconsistentState { .. }
        )
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::StatePersistence(err.to_string())
    }
}

impl From<csv::Error> for GridError {
    fn from(err: csv::Error) -> Self {
        GridError::DataLoad(err.to_string())
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::Settings(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
