//! Common Error Types for account-fleet
//!
//! Every layer has its own `thiserror` enum; this module folds them into one
//! root type so that batch workers and the CLI can propagate with `?`.

use thiserror::Error;

use crate::batch::BatchError;
use crate::exchange::ExchangeError;
use crate::pool::PoolError;
use crate::registry::RegistryError;
use crate::storage::StorageError;
use crate::types::artifact::ArtifactError;

/// Root error type for account-fleet
#[derive(Debug, Error)]
pub enum FleetError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    /// Document store errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Resource pool errors
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Credential exchange errors
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// Malformed long-lived artifact
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Account registry errors
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Batch run errors (merge-back failures)
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    /// Binding agent failures
    #[error("binding error: {0}")]
    Binding(String),

    /// Validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Create a binding error
    pub fn binding(msg: impl Into<String>) -> Self {
        Self::Binding(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            FleetError::Exchange(e) => e.is_retryable(),
            FleetError::Storage(StorageError::Io(_)) | FleetError::Io(_) => true,
            FleetError::Binding(_) => true,
            _ => false,
        }
    }

    /// Get a stable error code for reports
    pub fn error_code(&self) -> &'static str {
        match self {
            FleetError::Config(_) => "CONFIG_ERROR",
            FleetError::Logging(_) => "LOGGING_ERROR",
            FleetError::Storage(_) => "STORAGE_ERROR",
            FleetError::Pool(_) => "POOL_ERROR",
            FleetError::Exchange(_) => "EXCHANGE_ERROR",
            FleetError::Artifact(_) => "ARTIFACT_ERROR",
            FleetError::Registry(_) => "REGISTRY_ERROR",
            FleetError::Batch(_) => "BATCH_ERROR",
            FleetError::Binding(_) => "BINDING_ERROR",
            FleetError::Validation(_) => "VALIDATION_ERROR",
            FleetError::Internal(_) => "INTERNAL_ERROR",
            FleetError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias using FleetError
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = FleetError::binding("agent crashed");
        assert!(err.to_string().contains("agent crashed"));
        assert_eq!(err.error_code(), "BINDING_ERROR");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(FleetError::binding("timeout").is_retryable());
        assert!(FleetError::Exchange(ExchangeError::PollTimeout { attempts: 40 }).is_retryable());
        assert!(!FleetError::validation("bad email").is_retryable());
        assert!(!FleetError::Artifact(ArtifactError::MissingDelimiter).is_retryable());
    }
}
