//! Error types for the controllers.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::cloud::ProviderError;
use crate::mesh::MeshError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error (DNS file flushing)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cloud provider error
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Service mesh error
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// A resource broke a contract between controllers, e.g. a build job
    /// that completed without publishing its artifact annotation. Not
    /// retryable; the offending resource is marked failed.
    #[error("Contract violation: {0}")]
    Contract(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error indicates a write conflict or an
    /// already-existing resource
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, conflicts, and
                // server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Provider(_) => true,
            Error::Mesh(_) => false,
            Error::Contract(_) | Error::Validation(_) | Error::MissingField(_) => false,
            Error::Serialization(_) => false,
            Error::Io(_) => true,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            // Don't hot-loop on non-retryable errors
            Duration::from_secs(3600)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_errors_are_not_retryable() {
        let err = Error::Contract("job completed without artifacts".to_string());
        assert!(!err.is_retryable());
        assert!(!err.is_not_found());
    }

    #[test]
    fn provider_errors_are_retryable() {
        let err = Error::Provider(ProviderError::new("rate limited"));
        assert!(err.is_retryable());
        assert_eq!(err.requeue_after(), Duration::from_secs(30));
    }
}
