//! Error types for the replication engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input that cannot succeed until the caller changes it
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Optimistic concurrency or name collision reported by the API server
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The offending object was removed; the next reconcile starts fresh
    #[error("Requeue: {0}")]
    Requeue(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Whether a later reconcile can succeed without the input changing.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Conflict(_) | Error::Requeue(_) | Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 409 || ae.code >= 500,
            Error::KubeError(_) | Error::IoError(_) => true,
            Error::SerializationError(_)
            | Error::YamlError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_is_terminal() {
        let err = Error::ValidationError("no storageClassName given".to_string());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("storageClassName"));
    }

    #[test]
    fn test_requeue_and_conflict_are_retryable() {
        assert!(Error::Requeue("pvc has incorrect datasource".to_string()).is_retryable());
        assert!(Error::Conflict("resourceVersion mismatch".to_string()).is_retryable());
    }

    #[test]
    fn test_not_found_helper() {
        let err = Error::not_found("PersistentVolumeClaim", "ns/app-data");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "PersistentVolumeClaim ns/app-data not found");
    }
}
