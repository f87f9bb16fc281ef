//! Error types for rune-deploy

use crate::project::ValidationReport;
use std::time::Duration;
use thiserror::Error;

/// Result type for rune-deploy operations
pub type Result<T> = std::result::Result<T, DeployError>;

/// rune-deploy error types
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Unknown field '{field}' in {location}")]
    UnknownField { location: String, field: String },

    #[error("{0}")]
    Validation(ValidationReport),

    #[error("Cyclic dependency: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("Health probe for service '{service}' timed out after {timeout:?}")]
    ProbeTimeout { service: String, timeout: Duration },

    #[error("Health probe for service '{service}' failed: {reason}")]
    ProbeFailure { service: String, reason: String },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Machine-checkable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedDescriptor,
    UnknownField,
    Validation,
    CyclicDependency,
    ProbeTimeout,
    ProbeFailure,
    BackendUnavailable,
    ServiceNotFound,
    Cancelled,
    InvalidConfig,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedDescriptor => "malformed_descriptor",
            ErrorKind::UnknownField => "unknown_field",
            ErrorKind::Validation => "validation",
            ErrorKind::CyclicDependency => "cyclic_dependency",
            ErrorKind::ProbeTimeout => "probe_timeout",
            ErrorKind::ProbeFailure => "probe_failure",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::ServiceNotFound => "service_not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DeployError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::MalformedDescriptor(_) | DeployError::Yaml(_) => {
                ErrorKind::MalformedDescriptor
            }
            DeployError::UnknownField { .. } => ErrorKind::UnknownField,
            DeployError::Validation(_) => ErrorKind::Validation,
            DeployError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            DeployError::ProbeTimeout { .. } => ErrorKind::ProbeTimeout,
            DeployError::ProbeFailure { .. } => ErrorKind::ProbeFailure,
            DeployError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            DeployError::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            DeployError::Cancelled => ErrorKind::Cancelled,
            DeployError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            DeployError::Io(_) | DeployError::Json(_) => ErrorKind::Io,
        }
    }

    /// Service the error is attributed to, if any
    pub fn service(&self) -> Option<&str> {
        match self {
            DeployError::ProbeTimeout { service, .. } | DeployError::ProbeFailure { service, .. } => {
                Some(service)
            }
            DeployError::ServiceNotFound(name) => Some(name),
            DeployError::CyclicDependency { path } => path.first().map(String::as_str),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_joins_path() {
        let err = DeployError::CyclicDependency {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
        assert_eq!(err.service(), Some("a"));
    }
}
