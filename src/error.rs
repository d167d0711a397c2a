//! Error types for the GitOps Sync Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error that does not map onto the sync taxonomy
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Git source could not be reached or the revision could not be resolved
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// A manifest document could not be parsed or is missing required fields
    #[error("Invalid manifest {path}: {message}")]
    ManifestInvalid { path: String, message: String },

    /// Target cluster could not be reached
    #[error("Cluster unreachable: {0}")]
    ClusterUnreachable(String),

    /// Resource was concurrently modified
    #[error("Apply conflict on {0}")]
    ApplyConflict(String),

    /// The operator is not allowed to modify the resource
    #[error("Apply forbidden on {0}")]
    ApplyForbidden(String),

    /// The API server rejected the object
    #[error("Apply rejected as invalid: {0}")]
    ApplyInvalid(String),

    /// Resource does not exist
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A cluster call did not finish within its deadline
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Status notification error
    #[error("Notification error: {0}")]
    Notify(#[from] reqwest::Error),

    /// Managed resources could not all be deleted
    #[error("Cleanup incomplete: {0}")]
    CleanupIncomplete(String),

    /// The application registry no longer accepts commands
    #[error("Operator is shutting down")]
    ShuttingDown,

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a source error
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Error::SourceUnavailable(msg.into())
    }

    /// Create a cluster connectivity error
    pub fn cluster_unreachable(msg: impl Into<String>) -> Self {
        Error::ClusterUnreachable(msg.into())
    }

    /// Create a manifest error for a source path
    pub fn manifest(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ManifestInvalid {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Map a kube client error raised while operating on `target`.
    ///
    /// API status codes become the sync taxonomy; transport failures become
    /// `ClusterUnreachable`.
    pub fn from_kube(err: kube::Error, target: &str) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => Error::NotFound(target.to_string()),
                409 => Error::ApplyConflict(format!("{}: {}", target, ae.message)),
                403 => Error::ApplyForbidden(format!("{}: {}", target, ae.message)),
                400 | 422 => Error::ApplyInvalid(format!("{}: {}", target, ae.message)),
                500..=599 => Error::ClusterUnreachable(format!("{}: {}", target, ae.message)),
                _ => Error::Kube(kube::Error::Api(ae)),
            },
            kube::Error::HyperError(e) => Error::ClusterUnreachable(e.to_string()),
            kube::Error::Service(e) => Error::ClusterUnreachable(e.to_string()),
            other => Error::Kube(other),
        }
    }

    /// Application-level errors that abort a cycle and are retried on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable(_) | Error::ClusterUnreachable(_) | Error::Timeout { .. }
        )
    }

    /// Whether the error asks for a retry with a fresh read
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ApplyConflict(_))
    }

    /// Errors that fail a single resource and are never retried automatically
    pub fn is_fatal_for_resource(&self) -> bool {
        matches!(
            self,
            Error::ApplyForbidden(_) | Error::ApplyInvalid(_) | Error::ManifestInvalid { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_from_kube_maps_status_codes() {
        assert!(matches!(
            Error::from_kube(api_error(404), "ConfigMap/ns/a"),
            Error::NotFound(_)
        ));
        assert!(Error::from_kube(api_error(409), "ConfigMap/ns/a").is_conflict());
        assert!(Error::from_kube(api_error(403), "ConfigMap/ns/a").is_fatal_for_resource());
        assert!(matches!(
            Error::from_kube(api_error(422), "ConfigMap/ns/a"),
            Error::ApplyInvalid(_)
        ));
        assert!(Error::from_kube(api_error(503), "ConfigMap/ns/a").is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::source_unavailable("git down").is_transient());
        assert!(!Error::validation("bad").is_transient());
        assert!(!Error::ApplyForbidden("x".into()).is_transient());
    }
}
