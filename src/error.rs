//! Error types for the csiraid provisioning controller

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the provisioning controller
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metric registration or encoding error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Object already exists in the cluster
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Object not found in the cluster
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Generic cluster API failure
    #[error("API request failed: {0}")]
    Api(String),

    /// Storage class referenced by a claim is unknown
    #[error("StorageClass not found: {0}")]
    StorageClassNotFound(String),

    /// The provisioner intentionally skipped the claim or volume
    #[error("Ignored: {0}")]
    Ignored(String),

    /// Claim requests raw block mode but the provisioner cannot serve it
    #[error("{provisioner} does not support block volume provisioning")]
    BlockUnsupported { provisioner: String },

    /// Provisioning failed
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// Deletion failed
    #[error("Deletion failed: {0}")]
    Deletion(String),

    /// Lease handling failed
    #[error("Leader election error: {0}")]
    LeaderElection(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Action to take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Count the failure and requeue with exponential backoff
    RequeueWithBackoff,
    /// Count the failure, don't requeue
    NoRequeue,
    /// Drop silently: no failure metric, no retry
    Ignore,
}

impl Error {
    /// Build an error carrying the "ignore" marker
    pub fn ignored(reason: impl Into<String>) -> Self {
        Error::Ignored(reason.into())
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Ignored(_) => ErrorAction::Ignore,

            // Capability rejections and configuration problems won't fix themselves
            Error::BlockUnsupported { .. } | Error::Config(_) => ErrorAction::NoRequeue,

            // Everything else is treated as transient
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error carries the "ignore" marker
    pub fn is_ignored(&self) -> bool {
        matches!(self.action(), ErrorAction::Ignore)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RequeueWithBackoff)
    }

    /// Check if the API reported that the object already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// Check if the API reported that the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }
}
