//! Error types for the Block-Storage Manager
//!
//! Every reconciliation failure is classified into one of a small set of
//! kinds. The work-queue driver looks at [`Error::action`] to decide whether
//! a key is forgotten, requeued immediately, or retried with backoff.

use thiserror::Error;

/// Unified error type for the manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Object Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Write conflict on {kind}/{name}: object was modified")]
    Conflict { kind: String, name: String },

    #[error("Transient API failure: {0}")]
    Transient(String),

    #[error("Watch stream error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("Probe failed for {target}: {reason}")]
    ProbeFailure { target: String, reason: String },

    #[error("Validation failed for {kind}/{name}: {reason}")]
    Validation {
        kind: String,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML encode error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// The desired convergence already happened; drop the key
    Forget,
    /// Stale write; requeue without a backoff penalty
    RequeueImmediately,
    /// Requeue with exponential backoff, up to the retry limit
    RequeueWithBackoff,
    /// Don't requeue, wait for the spec to change
    NoRequeue,
}

impl Error {
    /// Classify a raw Kubernetes client error against the object it concerns
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            _ => Error::Kube(err),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::NotFound { .. } => ErrorAction::Forget,

            // Another writer won the race; the next pass re-reads fresh state
            Error::Conflict { .. } | Error::AlreadyExists { .. } => {
                ErrorAction::RequeueImmediately
            }

            Error::Configuration(_) | Error::Validation { .. } => ErrorAction::NoRequeue,

            Error::Kube(kube::Error::Api(resp)) if resp.code == 404 => ErrorAction::Forget,
            Error::Kube(kube::Error::Api(resp)) if resp.code == 409 => {
                ErrorAction::RequeueImmediately
            }

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.action(),
            ErrorAction::RequeueImmediately | ErrorAction::RequeueWithBackoff
        )
    }

    /// Check if this error means the object is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self.action(), ErrorAction::Forget)
    }

    /// Check if this error is a stale-write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Transient(_) | Error::Watch(_) | Error::ProbeFailure { .. }
        )
    }
}

/// Result type alias for the manager
pub type Result<T> = std::result::Result<T, Error>;

/// Extension for swallowing not-found results on deletes and lookups
pub trait ResultExt<T> {
    /// Map a not-found error to `Ok(None)`
    fn ignore_not_found(self) -> Result<Option<T>>;
}

impl<T> ResultExt<T> for Result<T> {
    fn ignore_not_found(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
