//! Error types for the virtualization controllers
//!
//! Errors carry the resource they concern so a failed reconcile can be traced
//! back to a specific VirtualMachine, VirtualDisk or operation from the logs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type shared by the controllers
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource spec or request is malformed
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.migrate.nodeSelector")
        field: Option<String>,
    },

    /// Migration state machine error
    #[error("migration error for {resource}: {message}")]
    Migration {
        /// Name of the virtual machine or disk being migrated
        resource: String,
        /// Description of what failed
        message: String,
        /// Orchestration phase in which the error occurred
        phase: Option<String>,
    },

    /// Storage backend error (volumes, storage classes)
    #[error("storage error for {resource}: {message}")]
    Storage {
        /// Name of the disk or volume involved
        resource: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "index")
        context: String,
    },
}

impl Error {
    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named resource and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a migration error for a named resource
    pub fn migration_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Migration {
            resource: resource.into(),
            message: msg.into(),
            phase: None,
        }
    }

    /// Create a migration error tagged with the orchestration phase
    pub fn migration_in_phase(
        resource: impl Into<String>,
        phase: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Migration {
            resource: resource.into(),
            message: msg.into(),
            phase: Some(phase.into()),
        }
    }

    /// Create a retryable storage error
    pub fn storage(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            resource: resource.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a storage error that will not resolve by retrying
    pub fn storage_permanent(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            resource: resource.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error without context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec fix. Kubernetes errors
    /// are retried unless the API server rejected the request with a 4xx
    /// other than a conflict or throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae)
                    if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Migration { .. } => true,
            Error::Storage { retryable, .. } => *retryable,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Returns true when the error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Returns true when the error is a Kubernetes 409 (already exists / conflict)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. }
            | Error::Migration { resource, .. }
            | Error::Storage { resource, .. } => Some(resource),
            Error::Kube { .. } | Error::Serialization { .. } | Error::Internal { .. } => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
