//! Operation handler error types

use virt_migration::OrchestratorError;

/// Errors raised while handling a VirtualMachineOperation
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from shared code or the compute driver
    #[error("{0}")]
    Common(#[from] virt_common::Error),

    /// The orchestrator could not begin the attempt
    #[error("orchestrator: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// Resource has no namespace
    #[error("missing namespace")]
    MissingNamespace,
}

impl OperationError {
    /// Whether a requeue can fix the error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_) => true,
            Self::Common(e) => e.is_retryable(),
            Self::Orchestrator(e) => e.is_retryable(),
            Self::Serialization(_) | Self::MissingNamespace => false,
        }
    }
}
