//! Orchestrator error types

/// Errors raised while orchestrating a VM migration
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from shared code or the compute driver
    #[error("{0}")]
    Common(#[from] virt_common::Error),

    /// Resource has no namespace
    #[error("missing namespace")]
    MissingNamespace,

    /// Operation has no uid yet
    #[error("operation '{0}' has no uid")]
    MissingUid(String),

    /// The VM changed between reading and recording an attempt
    #[error("virtual machine '{vm}' changed while recording the migration attempt")]
    AttemptConflict {
        /// VM name
        vm: String,
    },

    /// The VM already finished an attempt for this operation
    #[error("operation '{operation}' already finished on VM '{vm}'")]
    AttemptFinished {
        /// Operation name
        operation: String,
        /// VM name
        vm: String,
    },
}

impl OrchestratorError {
    /// Map a failed guarded write, turning a 409 into [`Self::AttemptConflict`]
    pub fn attempt_write(error: virt_common::Error, vm: &str) -> Self {
        if error.is_conflict() {
            Self::AttemptConflict { vm: vm.to_string() }
        } else {
            Self::Common(error)
        }
    }

    /// Whether a requeue can fix the error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_) | Self::AttemptConflict { .. } => true,
            Self::Common(e) => e.is_retryable(),
            Self::Serialization(_)
            | Self::MissingNamespace
            | Self::MissingUid(_)
            | Self::AttemptFinished { .. } => false,
        }
    }
}
