//! Disk migration error types

/// Errors raised while coordinating a disk migration
#[derive(Debug, thiserror::Error)]
pub enum DiskMigrationError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from shared code
    #[error("{0}")]
    Common(#[from] virt_common::Error),

    /// Resource has no namespace
    #[error("missing namespace on VirtualDisk")]
    MissingNamespace,

    /// A disk owns more volumes than a source and a target
    #[error("disk '{disk}' owns {count} volumes; expected at most 2")]
    TooManyVolumes {
        /// Disk name
        disk: String,
        /// Number of owned volumes
        count: usize,
    },

    /// The backend handed back the source as the target
    #[error("target volume '{volume}' of disk '{disk}' is the source volume")]
    TargetIsSource {
        /// Disk name
        disk: String,
        /// Volume name
        volume: String,
    },
}

impl DiskMigrationError {
    /// Whether a requeue can fix the error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_) => true,
            Self::Common(e) => e.is_retryable(),
            Self::Serialization(_)
            | Self::MissingNamespace
            | Self::TooManyVolumes { .. }
            | Self::TargetIsSource { .. } => false,
        }
    }
}
