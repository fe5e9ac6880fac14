//! Common types for the virtualization controllers: CRDs, errors, events and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod quantity;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group served by the virtualization CRDs
pub const API_GROUP: &str = "virtualization.dev";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "virtualization-controller";

/// Finalizer placed on VirtualMachineOperations so cancellation is signalled before removal
pub const VMOP_CLEANUP_FINALIZER: &str = "virtualization.dev/vmop-cleanup";

/// Label on compute migration instances naming the operation that created them
pub const VMOP_LABEL: &str = "virtualization.dev/vmop";

/// Label on compute migration instances naming the virtual machine they move
pub const VM_LABEL: &str = "virtualization.dev/vm";

/// Annotation marking operations created by the storage-class migration trigger
pub const VOLUME_MIGRATION_ANNOTATION: &str = "virtualization.dev/volume-migration";

/// Label marking a StorageClass as deprecated for new volumes
pub const DEPRECATED_STORAGE_CLASS_LABEL: &str = "virtualization.dev/deprecated";

/// Annotation on a StorageClass naming the volume mode new volumes should use
pub const VOLUME_MODE_ANNOTATION: &str = "virtualization.dev/volume-mode";

/// Helper for `skip_serializing_if` on boolean flags
pub fn is_false(value: &bool) -> bool {
    !*value
}
