//! Kubernetes Event recording for the virtualization controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that migration progress is visible via `kubectl describe` on the
//! VirtualMachine, VirtualDisk and VirtualMachineOperation involved.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "MigrationStarted")
    /// * `action` - What action was taken (e.g. "Migrate")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Operation lifecycle
    /// Migration accepted and fanned out
    pub const MIGRATION_STARTED: &str = "MigrationStarted";
    /// Migration finished with the VM on its new node
    pub const MIGRATION_SUCCEEDED: &str = "MigrationSucceeded";
    /// Migration finished without moving the VM
    pub const MIGRATION_FAILED: &str = "MigrationFailed";
    /// Operation deleted while the migration was running
    pub const MIGRATION_CANCELLED: &str = "MigrationCancelled";
    /// Orchestrator started rolling the attempt back
    pub const MIGRATION_REVERTING: &str = "MigrationReverting";
    /// Operation rejected before any side effect
    pub const PRECONDITION_FAILED: &str = "PreconditionFailed";
    /// Compute migration rejected by the namespace resource quota
    pub const QUOTA_EXCEEDED: &str = "QuotaExceeded";

    // Disk lifecycle
    /// Target volume created for a disk
    pub const DISK_MIGRATION_STARTED: &str = "DiskMigrationStarted";
    /// Target volume promoted to be the disk's backing store
    pub const DISK_MIGRATION_COMPLETED: &str = "DiskMigrationCompleted";
    /// Target volume discarded, disk left on its source
    pub const DISK_MIGRATION_REVERTED: &str = "DiskMigrationReverted";

    // Storage-class trigger
    /// Storage class change cannot be acted on yet
    pub const VOLUME_MIGRATION_CANNOT_BE_PROCESSED: &str = "VolumeMigrationCannotBeProcessed";
    /// Evict operation created to move a disk to its new storage class
    pub const VOLUME_MIGRATION_STARTED: &str = "VolumeMigrationStarted";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Moving a virtual machine
    pub const MIGRATE: &str = "Migrate";
    /// Rolling back a migration attempt
    pub const REVERT: &str = "Revert";
    /// Relocating a disk's backing volume
    pub const MIGRATE_VOLUME: &str = "MigrateVolume";
    /// Validating an operation request
    pub const VALIDATE: &str = "Validate";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        for reason in [
            reasons::MIGRATION_STARTED,
            reasons::MIGRATION_CANCELLED,
            reasons::DISK_MIGRATION_REVERTED,
            reasons::VOLUME_MIGRATION_CANNOT_BE_PROCESSED,
        ] {
            assert!(reason.chars().next().is_some_and(|c| c.is_ascii_uppercase()));
            assert!(!reason.contains(' '));
        }
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::MIGRATION_FAILED,
                actions::MIGRATE,
                Some("test".to_string()),
            )
            .await;
    }
}
