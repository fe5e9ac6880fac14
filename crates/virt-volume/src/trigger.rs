//! Storage-class migration trigger
//!
//! When a disk's spec asks for a different StorageClass than the one it is
//! on, the trigger files an Evict operation for the VM the disk is attached
//! to. The orchestrator then moves the VM and relocates the disk in the same
//! attempt.
//!
//! Backoff after failed attempts is derived from the operations themselves,
//! so it survives restarts without any in-process state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

use virt_common::crd::{
    ConditionKind, OperationPhase, OperationType, VirtualDisk, VirtualMachineOperation,
    VirtualMachineOperationSpec,
};
use virt_common::events::{actions, reasons};
use virt_common::metrics::record_reconcile_error;
use virt_common::retry::RetryConfig;
use virt_common::VOLUME_MIGRATION_ANNOTATION;

use crate::controller::Context;
use crate::error::DiskMigrationError;

/// generateName prefix of operations filed by the trigger
pub const OPERATION_PREFIX: &str = "volume-migration-";

/// Backoff between attempts: 5s doubling per consecutive failure, capped at 5m
pub fn backoff_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 0,
        initial_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(300),
        backoff_multiplier: 2.0,
    }
}

fn created(op: &VirtualMachineOperation) -> Option<DateTime<Utc>> {
    op.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// When the next attempt for a VM may be filed, None if it may be filed now
///
/// Counts the consecutive Failed migration operations for the VM, newest
/// first, ignoring operations older than the VM itself. The window is
/// measured from the newest failure.
pub fn backoff_until(
    operations: &[VirtualMachineOperation],
    vm: &str,
    vm_created: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let mut history: Vec<(DateTime<Utc>, OperationPhase)> = operations
        .iter()
        .filter(|op| op.is_migration() && op.spec.virtual_machine == vm)
        .filter_map(|op| created(op).map(|at| (at, op.phase())))
        .filter(|(at, _)| vm_created.map_or(true, |vm_at| *at > vm_at))
        .collect();
    history.sort_by(|a, b| b.0.cmp(&a.0));

    let failures = history
        .iter()
        .take_while(|(_, phase)| *phase == OperationPhase::Failed)
        .count();
    let (latest, _) = history.first().filter(|_| failures > 0)?;

    let delay = backoff_config().delay_for(failures as u32);
    let delay = chrono::Duration::milliseconds(delay.as_millis() as i64);
    Some(*latest + delay)
}

/// Build the Evict operation the trigger files for a VM
pub fn build_operation(namespace: &str, vm: &str) -> VirtualMachineOperation {
    VirtualMachineOperation {
        metadata: ObjectMeta {
            generate_name: Some(OPERATION_PREFIX.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                VOLUME_MIGRATION_ANNOTATION.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        spec: VirtualMachineOperationSpec {
            type_: OperationType::Evict,
            virtual_machine: vm.to_string(),
            force: false,
            migrate: None,
        },
        status: None,
    }
}

/// Reconcile a VirtualDisk for storage-class changes
#[instrument(skip(disk, ctx), fields(disk = %disk.name_any()))]
pub async fn reconcile(
    disk: Arc<VirtualDisk>,
    ctx: Arc<Context>,
) -> Result<Action, DiskMigrationError> {
    let name = disk.name_any();
    let namespace = disk
        .namespace()
        .ok_or(DiskMigrationError::MissingNamespace)?;

    if disk.metadata.deletion_timestamp.is_some()
        || !disk.storage_class_changed()
        || disk.is_migrating()
        || !disk.has_condition(ConditionKind::Ready)
    {
        return Ok(Action::await_change());
    }
    let Some(vm_name) = disk.attached_vm_names().next().map(str::to_string) else {
        debug!(disk = %name, "storage class changed on a detached disk; nothing to move");
        return Ok(Action::await_change());
    };

    let blocked_by = if disk.has_condition(ConditionKind::Resizing) {
        Some("disk is being resized")
    } else if disk.has_condition(ConditionKind::Snapshotting) {
        Some("disk is being snapshotted")
    } else {
        None
    };
    if let Some(why) = blocked_by {
        cannot_process(&ctx, &disk, format!("Storage class change is waiting: {why}.")).await;
        return Ok(Action::await_change());
    }

    let Some(vm) = ctx.kube.get_vm(&namespace, &vm_name).await? else {
        return Ok(Action::await_change());
    };
    if vm.active_migration().is_some() {
        debug!(disk = %name, vm = %vm_name, "VM is already migrating");
        return Ok(Action::await_change());
    }

    let operations = ctx.kube.list_operations(&namespace).await?;
    let active = operations.iter().any(|op| {
        op.is_migration() && op.spec.virtual_machine == vm_name && !op.is_terminal()
    });
    if active {
        debug!(disk = %name, vm = %vm_name, "migration operation already active");
        return Ok(Action::await_change());
    }

    let vm_created = vm.metadata.creation_timestamp.as_ref().map(|t| t.0);
    if let Some(ready_at) = backoff_until(&operations, &vm_name, vm_created) {
        let now = Utc::now();
        if now < ready_at {
            let wait = (ready_at - now).to_std().unwrap_or(Duration::from_secs(5));
            cannot_process(
                &ctx,
                &disk,
                format!(
                    "Previous migrations of {vm_name} failed; retrying in {}s.",
                    wait.as_secs().max(1)
                ),
            )
            .await;
            return Ok(Action::requeue(wait));
        }
    }

    let filed = ctx
        .kube
        .create_operation(&namespace, &build_operation(&namespace, &vm_name))
        .await?;
    info!(
        disk = %name,
        vm = %vm_name,
        operation = %filed.name_any(),
        "filed evict operation for storage class change"
    );
    ctx.events
        .publish(
            &disk.object_ref(&()),
            EventType::Normal,
            reasons::VOLUME_MIGRATION_STARTED,
            actions::MIGRATE_VOLUME,
            Some(format!(
                "Created {} to move the disk to {}.",
                filed.name_any(),
                disk.desired_storage_class().unwrap_or_default()
            )),
        )
        .await;
    Ok(Action::await_change())
}

async fn cannot_process(ctx: &Context, disk: &VirtualDisk, note: String) {
    debug!(disk = %disk.name_any(), %note, "storage class change cannot be processed");
    ctx.events
        .publish(
            &disk.object_ref(&()),
            EventType::Warning,
            reasons::VOLUME_MIGRATION_CANNOT_BE_PROCESSED,
            actions::MIGRATE_VOLUME,
            Some(note),
        )
        .await;
}

/// Error policy for the storage-class trigger
pub fn error_policy(
    disk: Arc<VirtualDisk>,
    error: &DiskMigrationError,
    _ctx: Arc<Context>,
) -> Action {
    error!(?error, disk = %disk.name_any(), "storage class trigger failed");
    record_reconcile_error("virtualdisk-trigger", error.is_retryable());
    Action::requeue(Duration::from_secs(10))
}
