//! Transition predicates
//!
//! Each predicate compares only the fields and conditions its consumer
//! decides on. They are pure and cheap, and run inside watch mappers.

use virt_common::crd::{
    find_condition, Condition, ConditionKind, VirtualDisk, VirtualMachine,
    VirtualMachineInstanceMigration, VirtualMachineOperation, REJECTED_BY_RESOURCE_QUOTA,
};

/// Whether the status or reason of a condition differs between two lists
pub fn condition_changed(old: &[Condition], new: &[Condition], kind: ConditionKind) -> bool {
    let project = |conditions: &[Condition]| {
        find_condition(conditions, kind).map(|c| (c.status, c.reason.clone()))
    };
    project(old) != project(new)
}

fn deletion_changed<K: kube::Resource>(old: &K, new: &K) -> bool {
    old.meta().deletion_timestamp.is_some() != new.meta().deletion_timestamp.is_some()
}

/// VM changes the orchestrator decides on: lifecycle, deletion, the attempt record
pub fn vm_changed_for_orchestrator(old: &VirtualMachine, new: &VirtualMachine) -> bool {
    deletion_changed(old, new)
        || old.phase() != new.phase()
        || old.migration_state() != new.migration_state()
        || condition_changed(old.conditions(), new.conditions(), ConditionKind::Running)
}

/// VM changes the disk coordinators decide on.
///
/// Disks only read the attempt's identity, phase and declared volumes, so
/// progress messages and node moves do not wake them.
pub fn vm_changed_for_disks(old: &VirtualMachine, new: &VirtualMachine) -> bool {
    let attempt = |vm: &VirtualMachine| {
        vm.migration_state()
            .map(|m| (m.start_timestamp, m.phase, m.volumes.clone()))
    };

    deletion_changed(old, new)
        || old.is_running() != new.is_running()
        || attempt(old) != attempt(new)
        || old.spec.block_device_refs != new.spec.block_device_refs
        || condition_changed(
            old.conditions(),
            new.conditions(),
            ConditionKind::FilesystemFrozen,
        )
}

/// Disk changes the orchestrator barriers on: the per-disk record and copy progress
pub fn disk_changed_for_orchestrator(old: &VirtualDisk, new: &VirtualDisk) -> bool {
    old.migration_state() != new.migration_state()
        || condition_changed(old.conditions(), new.conditions(), ConditionKind::Migrating)
        || old.attached_vm_names().ne(new.attached_vm_names())
}

/// Disk changes the storage-class trigger decides on
pub fn disk_changed_for_trigger(old: &VirtualDisk, new: &VirtualDisk) -> bool {
    old.spec.persistent_volume_claim.storage_class
        != new.spec.persistent_volume_claim.storage_class
        || old.current_storage_class() != new.current_storage_class()
        || old.is_migrating() != new.is_migrating()
        || old.attached_vm_names().ne(new.attached_vm_names())
        || [
            ConditionKind::Ready,
            ConditionKind::Resizing,
            ConditionKind::Snapshotting,
        ]
        .into_iter()
        .any(|kind| condition_changed(old.conditions(), new.conditions(), kind))
}

/// Operation changes: phase, deletion, hand-off signal, spec generation
pub fn operation_changed(old: &VirtualMachineOperation, new: &VirtualMachineOperation) -> bool {
    deletion_changed(old, new)
        || old.phase() != new.phase()
        || old.signal_sent() != new.signal_sent()
        || old.metadata.generation != new.metadata.generation
}

/// Compute instance changes: phase, abort progress, target node, quota rejection
pub fn instance_changed(
    old: &VirtualMachineInstanceMigration,
    new: &VirtualMachineInstanceMigration,
) -> bool {
    let progress = |i: &VirtualMachineInstanceMigration| {
        i.migration_state()
            .map(|s| (s.abort_status, s.target_node.clone(), s.failure_reason.clone()))
    };
    let quota = |i: &VirtualMachineInstanceMigration| {
        i.condition(REJECTED_BY_RESOURCE_QUOTA).map(|c| c.status)
    };

    deletion_changed(old, new)
        || old.phase() != new.phase()
        || old.spec.abort_requested != new.spec.abort_requested
        || progress(old) != progress(new)
        || quota(old) != quota(new)
}
