//! Disk migration decision
//!
//! Pure function of the disk and the VM it is attached to. The VM's
//! `migrationState` is the mailbox: a disk record belongs to the VM's
//! attempt iff it started no earlier than the attempt did.

use kube::ResourceExt;
use virt_common::crd::{MigrationPhase, VirtualDisk, VirtualMachine};

/// What the coordinator should do with a disk on this pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskAction {
    /// Nothing to do
    None,
    /// Create the target volume and open a fresh record
    PrepareTarget,
    /// Report target readiness on the `Migrating` condition
    Sync,
    /// Promote the target if compute mirrored into it, otherwise stay on the source
    Complete,
    /// Drop the target and stay on the source
    Revert,
    /// Record a terminal failure for a declared disk that never started
    Abandon,
}

/// Decide the next action for a disk
pub fn determine_disk_action(disk: &VirtualDisk, vm: Option<&VirtualMachine>) -> DiskAction {
    let attempt = vm.and_then(|vm| vm.migration_state());

    if let Some(record) = disk.migration_state().filter(|r| r.is_in_progress()) {
        let Some(vm) = vm else {
            return DiskAction::Revert;
        };
        if vm.is_deleting() || !vm.is_running() {
            return DiskAction::Revert;
        }
        let Some(attempt) = attempt else {
            return DiskAction::Revert;
        };
        if !record.belongs_to(attempt.start_timestamp) {
            return DiskAction::Revert;
        }
        return match attempt.phase {
            MigrationPhase::Reverting | MigrationPhase::Failed => DiskAction::Revert,
            MigrationPhase::Settling | MigrationPhase::Succeeded => DiskAction::Complete,
            MigrationPhase::Migrating => DiskAction::Sync,
        };
    }

    let (Some(vm), Some(attempt)) = (vm, attempt) else {
        return DiskAction::None;
    };
    if !attempt.declares(&disk.name_any()) {
        return DiskAction::None;
    }
    let recorded = disk
        .migration_state()
        .is_some_and(|r| r.belongs_to(attempt.start_timestamp));
    if recorded {
        return DiskAction::None;
    }

    match attempt.phase {
        MigrationPhase::Migrating if vm.is_running() && !vm.is_deleting() => {
            DiskAction::PrepareTarget
        }
        MigrationPhase::Settling | MigrationPhase::Reverting => DiskAction::Abandon,
        _ => DiskAction::None,
    }
}
