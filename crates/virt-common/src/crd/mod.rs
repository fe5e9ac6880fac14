//! Custom Resource Definitions for the virtualization platform
//!
//! This module contains every CRD the migration controllers read or write,
//! plus the foreign compute migration type they drive.

mod attachment;
mod compute_migration;
mod operation;
mod types;
mod virtual_disk;
mod virtual_machine;

pub use attachment::{
    AttachmentPhase, VirtualMachineBlockDeviceAttachment, VirtualMachineBlockDeviceAttachmentSpec,
    VirtualMachineBlockDeviceAttachmentStatus,
};
pub use compute_migration::{
    AbortStatus, InstanceCondition, InstanceMigrationPhase, InstanceMigrationState, MigratedVolume,
    VirtualMachineInstanceMigration, VirtualMachineInstanceMigrationSpec,
    VirtualMachineInstanceMigrationStatus, MIGRATION_JOB_UID_LABEL, REJECTED_BY_RESOURCE_QUOTA,
};
pub use operation::{
    CompletedReason, MigrateSpec, OperationPhase, OperationType, VirtualMachineOperation,
    VirtualMachineOperationSpec, VirtualMachineOperationStatus, SIGNAL_SENT_SUCCESS,
};
pub use types::{
    find_condition, is_condition_true, remove_condition, set_condition, Condition, ConditionKind,
    ConditionStatus,
};
pub use virtual_disk::{
    AccessMode, AttachedVirtualMachine, DiskPersistentVolumeClaim, DiskTarget, VirtualDisk,
    VirtualDiskMigrationState, VirtualDiskPhase, VirtualDiskSpec, VirtualDiskStatus,
};
pub use virtual_machine::{
    BlockDeviceKind, BlockDeviceRef, MigrationNode, MigrationPhase, MigrationResult, RunPolicy,
    Toleration, VirtualMachine, VirtualMachineMigrationState, VirtualMachinePhase,
    VirtualMachineSpec, VirtualMachineStatus,
};
