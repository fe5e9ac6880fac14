//! VirtualDisk CRD types
//!
//! A VirtualDisk is backed by exactly one PersistentVolumeClaim at rest. While
//! a storage migration runs it owns a second claim (the target) and records
//! both in `status.migrationState`.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{is_condition_true, Condition, ConditionKind};
use super::virtual_machine::MigrationResult;

/// Lifecycle phase of a VirtualDisk
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VirtualDiskPhase {
    /// Waiting for the backing volume
    #[default]
    Pending,
    /// Backing volume is being populated
    Provisioning,
    /// Volume binds when a consumer is scheduled
    WaitForFirstConsumer,
    /// Disk is usable
    Ready,
    /// Backing volume is being expanded
    Resizing,
    /// Backing volume is moving to new storage
    Migrating,
    /// Provisioning failed
    Failed,
    /// Backing volume was lost
    Lost,
    /// Disk is being deleted
    Terminating,
}

impl std::fmt::Display for VirtualDiskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::WaitForFirstConsumer => write!(f, "WaitForFirstConsumer"),
            Self::Ready => write!(f, "Ready"),
            Self::Resizing => write!(f, "Resizing"),
            Self::Migrating => write!(f, "Migrating"),
            Self::Failed => write!(f, "Failed"),
            Self::Lost => write!(f, "Lost"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Access mode of the backing volume
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write
    ReadWriteOnce,
    /// Multi-node read-write
    ReadWriteMany,
    /// Multi-node read-only
    ReadOnlyMany,
}

impl AccessMode {
    /// Whether two nodes can open the volume at the same time
    pub fn is_shared(&self) -> bool {
        !matches!(self, Self::ReadWriteOnce)
    }

    /// Kubernetes API string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadWriteOnce => "ReadWriteOnce",
            Self::ReadWriteMany => "ReadWriteMany",
            Self::ReadOnlyMany => "ReadOnlyMany",
        }
    }
}

/// Requested backing volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskPersistentVolumeClaim {
    /// Requested size (Kubernetes quantity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Requested StorageClass; changing it triggers a storage migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Backing volume currently in use
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskTarget {
    /// Name of the PersistentVolumeClaim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<String>,
}

/// VM the disk is attached to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedVirtualMachine {
    /// VM name
    pub name: String,
    /// Whether the guest has the disk mounted
    #[serde(default)]
    pub mounted: bool,
}

/// Record of the most recent storage migration of a disk.
///
/// A disk's record belongs to the VM attempt iff its `start_timestamp` is not
/// older than the attempt's start. Each attempt writes a new record; unset
/// fields serialize as null so a merge patch clears what the previous record
/// wrote.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskMigrationState {
    /// Claim the disk was backed by when the migration started
    #[serde(default)]
    pub source_pvc: Option<String>,

    /// Claim the data is copied into
    #[serde(default)]
    pub target_pvc: Option<String>,

    /// VM whose attempt opened the record
    #[serde(default)]
    pub virtual_machine: Option<String>,

    /// When the disk started migrating
    pub start_timestamp: DateTime<Utc>,

    /// When the disk reached a terminal result
    #[serde(default)]
    pub end_timestamp: Option<DateTime<Utc>>,

    /// Terminal result
    #[serde(default)]
    pub result: Option<MigrationResult>,

    /// Human-readable detail
    #[serde(default)]
    pub message: Option<String>,
}

impl VirtualDiskMigrationState {
    /// Fresh in-progress record
    pub fn started(source: Option<String>, target: String, now: DateTime<Utc>) -> Self {
        Self {
            source_pvc: source,
            target_pvc: Some(target),
            virtual_machine: None,
            start_timestamp: now,
            end_timestamp: None,
            result: None,
            message: None,
        }
    }

    /// Terminal Failed record that never ran, with start equal to end
    pub fn failed_immediately(
        source: Option<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            source_pvc: source,
            target_pvc: None,
            virtual_machine: None,
            start_timestamp: now,
            end_timestamp: Some(now),
            result: Some(MigrationResult::Failed),
            message: Some(message.into()),
        }
    }

    /// Tie the record to the VM whose attempt opened it
    pub fn for_vm(mut self, vm: impl Into<String>) -> Self {
        self.virtual_machine = Some(vm.into());
        self
    }

    /// Started and not yet terminal
    pub fn is_in_progress(&self) -> bool {
        self.end_timestamp.is_none()
    }

    /// Whether the record belongs to an attempt that started at `attempt_start`
    pub fn belongs_to(&self, attempt_start: DateTime<Utc>) -> bool {
        self.start_timestamp >= attempt_start
    }

    /// Close the record
    pub fn finish(
        mut self,
        result: MigrationResult,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        self.result = Some(result);
        self.end_timestamp = Some(now);
        if message.is_some() {
            self.message = message;
        }
        self
    }
}

/// Virtual disk backed by a PersistentVolumeClaim
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.dev",
    version = "v1alpha1",
    kind = "VirtualDisk",
    plural = "virtualdisks",
    shortname = "vd",
    namespaced,
    status = "VirtualDiskStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Capacity","type":"string","jsonPath":".status.capacity"}"#,
    printcolumn = r#"{"name":"StorageClass","type":"string","jsonPath":".status.storageClassName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSpec {
    /// Requested backing volume
    #[serde(default)]
    pub persistent_volume_claim: DiskPersistentVolumeClaim,
}

/// Status of a VirtualDisk
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: VirtualDiskPhase,

    /// Backing volume in use
    #[serde(default)]
    pub target: DiskTarget,

    /// Usable capacity (Kubernetes quantity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,

    /// Capacity actually provisioned by the storage backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_capacity: Option<String>,

    /// StorageClass of the backing volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Access mode of the backing volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,

    /// VMs the disk is attached to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attached_to_virtual_machines: Vec<AttachedVirtualMachine>,

    /// Conditions (Ready, InUse, Migrating, Resizing, Snapshotting)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Most recent storage migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<VirtualDiskMigrationState>,

    /// Generation observed by the controllers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl VirtualDisk {
    /// Conditions, empty when no status was written yet
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Whether a condition is present with status True
    pub fn has_condition(&self, kind: ConditionKind) -> bool {
        is_condition_true(self.conditions(), kind)
    }

    /// Most recent storage migration record
    pub fn migration_state(&self) -> Option<&VirtualDiskMigrationState> {
        self.status.as_ref().and_then(|s| s.migration_state.as_ref())
    }

    /// Whether a storage migration is currently in progress
    pub fn is_migrating(&self) -> bool {
        self.migration_state().is_some_and(|m| m.is_in_progress())
    }

    /// Claim currently backing the disk
    pub fn current_pvc(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.target.persistent_volume_claim.as_deref())
    }

    /// StorageClass of the backing volume
    pub fn current_storage_class(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref())
    }

    /// StorageClass the disk should live on: the spec class, falling back to the current one
    pub fn desired_storage_class(&self) -> Option<&str> {
        self.spec
            .persistent_volume_claim
            .storage_class
            .as_deref()
            .or_else(|| self.current_storage_class())
    }

    /// Whether the spec requests a different StorageClass than the one in use
    pub fn storage_class_changed(&self) -> bool {
        match (
            self.spec.persistent_volume_claim.storage_class.as_deref(),
            self.current_storage_class(),
        ) {
            (Some(desired), Some(current)) => desired != current,
            _ => false,
        }
    }

    /// Access mode of the backing volume
    pub fn access_mode(&self) -> Option<AccessMode> {
        self.status.as_ref().and_then(|s| s.access_mode)
    }

    /// Whether the disk is backed by a volume only one node can open
    pub fn is_single_node(&self) -> bool {
        self.access_mode() == Some(AccessMode::ReadWriteOnce)
    }

    /// Lifecycle phase, Pending when no status was written yet
    pub fn phase(&self) -> VirtualDiskPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Names of the VMs the disk is attached to
    pub fn attached_vm_names(&self) -> impl Iterator<Item = &str> {
        self.status
            .iter()
            .flat_map(|s| s.attached_to_virtual_machines.iter())
            .map(|a| a.name.as_str())
    }
}
