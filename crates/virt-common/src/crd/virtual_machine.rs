//! VirtualMachine CRD types
//!
//! Defines `VirtualMachine` together with the per-attempt migration record
//! (`status.migrationState`) that the orchestrator uses as its durable state
//! machine. Every migration decision is rebuilt from this record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::compute_migration::MigratedVolume;
use super::types::Condition;

// =============================================================================
// Spec types
// =============================================================================

/// Power-state policy of a virtual machine
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RunPolicy {
    /// Always running; restarted on any stop
    AlwaysOn,
    /// Never running
    AlwaysOff,
    /// Started and stopped only by explicit operations
    #[default]
    Manual,
    /// Running unless stopped from inside the guest or by an operation
    AlwaysOnUnlessStoppedManually,
}

impl RunPolicy {
    /// Whether a running VM under this policy may be migrated
    pub fn allows_migration(&self) -> bool {
        !matches!(self, Self::AlwaysOff)
    }
}

impl std::fmt::Display for RunPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlwaysOn => write!(f, "AlwaysOn"),
            Self::AlwaysOff => write!(f, "AlwaysOff"),
            Self::Manual => write!(f, "Manual"),
            Self::AlwaysOnUnlessStoppedManually => write!(f, "AlwaysOnUnlessStoppedManually"),
        }
    }
}

/// Kind of a block device attached to a VM
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum BlockDeviceKind {
    /// Namespaced writable disk
    VirtualDisk,
    /// Namespaced read-only image
    VirtualImage,
    /// Cluster-scoped read-only image
    ClusterVirtualImage,
}

/// Reference to a block device by kind and name
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceRef {
    /// Kind of the referenced device
    pub kind: BlockDeviceKind,
    /// Name of the referenced device
    pub name: String,
}

impl BlockDeviceRef {
    /// Reference to a VirtualDisk
    pub fn disk(name: impl Into<String>) -> Self {
        Self {
            kind: BlockDeviceKind::VirtualDisk,
            name: name.into(),
        }
    }
}

/// Node taint toleration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Exists or Equal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    /// Taint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// NoSchedule, PreferNoSchedule or NoExecute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
}

// =============================================================================
// Phases
// =============================================================================

/// Lifecycle phase of a VirtualMachine, written by the power-state controller
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VirtualMachinePhase {
    /// Waiting for resources
    #[default]
    Pending,
    /// Guest is booting
    Starting,
    /// Guest is running
    Running,
    /// Guest is running and moving between nodes
    Migrating,
    /// Guest is shutting down
    Stopping,
    /// Guest is stopped
    Stopped,
    /// VM is being deleted
    Terminating,
    /// VM is in an unrecoverable state
    Degraded,
}

impl std::fmt::Display for VirtualMachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Migrating => write!(f, "Migrating"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Terminating => write!(f, "Terminating"),
            Self::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Phase of a migration attempt as recorded on the VM
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Compute and storage are moving
    Migrating,
    /// Compute landed; disks are promoting
    Settling,
    /// Abort requested; waiting for compute and disks to roll back
    Reverting,
    /// Everything landed on the target
    Succeeded,
    /// Everything rolled back to the source
    Failed,
}

impl MigrationPhase {
    /// Succeeded and Failed are sinks
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Migrating => write!(f, "Migrating"),
            Self::Settling => write!(f, "Settling"),
            Self::Reverting => write!(f, "Reverting"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Terminal result of a VM or disk migration attempt
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MigrationResult {
    /// Landed on the target
    Succeeded,
    /// Rolled back to the source
    Failed,
}

impl std::fmt::Display for MigrationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Migration state
// =============================================================================

/// Node endpoint of a migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationNode {
    /// Node name
    #[serde(default)]
    pub node: Option<String>,
}

impl MigrationNode {
    /// Endpoint on a known node
    pub fn on(node: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
        }
    }
}

/// Record of the most recent migration attempt of a VM.
///
/// `end_timestamp` and `result` are set together when the attempt reaches
/// Succeeded or Failed. A new attempt replaces the whole value; unset fields
/// serialize as null so a merge patch clears what the previous attempt wrote.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineMigrationState {
    /// Name of the VirtualMachineOperation that owns the attempt
    pub operation: String,

    /// UID of that operation
    pub operation_uid: String,

    /// Orchestration phase
    pub phase: MigrationPhase,

    /// When the attempt began; disks compare their own start against it
    pub start_timestamp: DateTime<Utc>,

    /// When the attempt reached a terminal phase
    #[serde(default)]
    pub end_timestamp: Option<DateTime<Utc>>,

    /// Terminal result
    #[serde(default)]
    pub result: Option<MigrationResult>,

    /// Where the guest ran when the attempt began
    #[serde(default)]
    pub source: MigrationNode,

    /// Where the guest landed
    #[serde(default)]
    pub target: MigrationNode,

    /// Name of the compute migration instance, once created
    #[serde(default)]
    pub instance: Option<String>,

    /// Disks declared for relocation in this attempt
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Target claims the compute migration was started with
    #[serde(default)]
    pub migrated_volumes: Vec<MigratedVolume>,

    /// Human-readable detail, most specific cause on failure
    #[serde(default)]
    pub message: Option<String>,
}

impl VirtualMachineMigrationState {
    /// Fresh attempt in the Migrating phase
    pub fn begin(
        operation: impl Into<String>,
        operation_uid: impl Into<String>,
        source_node: Option<String>,
        volumes: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            operation: operation.into(),
            operation_uid: operation_uid.into(),
            phase: MigrationPhase::Migrating,
            start_timestamp: now,
            end_timestamp: None,
            result: None,
            source: MigrationNode { node: source_node },
            target: MigrationNode::default(),
            instance: None,
            volumes,
            migrated_volumes: Vec::new(),
            message: None,
        }
    }

    /// Whether the attempt has reached Succeeded or Failed
    pub fn is_terminal(&self) -> bool {
        self.end_timestamp.is_some()
    }

    /// Whether this attempt belongs to the given operation
    pub fn is_for(&self, operation: &str) -> bool {
        self.operation == operation
    }

    /// Whether a disk was declared for relocation
    pub fn declares(&self, disk: &str) -> bool {
        self.volumes.iter().any(|v| v == disk)
    }

    /// Whether the compute migration carries the disk's data onto `claim`
    pub fn mirrors(&self, disk: &str, claim: &str) -> bool {
        self.migrated_volumes
            .iter()
            .any(|v| v.name == disk && v.target_claim == claim)
    }

    /// Close the attempt with a result
    pub fn finish(mut self, result: MigrationResult, now: DateTime<Utc>) -> Self {
        self.phase = match result {
            MigrationResult::Succeeded => MigrationPhase::Succeeded,
            MigrationResult::Failed => MigrationPhase::Failed,
        };
        self.result = Some(result);
        self.end_timestamp = Some(now);
        self
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Virtual machine managed by the virtualization platform
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.dev",
    version = "v1alpha1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    namespaced,
    status = "VirtualMachineStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.node"}"#,
    printcolumn = r#"{"name":"Migration","type":"string","jsonPath":".status.migrationState.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Power-state policy
    #[serde(default)]
    pub run_policy: RunPolicy,

    /// Node labels the guest must run on
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Taints the guest tolerates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Ordered boot and data devices
    #[serde(default)]
    pub block_device_refs: Vec<BlockDeviceRef>,
}

/// Status of a VirtualMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: VirtualMachinePhase,

    /// Node the guest currently runs on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Conditions (Running, Migrating, Migratable, FilesystemFrozen, ...)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Most recent migration attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<VirtualMachineMigrationState>,

    /// Generation observed by the controllers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl VirtualMachine {
    /// Lifecycle phase, Pending when no status was written yet
    pub fn phase(&self) -> VirtualMachinePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether the guest is up, including while it moves between nodes
    pub fn is_running(&self) -> bool {
        matches!(
            self.phase(),
            VirtualMachinePhase::Running | VirtualMachinePhase::Migrating
        )
    }

    /// Whether the VM has been marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Current migration attempt, if one was ever recorded
    pub fn migration_state(&self) -> Option<&VirtualMachineMigrationState> {
        self.status.as_ref().and_then(|s| s.migration_state.as_ref())
    }

    /// Attempt that has not yet reached a terminal phase
    pub fn active_migration(&self) -> Option<&VirtualMachineMigrationState> {
        self.migration_state().filter(|m| !m.is_terminal())
    }

    /// Node the guest currently runs on
    pub fn node(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.node.as_deref())
    }

    /// Conditions, empty when no status was written yet
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Names of the VirtualDisks in `blockDeviceRefs`
    pub fn disk_names(&self) -> impl Iterator<Item = &str> {
        self.spec
            .block_device_refs
            .iter()
            .filter(|r| r.kind == BlockDeviceKind::VirtualDisk)
            .map(|r| r.name.as_str())
    }
}
