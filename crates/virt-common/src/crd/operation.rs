//! VirtualMachineOperation CRD types
//!
//! A VirtualMachineOperation (VMOP) is a one-shot request against a VM. The
//! migration controllers only handle Migrate and Evict; power-state types are
//! handled elsewhere.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{find_condition, set_condition, Condition, ConditionKind, ConditionStatus};
use crate::is_false;

/// Kind of operation requested
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OperationType {
    /// Power on
    Start,
    /// Power off
    Stop,
    /// Power cycle
    Restart,
    /// Live-migrate to another node
    Migrate,
    /// Live-migrate off the current node
    Evict,
}

impl OperationType {
    /// Migrate and Evict both move a running guest
    pub fn is_migration(&self) -> bool {
        matches!(self, Self::Migrate | Self::Evict)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::Stop => write!(f, "Stop"),
            Self::Restart => write!(f, "Restart"),
            Self::Migrate => write!(f, "Migrate"),
            Self::Evict => write!(f, "Evict"),
        }
    }
}

/// Phase of a VirtualMachineOperation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OperationPhase {
    /// Accepted but not yet running
    #[default]
    Pending,
    /// Running
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Deleted while running
    Terminating,
}

impl OperationPhase {
    /// Completed and Failed never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Reasons carried by the `Completed` condition of a VMOP
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletedReason {
    /// Compute instance is waiting to be scheduled
    MigrationPending,
    /// Target is being scheduled or prepared
    MigrationPrepareTarget,
    /// Target is ready to receive the guest
    MigrationTargetReady,
    /// Guest memory and disks are moving
    MigrationRunning,
    /// Attempt is rolling back
    MigrationReverting,
    /// Operation succeeded
    OperationCompleted,
    /// Operation failed
    OperationFailed,
    /// Referenced VM does not exist
    VirtualMachineNotFound,
    /// VM is not running
    NotApplicableForVmPhase,
    /// VM run policy forbids migration
    NotApplicableForRunPolicy,
    /// Target node selector is malformed
    InvalidTargetConstraint,
    /// Another migration owns the VM
    OtherMigrationInProgress,
    /// A hotplugged disk can only be opened by one node
    HotplugDisksNotShared,
    /// The compute instance was rejected by a ResourceQuota
    QuotaExceeded,
}

impl CompletedReason {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MigrationPending => "MigrationPending",
            Self::MigrationPrepareTarget => "MigrationPrepareTarget",
            Self::MigrationTargetReady => "MigrationTargetReady",
            Self::MigrationRunning => "MigrationRunning",
            Self::MigrationReverting => "MigrationReverting",
            Self::OperationCompleted => "OperationCompleted",
            Self::OperationFailed => "OperationFailed",
            Self::VirtualMachineNotFound => "VirtualMachineNotFound",
            Self::NotApplicableForVmPhase => "NotApplicableForVMPhase",
            Self::NotApplicableForRunPolicy => "NotApplicableForRunPolicy",
            Self::InvalidTargetConstraint => "InvalidTargetConstraint",
            Self::OtherMigrationInProgress => "OtherMigrationInProgress",
            Self::HotplugDisksNotShared => "HotplugDisksNotShared",
            Self::QuotaExceeded => "QuotaExceeded",
        }
    }
}

impl std::fmt::Display for CompletedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason of `SignalSent=True`
pub const SIGNAL_SENT_SUCCESS: &str = "SignalSentSuccess";

/// Migrate-specific parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrateSpec {
    /// Extra node labels the target must carry; passed through verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Operation request against a virtual machine
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.dev",
    version = "v1alpha1",
    kind = "VirtualMachineOperation",
    plural = "virtualmachineoperations",
    shortname = "vmop",
    namespaced,
    status = "VirtualMachineOperationStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"VirtualMachine","type":"string","jsonPath":".spec.virtualMachine"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineOperationSpec {
    /// Kind of operation
    #[serde(rename = "type")]
    pub type_: OperationType,

    /// Name of the target VM in the same namespace
    pub virtual_machine: String,

    /// Skip graceful steps where the operation type allows it
    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,

    /// Migrate parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate: Option<MigrateSpec>,
}

impl VirtualMachineOperationSpec {
    /// Extra node selector requested for the target, empty when none
    pub fn target_selector(&self) -> BTreeMap<String, String> {
        self.migrate
            .as_ref()
            .map(|m| m.node_selector.clone())
            .unwrap_or_default()
    }
}

/// Status of a VirtualMachineOperation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineOperationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: OperationPhase,

    /// Conditions (Completed, SignalSent)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation observed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl VirtualMachineOperationStatus {
    /// Create a status with the given phase
    pub fn with_phase(phase: OperationPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: OperationPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Insert or replace a condition, keeping its transition time when the status is unchanged
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Set the `Completed` condition
    pub fn completed(
        self,
        status: ConditionStatus,
        reason: CompletedReason,
        message: impl Into<String>,
    ) -> Self {
        self.condition(Condition::new(
            ConditionKind::Completed,
            status,
            reason.as_str(),
            message,
        ))
    }

    /// Set the observed generation
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

impl VirtualMachineOperation {
    /// Current phase, Pending when no status was written yet
    pub fn phase(&self) -> OperationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether the operation reached Completed or Failed
    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Whether the operation has been marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Conditions, empty when no status was written yet
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Whether the request has been handed to the orchestrator
    pub fn signal_sent(&self) -> bool {
        find_condition(self.conditions(), ConditionKind::SignalSent)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Whether this operation is a Migrate or Evict
    pub fn is_migration(&self) -> bool {
        self.spec.type_.is_migration()
    }

    /// Whether the finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }
}
