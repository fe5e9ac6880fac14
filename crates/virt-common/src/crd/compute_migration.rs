//! Compute migration instance (`kubevirt.io/v1` VirtualMachineInstanceMigration)
//!
//! Owned by the hypervisor layer. The controllers create it, read its
//! progress and request abort; its CRD is installed by that layer, never by
//! this operator.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ConditionStatus;
use crate::is_false;

/// Condition type set when a ResourceQuota rejected the target pod
pub const REJECTED_BY_RESOURCE_QUOTA: &str = "RejectedByResourceQuota";

/// Label the hypervisor layer puts on the target pod
pub const MIGRATION_JOB_UID_LABEL: &str = "kubevirt.io/migrationJobUID";

/// Detailed phase reported by the hypervisor layer
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstanceMigrationPhase {
    /// Created, not yet picked up
    Pending,
    /// Target pod is being scheduled
    Scheduling,
    /// Target pod is scheduled
    Scheduled,
    /// Target pod is starting
    PreparingTarget,
    /// Target can receive the guest
    TargetReady,
    /// Memory is being transferred
    Running,
    /// Guest runs on the target
    Succeeded,
    /// Guest stayed on the source
    Failed,
}

impl std::fmt::Display for InstanceMigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Scheduling => write!(f, "Scheduling"),
            Self::Scheduled => write!(f, "Scheduled"),
            Self::PreparingTarget => write!(f, "PreparingTarget"),
            Self::TargetReady => write!(f, "TargetReady"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Progress of a requested abort
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AbortStatus {
    /// Abort is being carried out
    InProgress,
    /// Abort finished; the guest stayed on the source
    Succeeded,
    /// Abort could not stop the migration
    Failed,
}

/// Condition reported by the hypervisor layer
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,
    /// Condition status
    pub status: ConditionStatus,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Live progress of the compute migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMigrationState {
    /// Node the guest leaves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,
    /// Node the guest lands on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
    /// Pod hosting the guest on the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pod: Option<String>,
    /// Progress of a requested abort
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_status: Option<AbortStatus>,
    /// Why the migration failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// A guest volume whose block data the migration mirrors onto a new claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigratedVolume {
    /// Disk name as the guest sees it
    pub name: String,
    /// Claim the guest reads from on the source
    pub source_claim: String,
    /// Claim the guest writes to on the target
    pub target_claim: String,
}

/// Request to live-migrate a running guest
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstanceMigration",
    plural = "virtualmachineinstancemigrations",
    namespaced,
    status = "VirtualMachineInstanceMigrationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceMigrationSpec {
    /// Running instance to move
    pub vmi_name: String,

    /// Node labels added to the guest's own selector for the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_node_selector: Option<BTreeMap<String, String>>,

    /// Set to stop the migration and keep the guest on the source
    #[serde(default, skip_serializing_if = "is_false")]
    pub abort_requested: bool,

    /// Volumes copied alongside memory; empty moves compute only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<MigratedVolume>,
}

/// Status of a VirtualMachineInstanceMigration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceMigrationStatus {
    /// Detailed phase; unset until picked up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<InstanceMigrationPhase>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<InstanceCondition>,

    /// Live progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<InstanceMigrationState>,
}

impl VirtualMachineInstanceMigration {
    /// Detailed phase; None until the hypervisor layer picks the instance up
    pub fn phase(&self) -> Option<InstanceMigrationPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Whether the migration finished one way or the other
    pub fn is_final(&self) -> bool {
        matches!(
            self.phase(),
            Some(InstanceMigrationPhase::Succeeded | InstanceMigrationPhase::Failed)
        )
    }

    /// Live progress
    pub fn migration_state(&self) -> Option<&InstanceMigrationState> {
        self.status.as_ref().and_then(|s| s.migration_state.as_ref())
    }

    /// Condition with the given type
    pub fn condition(&self, type_: &str) -> Option<&InstanceCondition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_hypervisor_status() {
        let instance: VirtualMachineInstanceMigration = serde_json::from_value(serde_json::json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachineInstanceMigration",
            "metadata": {"name": "vmop-move", "namespace": "default"},
            "spec": {"vmiName": "vm-a"},
            "status": {
                "phase": "Running",
                "conditions": [{"type": "RejectedByResourceQuota", "status": "False"}],
                "migrationState": {"sourceNode": "n1", "targetNode": "n2", "abortStatus": "InProgress"}
            }
        }))
        .unwrap();

        assert_eq!(instance.phase(), Some(InstanceMigrationPhase::Running));
        assert!(!instance.is_final());
        assert!(!instance.spec.abort_requested);
        let state = instance.migration_state().unwrap();
        assert_eq!(state.target_node.as_deref(), Some("n2"));
        assert_eq!(state.abort_status, Some(AbortStatus::InProgress));
        assert_eq!(
            instance.condition(REJECTED_BY_RESOURCE_QUOTA).map(|c| c.status),
            Some(ConditionStatus::False)
        );
    }

    #[test]
    fn unset_phase_is_not_final() {
        let instance = VirtualMachineInstanceMigration::new(
            "vmop-move",
            VirtualMachineInstanceMigrationSpec {
                vmi_name: "vm-a".into(),
                ..Default::default()
            },
        );
        assert_eq!(instance.phase(), None);
        assert!(!instance.is_final());
    }

    #[test]
    fn mirrored_volumes_serialize_only_when_present() {
        let mut spec = VirtualMachineInstanceMigrationSpec {
            vmi_name: "vm-a".into(),
            ..Default::default()
        };
        let bare = serde_json::to_value(&spec).unwrap();
        assert!(bare.get("volumes").is_none());

        spec.volumes.push(MigratedVolume {
            name: "data".into(),
            source_claim: "vd-src".into(),
            target_claim: "vd-dst".into(),
        });
        let wired = serde_json::to_value(&spec).unwrap();
        assert_eq!(wired["volumes"][0]["targetClaim"], "vd-dst");
    }
}
