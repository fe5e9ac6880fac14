//! Point-in-time view of a compute migration instance
//!
//! Derived purely from the instance object (plus the target pod's scheduling
//! verdict). All orchestration decisions about the compute side go through
//! this type, never through the raw instance status.

use virt_common::crd::{
    AbortStatus, ConditionStatus, InstanceMigrationPhase, VirtualMachineInstanceMigration,
    REJECTED_BY_RESOURCE_QUOTA,
};

/// Coarse progress of the compute side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputePhase {
    /// Not yet picked up by the hypervisor layer
    Pending,
    /// Target is being prepared or memory is moving
    Running,
    /// Guest runs on the target
    Succeeded,
    /// Guest stayed on the source
    Failed,
}

/// Outcome of a settled abort
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortOutcome {
    /// Migration stopped; guest stayed on the source
    Succeeded,
    /// Migration could not be stopped
    Failed,
}

/// Abort progress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortState {
    /// Nobody asked to abort
    NotRequested,
    /// Abort asked for and in flight
    Requested,
    /// Abort finished one way or the other
    Settled(AbortOutcome),
}

/// Observation of one compute migration instance
#[derive(Clone, Debug, PartialEq)]
pub struct ComputeObservation {
    /// Instance name
    pub instance: String,
    /// Coarse phase
    pub phase: ComputePhase,
    /// Raw phase as reported; None until picked up
    pub detail_phase: Option<InstanceMigrationPhase>,
    /// Abort progress
    pub abort: AbortState,
    /// Node the guest lands on
    pub target_node: Option<String>,
    /// Why the hypervisor layer failed the migration
    pub failure_reason: Option<String>,
    /// Message of the ResourceQuota rejection, if any
    pub quota_rejected: Option<String>,
    /// Why the target pod cannot be scheduled, if it cannot
    pub unschedulable: Option<String>,
}

impl ComputeObservation {
    /// Build an observation from an instance and the target pod's scheduling verdict
    pub fn from_instance(
        instance: &VirtualMachineInstanceMigration,
        unschedulable: Option<String>,
    ) -> Self {
        let detail_phase = instance.phase();
        let phase = match detail_phase {
            None | Some(InstanceMigrationPhase::Pending) => ComputePhase::Pending,
            Some(InstanceMigrationPhase::Succeeded) => ComputePhase::Succeeded,
            Some(InstanceMigrationPhase::Failed) => ComputePhase::Failed,
            Some(_) => ComputePhase::Running,
        };

        let state = instance.migration_state();
        let abort = match state.and_then(|s| s.abort_status) {
            Some(AbortStatus::Succeeded) => AbortState::Settled(AbortOutcome::Succeeded),
            Some(AbortStatus::Failed) => AbortState::Settled(AbortOutcome::Failed),
            Some(AbortStatus::InProgress) => AbortState::Requested,
            None if instance.spec.abort_requested => AbortState::Requested,
            None => AbortState::NotRequested,
        };

        let quota_rejected = instance
            .condition(REJECTED_BY_RESOURCE_QUOTA)
            .filter(|c| c.status == ConditionStatus::True)
            .map(|c| {
                c.message
                    .clone()
                    .unwrap_or_else(|| "rejected by resource quota".to_string())
            });

        Self {
            instance: instance.metadata.name.clone().unwrap_or_default(),
            phase,
            detail_phase,
            abort,
            target_node: state.and_then(|s| s.target_node.clone()),
            failure_reason: state.and_then(|s| s.failure_reason.clone()),
            quota_rejected,
            unschedulable,
        }
    }

    /// Whether the compute side will not move any more
    ///
    /// A terminal phase is final whatever was asked of the instance: an abort
    /// that lost the race to a finished migration never settles on its own.
    pub fn is_settled(&self) -> bool {
        matches!(self.abort, AbortState::Settled(_))
            || matches!(self.phase, ComputePhase::Succeeded | ComputePhase::Failed)
    }

    /// Succeeded without anyone asking to abort; the only outcome that promotes a VM
    pub fn completed_genuinely(&self) -> bool {
        self.phase == ComputePhase::Succeeded && self.abort == AbortState::NotRequested
    }

    /// Failed, or an abort was asked for
    pub fn failed_or_aborted(&self) -> bool {
        self.phase == ComputePhase::Failed || self.abort != AbortState::NotRequested
    }

    /// Most specific description of a compute-side failure
    pub fn failure_message(&self) -> String {
        match (&self.failure_reason, self.abort) {
            (Some(reason), _) => format!("Compute migration failed: {reason}"),
            (None, AbortState::NotRequested) => "Compute migration failed".to_string(),
            (None, _) => "Compute migration aborted".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virt_common::crd::{
        InstanceCondition, InstanceMigrationState, VirtualMachineInstanceMigrationSpec,
        VirtualMachineInstanceMigrationStatus,
    };

    fn instance(
        phase: Option<InstanceMigrationPhase>,
        abort_requested: bool,
        abort_status: Option<AbortStatus>,
    ) -> VirtualMachineInstanceMigration {
        let mut i = VirtualMachineInstanceMigration::new(
            "vmop-move",
            VirtualMachineInstanceMigrationSpec {
                vmi_name: "vm".into(),
                added_node_selector: None,
                abort_requested,
                volumes: vec![],
            },
        );
        i.status = Some(VirtualMachineInstanceMigrationStatus {
            phase,
            conditions: vec![],
            migration_state: Some(InstanceMigrationState {
                target_node: Some("node-b".into()),
                abort_status,
                ..Default::default()
            }),
        });
        i
    }

    #[test]
    fn coarse_phase_mapping() {
        let cases = [
            (None, ComputePhase::Pending),
            (Some(InstanceMigrationPhase::Pending), ComputePhase::Pending),
            (Some(InstanceMigrationPhase::Scheduling), ComputePhase::Running),
            (Some(InstanceMigrationPhase::TargetReady), ComputePhase::Running),
            (Some(InstanceMigrationPhase::Running), ComputePhase::Running),
            (Some(InstanceMigrationPhase::Succeeded), ComputePhase::Succeeded),
            (Some(InstanceMigrationPhase::Failed), ComputePhase::Failed),
        ];
        for (raw, expected) in cases {
            let obs = ComputeObservation::from_instance(&instance(raw, false, None), None);
            assert_eq!(obs.phase, expected, "raw phase {raw:?}");
        }
    }

    #[test]
    fn genuine_success_promotes() {
        let obs = ComputeObservation::from_instance(
            &instance(Some(InstanceMigrationPhase::Succeeded), false, None),
            None,
        );
        assert!(obs.is_settled());
        assert!(obs.completed_genuinely());
        assert!(!obs.failed_or_aborted());
        assert_eq!(obs.target_node.as_deref(), Some("node-b"));
    }

    /// Story: an abort is requested just as the guest lands. The instance
    /// ends Succeeded with no abort status. It is settled, so a reverting
    /// attempt can close, but it is not a genuine success.
    #[test]
    fn success_after_abort_request_is_settled_but_not_genuine() {
        let obs = ComputeObservation::from_instance(
            &instance(Some(InstanceMigrationPhase::Succeeded), true, None),
            None,
        );
        assert_eq!(obs.abort, AbortState::Requested);
        assert!(!obs.completed_genuinely());
        assert!(obs.is_settled());
        assert!(obs.failed_or_aborted());
    }

    #[test]
    fn requested_abort_settles_on_failed_phase_or_abort_status() {
        let running = ComputeObservation::from_instance(
            &instance(Some(InstanceMigrationPhase::Running), true, Some(AbortStatus::InProgress)),
            None,
        );
        assert!(!running.is_settled());

        let failed = ComputeObservation::from_instance(
            &instance(Some(InstanceMigrationPhase::Failed), true, None),
            None,
        );
        assert!(failed.is_settled());

        let aborted = ComputeObservation::from_instance(
            &instance(Some(InstanceMigrationPhase::Running), true, Some(AbortStatus::Succeeded)),
            None,
        );
        assert_eq!(aborted.abort, AbortState::Settled(AbortOutcome::Succeeded));
        assert!(aborted.is_settled());
        assert_eq!(aborted.failure_message(), "Compute migration aborted");
    }

    #[test]
    fn pending_without_abort_is_not_settled() {
        let obs = ComputeObservation::from_instance(
            &instance(None, false, None),
            Some("0/3 nodes are available".into()),
        );
        assert!(!obs.is_settled());
        assert_eq!(obs.unschedulable.as_deref(), Some("0/3 nodes are available"));
    }

    #[test]
    fn quota_rejection_is_read_from_condition() {
        let mut i = instance(Some(InstanceMigrationPhase::Pending), false, None);
        if let Some(s) = i.status.as_mut() {
            s.conditions.push(InstanceCondition {
                type_: REJECTED_BY_RESOURCE_QUOTA.into(),
                status: ConditionStatus::True,
                reason: None,
                message: Some("exceeded quota: compute".into()),
            });
        }
        let obs = ComputeObservation::from_instance(&i, None);
        assert_eq!(obs.quota_rejected.as_deref(), Some("exceeded quota: compute"));
    }

    #[test]
    fn failure_reason_is_most_specific() {
        let mut i = instance(Some(InstanceMigrationPhase::Failed), false, None);
        if let Some(state) = i
            .status
            .as_mut()
            .and_then(|s| s.migration_state.as_mut())
        {
            state.failure_reason = Some("target pod crashed".into());
        }
        let obs = ComputeObservation::from_instance(&i, None);
        assert_eq!(
            obs.failure_message(),
            "Compute migration failed: target pod crashed"
        );
    }
}
