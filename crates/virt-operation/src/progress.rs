//! Mirrors an attempt's progress onto its operation
//!
//! The operation never drives anything after admission. Its phase and
//! `Completed` condition are a projection of the VM's attempt record and the
//! compute instance, recomputed from scratch on every pass.

use kube::ResourceExt;

use virt_common::crd::{
    CompletedReason, ConditionStatus, InstanceMigrationPhase, MigrationPhase, MigrationResult,
    OperationPhase, VirtualMachine, VirtualMachineMigrationState, VirtualMachineOperation,
    VirtualMachineOperationStatus,
};
use virt_compute::ComputeObservation;

/// The VM's attempt if it belongs to this operation
pub fn own_attempt<'a>(
    operation: &VirtualMachineOperation,
    vm: &'a VirtualMachine,
) -> Option<&'a VirtualMachineMigrationState> {
    let uid = operation.uid();
    vm.migration_state().filter(|a| {
        a.is_for(&operation.name_any()) && uid.as_deref() == Some(a.operation_uid.as_str())
    })
}

/// Status the operation should carry for the observed attempt
///
/// Conditions other than `Completed` (notably `SignalSent`) are carried over
/// from the current status.
pub fn sync_progress(
    operation: &VirtualMachineOperation,
    vm: Option<&VirtualMachine>,
    observation: Option<&ComputeObservation>,
) -> VirtualMachineOperationStatus {
    let base = operation
        .status
        .clone()
        .unwrap_or_default()
        .observed_generation(operation.metadata.generation);

    let Some(vm) = vm else {
        return base.phase(OperationPhase::Failed).completed(
            ConditionStatus::False,
            CompletedReason::OperationFailed,
            format!(
                "Virtual machine {} disappeared during migration.",
                operation.spec.virtual_machine
            ),
        );
    };
    let Some(attempt) = own_attempt(operation, vm) else {
        return base.phase(OperationPhase::Failed).completed(
            ConditionStatus::False,
            CompletedReason::OperationFailed,
            "Migration attempt was superseded by another operation.",
        );
    };

    match (attempt.phase, attempt.result) {
        (_, Some(MigrationResult::Succeeded)) => base.phase(OperationPhase::Completed).completed(
            ConditionStatus::True,
            CompletedReason::OperationCompleted,
            attempt.message.clone().unwrap_or_default(),
        ),
        (_, Some(MigrationResult::Failed)) => base.phase(OperationPhase::Failed).completed(
            ConditionStatus::False,
            CompletedReason::OperationFailed,
            attempt
                .message
                .clone()
                .unwrap_or_else(|| "Migration failed.".to_string()),
        ),
        (MigrationPhase::Reverting, None) => base.phase(OperationPhase::InProgress).completed(
            ConditionStatus::False,
            CompletedReason::MigrationReverting,
            attempt.message.clone().unwrap_or_default(),
        ),
        _ => compute_progress(base, observation),
    }
}

fn compute_progress(
    base: VirtualMachineOperationStatus,
    observation: Option<&ComputeObservation>,
) -> VirtualMachineOperationStatus {
    if let Some(message) = observation.and_then(|o| o.quota_rejected.as_deref()) {
        return base.phase(OperationPhase::Pending).completed(
            ConditionStatus::False,
            CompletedReason::QuotaExceeded,
            message,
        );
    }

    let detail = observation.and_then(|o| o.detail_phase);
    let (phase, reason) = match detail {
        None | Some(InstanceMigrationPhase::Pending) => {
            (OperationPhase::Pending, CompletedReason::MigrationPending)
        }
        Some(
            InstanceMigrationPhase::Scheduling
            | InstanceMigrationPhase::Scheduled
            | InstanceMigrationPhase::PreparingTarget,
        ) => (
            OperationPhase::InProgress,
            CompletedReason::MigrationPrepareTarget,
        ),
        Some(InstanceMigrationPhase::TargetReady) => (
            OperationPhase::InProgress,
            CompletedReason::MigrationTargetReady,
        ),
        // Compute finished but the attempt has not resolved yet.
        Some(
            InstanceMigrationPhase::Running
            | InstanceMigrationPhase::Succeeded
            | InstanceMigrationPhase::Failed,
        ) => (OperationPhase::InProgress, CompletedReason::MigrationRunning),
    };

    let message = match observation.and_then(|o| o.unschedulable.as_deref()) {
        Some(why) if reason == CompletedReason::MigrationPending => {
            format!("Target node cannot be scheduled: {why}")
        }
        _ => String::new(),
    };
    base.phase(phase)
        .completed(ConditionStatus::False, reason, message)
}
