//! Orchestration state machine
//!
//! ```text
//! Idle ─▶ Validating ─▶ Migrating ─┬─▶ Settling ─▶ Succeeded
//!                                  └─▶ Reverting ─▶ Failed
//! ```
//!
//! Validating is the operation handler's admission window and is never
//! recorded; every other state is read straight from the VM's
//! `migrationState`. [`determine_step`] is a pure function of the observed
//! VM, operation, compute instance and disks.
//!
//! When disks relocate, compute starts only once every declared target is
//! ready, and the instance carries those targets so the hypervisor mirrors
//! the guest's writes into them.

use virt_common::crd::{
    is_condition_true, ConditionKind, MigrationPhase, MigrationResult, VirtualDisk,
    VirtualMachineMigrationState,
};
use virt_compute::{AbortState, ComputeObservation};

/// Where an attempt stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchestrationState {
    /// No attempt recorded
    Idle,
    /// Operation accepted, preconditions being checked
    Validating,
    /// Compute and storage moving
    Migrating,
    /// Compute landed, disks promoting
    Settling,
    /// Everything on the target
    Succeeded,
    /// Rolling back
    Reverting,
    /// Everything back on the source
    Failed,
}

impl OrchestrationState {
    /// State recorded on a VM
    pub fn of(attempt: Option<&VirtualMachineMigrationState>) -> Self {
        match attempt.map(|a| a.phase) {
            None => Self::Idle,
            Some(MigrationPhase::Migrating) => Self::Migrating,
            Some(MigrationPhase::Settling) => Self::Settling,
            Some(MigrationPhase::Reverting) => Self::Reverting,
            Some(MigrationPhase::Succeeded) => Self::Succeeded,
            Some(MigrationPhase::Failed) => Self::Failed,
        }
    }
}

impl std::fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Validating => write!(f, "Validating"),
            Self::Migrating => write!(f, "Migrating"),
            Self::Settling => write!(f, "Settling"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Reverting => write!(f, "Reverting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// How the owning operation looks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationPresence {
    /// Present and not being deleted
    Present,
    /// Marked for deletion
    Deleting,
    /// Gone, or replaced by a different object with the same name
    Missing,
}

/// Progress of one declared disk in the current attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskProgress {
    /// Disk object is gone
    Missing,
    /// No record for this attempt yet
    NotStarted,
    /// Target created; `target_ready` once the target can receive data
    Copying {
        /// `Migrating=True` on the disk
        target_ready: bool,
    },
    /// Promoted to the target
    Succeeded,
    /// Stayed on the source
    Failed {
        /// Disk-side reason
        message: Option<String>,
    },
}

impl DiskProgress {
    /// Read a disk's progress against an attempt
    pub fn of(disk: Option<&VirtualDisk>, attempt: &VirtualMachineMigrationState) -> Self {
        let Some(disk) = disk else {
            return Self::Missing;
        };
        match disk
            .migration_state()
            .filter(|r| r.belongs_to(attempt.start_timestamp))
        {
            None => Self::NotStarted,
            Some(r) if r.is_in_progress() => Self::Copying {
                target_ready: is_condition_true(disk.conditions(), ConditionKind::Migrating),
            },
            Some(r) if r.result == Some(MigrationResult::Succeeded) => Self::Succeeded,
            Some(r) => Self::Failed {
                message: r.message.clone(),
            },
        }
    }

    /// Whether the disk will not move any more in this attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Missing | Self::Succeeded | Self::Failed { .. }
        )
    }

    fn ready_to_settle(&self) -> bool {
        self.is_terminal() || matches!(self, Self::Copying { target_ready: true })
    }

    fn ready_to_mirror(&self) -> bool {
        matches!(self, Self::Missing | Self::Copying { target_ready: true })
    }
}

/// Everything [`determine_step`] looks at
#[derive(Clone, Debug)]
pub struct OrchestrationInput<'a> {
    /// The VM's attempt record
    pub attempt: Option<&'a VirtualMachineMigrationState>,
    /// VM phase is Running or Migrating
    pub vm_running: bool,
    /// VM is marked for deletion
    pub vm_deleting: bool,
    /// Owning operation
    pub operation: OperationPresence,
    /// Compute side, None when no instance exists
    pub compute: Option<ComputeObservation>,
    /// Declared disks, in declaration order
    pub disks: Vec<(String, DiskProgress)>,
}

/// What the orchestrator should do on this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrchestrationStep {
    /// No attempt to drive
    Idle,
    /// Attempt is terminal; nothing to write
    Done,
    /// Nothing changed that allows progress
    Wait,
    /// Start (or adopt) the compute migration and record it on the attempt
    StartCompute,
    /// Migrating → Settling, recording where the guest landed
    Settle {
        /// Node the guest landed on
        target_node: Option<String>,
    },
    /// Migrating → Reverting with the most specific cause
    Revert {
        /// Cause
        message: String,
    },
    /// Still Reverting; the compute side has not seen the abort yet
    RequestAbort,
    /// Settling → Succeeded
    Succeed {
        /// Declared disks that stayed on their source
        stayed_on_source: Vec<String>,
    },
    /// Reverting → Failed
    Fail {
        /// Cause
        message: String,
    },
}

/// Fallback cause when nothing more specific was recorded
pub const GENERIC_FAILURE: &str = "Migration failed.";

/// Cause when the instance recorded for the attempt disappeared
pub const INSTANCE_LOST: &str = "Compute migration disappeared.";

/// Decide the next step for an attempt
pub fn determine_step(input: &OrchestrationInput<'_>) -> OrchestrationStep {
    let Some(attempt) = input.attempt else {
        return OrchestrationStep::Idle;
    };

    match attempt.phase {
        MigrationPhase::Succeeded | MigrationPhase::Failed => OrchestrationStep::Done,
        MigrationPhase::Migrating => migrating_step(attempt, input),
        MigrationPhase::Settling => {
            if input.disks.iter().all(|(_, d)| d.is_terminal()) {
                OrchestrationStep::Succeed {
                    stayed_on_source: input
                        .disks
                        .iter()
                        .filter(|(_, d)| matches!(d, DiskProgress::Failed { .. }))
                        .map(|(name, _)| name.clone())
                        .collect(),
                }
            } else {
                OrchestrationStep::Wait
            }
        }
        MigrationPhase::Reverting => {
            let compute_settled = input
                .compute
                .as_ref()
                .map_or(true, ComputeObservation::is_settled);
            let disks_settled = input
                .disks
                .iter()
                .all(|(_, d)| !matches!(d, DiskProgress::Copying { .. }));
            if compute_settled && disks_settled {
                OrchestrationStep::Fail {
                    message: attempt
                        .message
                        .clone()
                        .unwrap_or_else(|| GENERIC_FAILURE.to_string()),
                }
            } else if input
                .compute
                .as_ref()
                .is_some_and(|c| c.abort == AbortState::NotRequested && !c.is_settled())
            {
                OrchestrationStep::RequestAbort
            } else {
                OrchestrationStep::Wait
            }
        }
    }
}

fn migrating_step(
    attempt: &VirtualMachineMigrationState,
    input: &OrchestrationInput<'_>,
) -> OrchestrationStep {
    // An instance the attempt has not recorded yet is recorded before anything
    // else, so the attempt knows which targets it mirrors.
    if attempt.instance.is_none() && input.compute.is_some() {
        return OrchestrationStep::StartCompute;
    }

    // Once the guest runs on the target nothing rolls it back.
    if let Some(compute) = input.compute.as_ref().filter(|c| c.completed_genuinely()) {
        return if input.disks.iter().all(|(_, d)| d.ready_to_settle()) {
            OrchestrationStep::Settle {
                target_node: compute.target_node.clone(),
            }
        } else {
            OrchestrationStep::Wait
        };
    }

    if let Some(message) = revert_cause(attempt, input) {
        return OrchestrationStep::Revert { message };
    }
    if attempt.instance.is_none() && input.disks.iter().all(|(_, d)| d.ready_to_mirror()) {
        return OrchestrationStep::StartCompute;
    }
    OrchestrationStep::Wait
}

fn revert_cause(
    attempt: &VirtualMachineMigrationState,
    input: &OrchestrationInput<'_>,
) -> Option<String> {
    match input.operation {
        OperationPresence::Missing => {
            return Some(format!("Operation {} no longer exists.", attempt.operation))
        }
        OperationPresence::Deleting => return Some("Migration cancelled.".to_string()),
        OperationPresence::Present => {}
    }
    if input.vm_deleting {
        return Some("Virtual machine is being deleted.".to_string());
    }
    if !input.vm_running {
        return Some("Virtual machine stopped during migration.".to_string());
    }
    match &input.compute {
        Some(compute) if compute.failed_or_aborted() => return Some(compute.failure_message()),
        None if attempt.instance.is_some() => return Some(INSTANCE_LOST.to_string()),
        _ => {}
    }
    input.disks.iter().find_map(|(name, d)| match d {
        DiskProgress::Failed { message } => Some(match message {
            Some(m) => format!("Disk {name} migration failed: {m}"),
            None => format!("Disk {name} migration failed."),
        }),
        _ => None,
    })
}
