//! Migration fan-out
//!
//! [`Orchestrator::begin`] is the only place an attempt starts. It records the
//! attempt on the VM first, so disk coordinators see the declared volumes
//! before the compute side moves. An attempt without disks to relocate starts
//! the compute instance right away; otherwise [`Orchestrator::start_compute`]
//! runs once every declared target is ready, wiring those targets into the
//! instance.
//!
//! Every write of the attempt here is guarded by the VM's resourceVersion.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use virt_common::crd::{
    set_condition, Condition, ConditionKind, ConditionStatus, MigratedVolume, MigrationPhase,
    OperationType, VirtualMachine, VirtualMachineInstanceMigration,
    VirtualMachineMigrationState, VirtualMachineOperation,
};
use virt_common::events::{actions, reasons, EventPublisher};
use virt_common::metrics::record_migration_started;
use virt_compute::{ComputeMigrationDriver, ComputeObservation};

use crate::client::{KubeClient, VmStatusPatch};
use crate::controller::condition_reasons::MIGRATION_IN_PROGRESS;
use crate::error::OrchestratorError;

/// Starts migration attempts
///
/// Held by the operation handler as a trait object so its tests can mock it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MigrationOrchestrator: Send + Sync {
    /// Begin (or resume) the attempt for an operation
    ///
    /// Returns the compute side once it runs. None means compute is not
    /// started yet because declared disks are still preparing their targets.
    async fn begin(
        &self,
        vm: &VirtualMachine,
        operation: &VirtualMachineOperation,
    ) -> Result<Option<ComputeObservation>, OrchestratorError>;
}

/// Production orchestrator
pub struct Orchestrator {
    kube: Arc<dyn KubeClient>,
    compute: Arc<dyn ComputeMigrationDriver>,
    events: Arc<dyn EventPublisher>,
}

impl Orchestrator {
    /// Create an orchestrator over the given clients
    pub fn new(
        kube: Arc<dyn KubeClient>,
        compute: Arc<dyn ComputeMigrationDriver>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            compute,
            events,
        }
    }

    /// Disks of the VM whose backing has to move with the guest
    async fn volumes_to_relocate(
        &self,
        namespace: &str,
        vm: &VirtualMachine,
    ) -> Result<Vec<String>, OrchestratorError> {
        let vm_name = vm.name_any();
        let hotplugged: HashSet<String> = self
            .kube
            .list_attachments(namespace)
            .await?
            .iter()
            .filter(|a| a.spec.virtual_machine_name == vm_name)
            .filter_map(|a| a.disk_name().map(str::to_string))
            .collect();

        let mut volumes = Vec::new();
        for name in vm.disk_names() {
            if hotplugged.contains(name) {
                continue;
            }
            let Some(disk) = self.kube.get_disk(namespace, name).await? else {
                debug!(disk = %name, "declared disk not found, not relocating");
                continue;
            };
            if disk.storage_class_changed() || disk.is_single_node() {
                volumes.push(name.to_string());
            }
        }
        Ok(volumes)
    }

    /// Write the attempt record, failing with a conflict if the VM moved on
    async fn record(
        &self,
        vm: &VirtualMachine,
        patch: &VmStatusPatch,
    ) -> Result<VirtualMachine, OrchestratorError> {
        self.kube
            .record_attempt(vm, patch)
            .await
            .map_err(|e| OrchestratorError::attempt_write(e, &vm.name_any()))
    }

    /// Create the compute instance for a recorded attempt and record it
    ///
    /// `volumes` are the disk targets the instance mirrors; an instance that
    /// already exists keeps the volumes it was created with.
    pub async fn start_compute(
        &self,
        vm: &VirtualMachine,
        operation: &VirtualMachineOperation,
        attempt: &VirtualMachineMigrationState,
        volumes: &[MigratedVolume],
    ) -> Result<ComputeObservation, OrchestratorError> {
        let instance = self
            .compute
            .start_migration(vm, operation, &operation.spec.target_selector(), volumes)
            .await?;
        self.record_instance(vm, attempt, &instance).await?;
        Ok(self.compute.observe(&instance).await?)
    }

    /// Record an instance, and the targets it mirrors, on the attempt
    pub async fn record_instance(
        &self,
        vm: &VirtualMachine,
        attempt: &VirtualMachineMigrationState,
        instance: &VirtualMachineInstanceMigration,
    ) -> Result<(), OrchestratorError> {
        let name = instance.name_any();
        if attempt.instance.as_deref() == Some(name.as_str())
            && attempt.migrated_volumes == instance.spec.volumes
        {
            return Ok(());
        }
        let mut recorded = attempt.clone();
        recorded.instance = Some(name.clone());
        recorded.migrated_volumes = instance.spec.volumes.clone();
        self.record(vm, &VmStatusPatch::attempt(recorded)).await?;
        info!(
            instance = %name,
            volumes = instance.spec.volumes.len(),
            "compute instance recorded"
        );
        Ok(())
    }
}

fn operation_type_label(operation: &VirtualMachineOperation) -> &'static str {
    match operation.spec.type_ {
        OperationType::Evict => "evict",
        _ => "migrate",
    }
}

#[async_trait]
impl MigrationOrchestrator for Orchestrator {
    #[instrument(skip(self, vm, operation), fields(vm = %vm.name_any(), vmop = %operation.name_any()))]
    async fn begin(
        &self,
        vm: &VirtualMachine,
        operation: &VirtualMachineOperation,
    ) -> Result<Option<ComputeObservation>, OrchestratorError> {
        let namespace = vm.namespace().ok_or(OrchestratorError::MissingNamespace)?;
        let vm_name = vm.name_any();
        let op_name = operation.name_any();
        let op_uid = operation
            .uid()
            .ok_or_else(|| OrchestratorError::MissingUid(op_name.clone()))?;

        let existing = vm
            .migration_state()
            .filter(|a| a.is_for(&op_name) && a.operation_uid == op_uid);

        let (current, attempt) = match existing {
            Some(a) if a.is_terminal() => {
                return Err(OrchestratorError::AttemptFinished {
                    operation: op_name,
                    vm: vm_name,
                })
            }
            Some(a) => {
                debug!(phase = %a.phase, "attempt already recorded, resuming");
                (vm.clone(), a.clone())
            }
            None => {
                let volumes = self.volumes_to_relocate(&namespace, vm).await?;
                let attempt = VirtualMachineMigrationState::begin(
                    &op_name,
                    &op_uid,
                    vm.node().map(str::to_string),
                    volumes,
                    Utc::now(),
                );

                let mut conditions = vm.conditions().to_vec();
                set_condition(
                    &mut conditions,
                    Condition::new(
                        ConditionKind::Migrating,
                        ConditionStatus::True,
                        MIGRATION_IN_PROGRESS,
                        format!("Migration requested by {op_name}."),
                    ),
                );
                let written = self
                    .record(
                        vm,
                        &VmStatusPatch {
                            migration_state: Some(attempt.clone()),
                            conditions: Some(conditions),
                            ..Default::default()
                        },
                    )
                    .await?;

                info!(volumes = ?attempt.volumes, "migration attempt recorded");
                record_migration_started(operation_type_label(operation));
                let note = if attempt.volumes.is_empty() {
                    format!("Migration started by {op_name}.")
                } else {
                    format!(
                        "Migration started by {op_name}, relocating disks: {}.",
                        attempt.volumes.join(", ")
                    )
                };
                self.events
                    .publish(
                        &vm.object_ref(&()),
                        EventType::Normal,
                        reasons::MIGRATION_STARTED,
                        actions::MIGRATE,
                        Some(note),
                    )
                    .await;
                (written, attempt)
            }
        };

        if let Some(name) = attempt.instance.as_deref() {
            return match self.compute.get(&namespace, name).await? {
                Some(instance) => Ok(Some(self.compute.observe(&instance).await?)),
                None => Ok(None),
            };
        }
        if attempt.phase != MigrationPhase::Migrating || !attempt.volumes.is_empty() {
            debug!(
                phase = %attempt.phase,
                volumes = ?attempt.volumes,
                "compute starts once disk targets are ready"
            );
            return Ok(None);
        }

        self.start_compute(&current, operation, &attempt, &[])
            .await
            .map(Some)
    }
}
