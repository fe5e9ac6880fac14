//! VirtualMachine migration controller
//!
//! Level-triggered driver for an attempt that [`Orchestrator::begin`] has
//! recorded. Each pass rebuilds an [`OrchestrationInput`] from the VM, its
//! operation, the compute instance and the declared disks, asks
//! [`determine_step`] what to do and writes at most one transition. Starting
//! the compute side once every disk target is ready is one of those steps.
//!
//! [`Orchestrator::begin`]: crate::orchestrator::Orchestrator

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use virt_common::crd::{
    set_condition, Condition, ConditionKind, ConditionStatus, MigratedVolume, MigrationNode,
    MigrationPhase, MigrationResult, VirtualDisk, VirtualMachine,
    VirtualMachineInstanceMigration, VirtualMachineMigrationState, VirtualMachineOperation,
};
use virt_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use virt_common::metrics::{record_migration_finished, record_reconcile_error, Outcome};
use virt_common::retry::{retry_with_backoff, RetryConfig};
use virt_compute::{instance_name, owned_by, ComputeMigrationDriver, KubeComputeDriver};

use crate::client::{KubeClient, KubeClientImpl, VmStatusPatch};
use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::state::{
    determine_step, DiskProgress, OperationPresence, OrchestrationInput, OrchestrationStep,
};

/// Name the controller reports events as
pub const CONTROLLER_NAME: &str = "virtualmachine-migration-controller";

/// Requeue while an attempt is moving
const PROGRESS_REQUEUE: Duration = Duration::from_secs(10);

/// Reasons on a VM's `Migrating` condition
pub mod condition_reasons {
    /// Attempt in flight
    pub const MIGRATION_IN_PROGRESS: &str = "MigrationInProgress";
    /// Attempt rolling back
    pub const MIGRATION_REVERTING: &str = "MigrationReverting";
    /// Last attempt landed on the target
    pub const LAST_MIGRATION_SUCCEEDED: &str = "LastMigrationSucceeded";
    /// Last attempt rolled back
    pub const LAST_MIGRATION_FINISHED_WITH_ERROR: &str = "LastMigrationFinishedWithError";
}

use condition_reasons::*;

/// Controller context for the VM migration controller
///
/// Use [`ContextBuilder`] to construct instances.
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Compute migration driver
    pub compute: Arc<dyn ComputeMigrationDriver>,
    /// Event publisher for `kubectl describe` visibility
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Orchestrator sharing this context's clients, for the operation handler
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.kube.clone(), self.compute.clone(), self.events.clone())
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        compute: Arc<dyn ComputeMigrationDriver>,
    ) -> Self {
        Self {
            kube,
            compute,
            events: Arc::new(virt_common::events::NoopEventPublisher),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    compute: Option<Arc<dyn ComputeMigrationDriver>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            compute: None,
            events: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the compute migration driver
    pub fn compute_driver(mut self, compute: Arc<dyn ComputeMigrationDriver>) -> Self {
        self.compute = Some(compute);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            compute: self
                .compute
                .unwrap_or_else(|| Arc::new(KubeComputeDriver::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
        }
    }
}

/// Reconcile the migration attempt recorded on a VirtualMachine
#[instrument(skip(vm, ctx), fields(vm = %vm.name_any()))]
pub async fn reconcile(
    vm: Arc<VirtualMachine>,
    ctx: Arc<Context>,
) -> Result<Action, OrchestratorError> {
    let Some(attempt) = vm.migration_state() else {
        return Ok(Action::await_change());
    };
    if attempt.is_terminal() {
        return Ok(Action::await_change());
    }
    let namespace = vm.namespace().ok_or(OrchestratorError::MissingNamespace)?;

    let operation = ctx
        .kube
        .get_operation(&namespace, &attempt.operation)
        .await?
        .filter(|op| op.uid().as_deref() == Some(attempt.operation_uid.as_str()));
    let presence = match &operation {
        Some(op) if op.is_deleting() => OperationPresence::Deleting,
        Some(_) => OperationPresence::Present,
        None => OperationPresence::Missing,
    };

    // Until the attempt records its instance, only one owned by its operation counts.
    let instance = attempt
        .instance
        .clone()
        .unwrap_or_else(|| instance_name(&attempt.operation));
    let found = ctx
        .compute
        .get(&namespace, &instance)
        .await?
        .filter(|i| attempt.instance.is_some() || owned_by(i, &attempt.operation_uid));
    let compute = match &found {
        Some(i) => Some(ctx.compute.observe(i).await?),
        None => None,
    };

    let mut disks = Vec::with_capacity(attempt.volumes.len());
    for name in &attempt.volumes {
        let disk = ctx.kube.get_disk(&namespace, name).await?;
        disks.push((name.clone(), disk));
    }

    let input = OrchestrationInput {
        attempt: Some(attempt),
        vm_running: vm.is_running(),
        vm_deleting: vm.is_deleting(),
        operation: presence,
        compute,
        disks: disks
            .iter()
            .map(|(name, disk)| (name.clone(), DiskProgress::of(disk.as_ref(), attempt)))
            .collect(),
    };
    let step = determine_step(&input);
    debug!(phase = %attempt.phase, ?step, "determined orchestration step");

    let pass = Pass {
        ctx: &ctx,
        vm: &vm,
        namespace: &namespace,
        attempt,
        instance: &instance,
    };
    match step {
        OrchestrationStep::Idle | OrchestrationStep::Done => Ok(Action::await_change()),
        OrchestrationStep::Wait => Ok(Action::requeue(PROGRESS_REQUEUE)),
        OrchestrationStep::StartCompute => {
            pass.start_compute(operation.as_ref(), found.as_ref(), &disks)
                .await
        }
        OrchestrationStep::Settle { target_node } => pass.settle(target_node).await,
        OrchestrationStep::Revert { message } => pass.revert(message).await,
        OrchestrationStep::RequestAbort => {
            pass.request_abort().await?;
            Ok(Action::requeue(PROGRESS_REQUEUE))
        }
        OrchestrationStep::Succeed { stayed_on_source } => pass.succeed(stayed_on_source).await,
        OrchestrationStep::Fail { message } => pass.fail(message).await,
    }
}

/// Error policy for the VM migration controller
pub fn error_policy(
    vm: Arc<VirtualMachine>,
    error: &OrchestratorError,
    _ctx: Arc<Context>,
) -> Action {
    let retryable = error.is_retryable();
    error!(
        ?error,
        vm = %vm.name_any(),
        retryable,
        "migration reconciliation failed"
    );
    record_reconcile_error("migration", retryable);
    if retryable {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}

/// Targets of the attempt's in-flight disk records, as the instance mirrors them
fn mirrored_volumes(
    attempt: &VirtualMachineMigrationState,
    disks: &[(String, Option<VirtualDisk>)],
) -> Vec<MigratedVolume> {
    disks
        .iter()
        .filter_map(|(name, disk)| {
            let record = disk
                .as_ref()?
                .migration_state()
                .filter(|r| r.belongs_to(attempt.start_timestamp) && r.is_in_progress())?;
            Some(MigratedVolume {
                name: name.clone(),
                source_claim: record.source_pvc.clone()?,
                target_claim: record.target_pvc.clone()?,
            })
        })
        .collect()
}

/// One reconcile pass over a VM's attempt
struct Pass<'a> {
    ctx: &'a Context,
    vm: &'a VirtualMachine,
    namespace: &'a str,
    attempt: &'a VirtualMachineMigrationState,
    instance: &'a str,
}

impl Pass<'_> {
    fn name(&self) -> String {
        self.vm.name_any()
    }

    async fn write(&self, patch: VmStatusPatch) -> Result<(), OrchestratorError> {
        self.ctx
            .kube
            .patch_vm_status(self.namespace, &self.name(), &patch)
            .await?;
        Ok(())
    }

    async fn event(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(&self.vm.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }

    fn migrating(&self, status: ConditionStatus, reason: &str, message: &str) -> Vec<Condition> {
        let mut conditions = self.vm.conditions().to_vec();
        set_condition(
            &mut conditions,
            Condition::new(ConditionKind::Migrating, status, reason, message),
        );
        conditions
    }

    /// Ask the compute side to abort; a missing instance counts as aborted
    async fn request_abort(&self) -> Result<(), OrchestratorError> {
        retry_with_backoff(
            &RetryConfig::with_max_attempts(3),
            "request_abort",
            || {
                let compute = self.ctx.compute.clone();
                let namespace = self.namespace.to_string();
                let instance = self.instance.to_string();
                async move { compute.request_abort(&namespace, &instance).await }
            },
            virt_common::Error::is_retryable,
        )
        .await?;
        Ok(())
    }

    /// Start the compute side with every ready target, or record one that exists
    async fn start_compute(
        &self,
        operation: Option<&VirtualMachineOperation>,
        found: Option<&VirtualMachineInstanceMigration>,
        disks: &[(String, Option<VirtualDisk>)],
    ) -> Result<Action, OrchestratorError> {
        let orchestrator = self.ctx.orchestrator();
        if let Some(existing) = found {
            orchestrator
                .record_instance(self.vm, self.attempt, existing)
                .await?;
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        }
        let Some(operation) = operation else {
            return Ok(Action::requeue(PROGRESS_REQUEUE));
        };

        let volumes = mirrored_volumes(self.attempt, disks);
        info!(
            vm = %self.name(),
            volumes = ?volumes.iter().map(|v| v.target_claim.as_str()).collect::<Vec<_>>(),
            "disk targets ready, starting compute migration"
        );
        orchestrator
            .start_compute(self.vm, operation, self.attempt, &volumes)
            .await?;
        Ok(Action::requeue(PROGRESS_REQUEUE))
    }

    async fn settle(&self, target_node: Option<String>) -> Result<Action, OrchestratorError> {
        let mut attempt = self.attempt.clone();
        attempt.phase = MigrationPhase::Settling;
        attempt.target = MigrationNode { node: target_node };
        info!(vm = %self.name(), target = ?attempt.target.node, "compute landed, settling disks");
        self.write(VmStatusPatch::attempt(attempt)).await?;
        Ok(Action::requeue(PROGRESS_REQUEUE))
    }

    async fn revert(&self, message: String) -> Result<Action, OrchestratorError> {
        warn!(vm = %self.name(), %message, "reverting migration");
        self.request_abort().await?;

        let mut attempt = self.attempt.clone();
        attempt.phase = MigrationPhase::Reverting;
        attempt.message = Some(message.clone());
        self.write(VmStatusPatch {
            migration_state: Some(attempt),
            conditions: Some(self.migrating(
                ConditionStatus::True,
                MIGRATION_REVERTING,
                &message,
            )),
            ..Default::default()
        })
        .await?;
        self.event(
            EventType::Warning,
            reasons::MIGRATION_REVERTING,
            actions::REVERT,
            message,
        )
        .await;
        Ok(Action::requeue(PROGRESS_REQUEUE))
    }

    async fn succeed(&self, stayed_on_source: Vec<String>) -> Result<Action, OrchestratorError> {
        let now = Utc::now();
        let mut attempt = self.attempt.clone().finish(MigrationResult::Succeeded, now);
        let target = attempt.target.node.clone();
        let message = if stayed_on_source.is_empty() {
            format!(
                "Migrated to {}.",
                target.as_deref().unwrap_or("the target node")
            )
        } else {
            format!(
                "Migrated; disks {} stayed on their source volumes.",
                stayed_on_source.join(", ")
            )
        };
        attempt.message = Some(message.clone());
        let duration = (now - attempt.start_timestamp).num_milliseconds() as f64 / 1000.0;

        self.write(VmStatusPatch {
            migration_state: Some(attempt),
            node: target,
            conditions: Some(self.migrating(
                ConditionStatus::False,
                LAST_MIGRATION_SUCCEEDED,
                &message,
            )),
        })
        .await?;

        info!(vm = %self.name(), duration_secs = duration, "migration succeeded");
        record_migration_finished(Outcome::Succeeded, Some(duration));
        self.event(
            EventType::Normal,
            reasons::MIGRATION_SUCCEEDED,
            actions::MIGRATE,
            message,
        )
        .await;
        if !stayed_on_source.is_empty() {
            self.event(
                EventType::Warning,
                reasons::MIGRATION_SUCCEEDED,
                actions::MIGRATE_VOLUME,
                format!(
                    "Disks {} could not be migrated and remain on their source volumes.",
                    stayed_on_source.join(", ")
                ),
            )
            .await;
        }
        Ok(Action::await_change())
    }

    async fn fail(&self, message: String) -> Result<Action, OrchestratorError> {
        let now = Utc::now();
        let mut attempt = self.attempt.clone().finish(MigrationResult::Failed, now);
        attempt.message = Some(message.clone());
        let duration = (now - attempt.start_timestamp).num_milliseconds() as f64 / 1000.0;

        self.write(VmStatusPatch {
            migration_state: Some(attempt),
            conditions: Some(self.migrating(
                ConditionStatus::False,
                LAST_MIGRATION_FINISHED_WITH_ERROR,
                &message,
            )),
            ..Default::default()
        })
        .await?;

        warn!(vm = %self.name(), %message, "migration failed");
        record_migration_finished(Outcome::Failed, Some(duration));
        self.event(
            EventType::Warning,
            reasons::MIGRATION_FAILED,
            actions::REVERT,
            message,
        )
        .await;
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{DateTime, Duration as ChronoDuration};
    use kube::api::ObjectMeta;
    use virt_common::crd::{
        find_condition, OperationType, VirtualDiskMigrationState, VirtualDiskSpec,
        VirtualDiskStatus, VirtualMachineOperationSpec,
        VirtualMachinePhase, VirtualMachineSpec, VirtualMachineStatus,
    };
    use virt_compute::{AbortOutcome, AbortState, ComputeObservation, ComputePhase};

    use crate::client::MockKubeClient;
    use crate::test_support::{instance, instance_with, mirrored, observation, MockCompute};

    #[derive(Clone, Default)]
    struct StatusCapture(Arc<Mutex<Vec<VmStatusPatch>>>);

    impl StatusCapture {
        fn patches(&self) -> Vec<VmStatusPatch> {
            self.0.lock().unwrap().clone()
        }

        fn last(&self) -> VmStatusPatch {
            self.patches().pop().expect("no status patch written")
        }

        fn last_attempt(&self) -> VirtualMachineMigrationState {
            self.last().migration_state.expect("patch without attempt")
        }
    }

    fn start() -> DateTime<Utc> {
        Utc::now() - ChronoDuration::minutes(2)
    }

    fn vm(phase: MigrationPhase, at: DateTime<Utc>) -> VirtualMachine {
        let mut vm = VirtualMachine::new("vm-a", VirtualMachineSpec::default());
        vm.metadata.namespace = Some("default".into());
        vm.metadata.resource_version = Some("11".into());
        let mut attempt = VirtualMachineMigrationState::begin(
            "move",
            "op-uid",
            Some("node-a".into()),
            vec!["data".into()],
            at,
        );
        attempt.phase = phase;
        attempt.instance = Some("vmop-move".into());
        if phase == MigrationPhase::Settling {
            attempt.target = MigrationNode::on("node-b");
        }
        vm.status = Some(VirtualMachineStatus {
            phase: VirtualMachinePhase::Running,
            node: Some("node-a".into()),
            migration_state: Some(attempt),
            ..Default::default()
        });
        vm
    }

    fn operation(deleting: bool) -> VirtualMachineOperation {
        let mut op = VirtualMachineOperation::new(
            "move",
            VirtualMachineOperationSpec {
                type_: OperationType::Evict,
                virtual_machine: "vm-a".into(),
                force: false,
                migrate: None,
            },
        );
        op.metadata = ObjectMeta {
            name: Some("move".into()),
            namespace: Some("default".into()),
            uid: Some("op-uid".into()),
            deletion_timestamp: deleting.then(|| {
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now())
            }),
            finalizers: deleting.then(|| vec![virt_common::VMOP_CLEANUP_FINALIZER.to_string()]),
            ..Default::default()
        };
        op
    }

    /// Disk whose record for the attempt is in the given state
    fn disk(at: DateTime<Utc>, result: Option<MigrationResult>, target_ready: bool) -> VirtualDisk {
        let mut d = VirtualDisk::new("data", VirtualDiskSpec::default());
        let mut record =
            VirtualDiskMigrationState::started(Some("pvc-src".into()), "pvc-dst".into(), at);
        if let Some(result) = result {
            record = record.finish(result, None, at + ChronoDuration::seconds(30));
        }
        let mut conditions = Vec::new();
        if target_ready {
            conditions.push(Condition::new(
                ConditionKind::Migrating,
                ConditionStatus::True,
                "TargetReady",
                "",
            ));
        }
        d.status = Some(VirtualDiskStatus {
            migration_state: Some(record),
            conditions,
            ..Default::default()
        });
        d
    }

    struct Fixture {
        operation: Option<VirtualMachineOperation>,
        compute: Option<ComputeObservation>,
        disk: Option<VirtualDisk>,
    }

    fn context_with(fixture: Fixture, capture: &StatusCapture) -> (Arc<Context>, Arc<Mutex<u32>>) {
        let mut kube = MockKubeClient::new();
        let op = fixture.operation;
        kube.expect_get_operation()
            .returning(move |_, _| Ok(op.clone()));
        let disk = fixture.disk;
        kube.expect_get_disk()
            .returning(move |_, _| Ok(disk.clone()));
        let sink = capture.0.clone();
        kube.expect_patch_vm_status().returning(move |_, _, patch| {
            sink.lock().unwrap().push(patch.clone());
            Ok(())
        });

        let mut compute = MockCompute::new();
        let present = fixture.compute.is_some();
        compute
            .expect_get()
            .returning(move |_, _| Ok(present.then(instance)));
        let obs = fixture.compute;
        compute
            .expect_observe()
            .returning(move |_| obs.clone().ok_or_else(|| virt_common::Error::internal("gone")));
        let aborts = Arc::new(Mutex::new(0u32));
        let counter = aborts.clone();
        compute.expect_request_abort().returning(move |_, name| {
            assert_eq!(name, "vmop-move");
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        compute.expect_start_migration().never();

        (
            Arc::new(Context::for_testing(Arc::new(kube), Arc::new(compute))),
            aborts,
        )
    }

    /// Story: compute lands, disk target is mirrored, attempt settles and then succeeds
    #[tokio::test]
    async fn evict_with_storage_change_settles_then_succeeds() {
        let at = start();
        let capture = StatusCapture::default();
        let (ctx, aborts) = context_with(
            Fixture {
                operation: Some(operation(false)),
                compute: Some(observation(ComputePhase::Succeeded, AbortState::NotRequested)),
                disk: Some(disk(at, None, true)),
            },
            &capture,
        );

        let action = reconcile(Arc::new(vm(MigrationPhase::Migrating, at)), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(PROGRESS_REQUEUE));
        let settled = capture.last_attempt();
        assert_eq!(settled.phase, MigrationPhase::Settling);
        assert_eq!(settled.target.node.as_deref(), Some("node-b"));
        assert!(settled.end_timestamp.is_none());
        assert_eq!(*aborts.lock().unwrap(), 0);

        let capture = StatusCapture::default();
        let (ctx, _) = context_with(
            Fixture {
                operation: Some(operation(false)),
                compute: Some(observation(ComputePhase::Succeeded, AbortState::NotRequested)),
                disk: Some(disk(at, Some(MigrationResult::Succeeded), false)),
            },
            &capture,
        );
        let action = reconcile(Arc::new(vm(MigrationPhase::Settling, at)), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());

        let patch = capture.last();
        assert_eq!(patch.node.as_deref(), Some("node-b"));
        let done = patch.migration_state.unwrap();
        assert_eq!(done.phase, MigrationPhase::Succeeded);
        assert_eq!(done.result, Some(MigrationResult::Succeeded));
        assert!(done.end_timestamp.is_some());
        let cond = find_condition(patch.conditions.as_deref().unwrap(), ConditionKind::Migrating)
            .unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, LAST_MIGRATION_SUCCEEDED);
    }

    /// Story: a disk fails mid-flight, compute is aborted, attempt fails
    #[tokio::test]
    async fn disk_failure_reverts_then_fails() {
        let at = start();
        let capture = StatusCapture::default();
        let (ctx, aborts) = context_with(
            Fixture {
                operation: Some(operation(false)),
                compute: Some(observation(ComputePhase::Running, AbortState::NotRequested)),
                disk: Some(disk(at, Some(MigrationResult::Failed), false)),
            },
            &capture,
        );
        reconcile(Arc::new(vm(MigrationPhase::Migrating, at)), ctx)
            .await
            .unwrap();
        assert_eq!(*aborts.lock().unwrap(), 1);
        let reverting = capture.last_attempt();
        assert_eq!(reverting.phase, MigrationPhase::Reverting);
        assert_eq!(
            reverting.message.as_deref(),
            Some("Disk data migration failed.")
        );

        let mut reverting_vm = vm(MigrationPhase::Reverting, at);
        if let Some(a) = reverting_vm
            .status
            .as_mut()
            .and_then(|s| s.migration_state.as_mut())
        {
            a.message = reverting.message.clone();
        }

        // Abort still in flight: no terminal write
        let capture = StatusCapture::default();
        let (ctx, _) = context_with(
            Fixture {
                operation: Some(operation(false)),
                compute: Some(observation(ComputePhase::Running, AbortState::Requested)),
                disk: Some(disk(at, Some(MigrationResult::Failed), false)),
            },
            &capture,
        );
        reconcile(Arc::new(reverting_vm.clone()), ctx).await.unwrap();
        assert!(capture.patches().is_empty());

        let capture = StatusCapture::default();
        let (ctx, _) = context_with(
            Fixture {
                operation: Some(operation(false)),
                compute: Some(observation(
                    ComputePhase::Running,
                    AbortState::Settled(AbortOutcome::Succeeded),
                )),
                disk: Some(disk(at, Some(MigrationResult::Failed), false)),
            },
            &capture,
        );
        let action = reconcile(Arc::new(reverting_vm), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let patch = capture.last();
        assert!(patch.node.is_none());
        let failed = patch.migration_state.unwrap();
        assert_eq!(failed.result, Some(MigrationResult::Failed));
        assert_eq!(failed.message.as_deref(), Some("Disk data migration failed."));
        let cond = find_condition(patch.conditions.as_deref().unwrap(), ConditionKind::Migrating)
            .unwrap();
        assert_eq!(cond.reason, LAST_MIGRATION_FINISHED_WITH_ERROR);
    }

    /// Story: the operation is withdrawn mid-migration
    #[tokio::test]
    async fn cancelled_operation_reverts() {
        let at = start();
        let capture = StatusCapture::default();
        let (ctx, aborts) = context_with(
            Fixture {
                operation: Some(operation(true)),
                compute: Some(observation(ComputePhase::Running, AbortState::NotRequested)),
                disk: Some(disk(at, None, false)),
            },
            &capture,
        );
        reconcile(Arc::new(vm(MigrationPhase::Migrating, at)), ctx)
            .await
            .unwrap();
        assert_eq!(*aborts.lock().unwrap(), 1);
        let attempt = capture.last_attempt();
        assert_eq!(attempt.phase, MigrationPhase::Reverting);
        assert_eq!(attempt.message.as_deref(), Some("Migration cancelled."));
    }

    #[tokio::test]
    async fn recreated_operation_counts_as_missing() {
        let at = start();
        let mut other = operation(false);
        other.metadata.uid = Some("other-uid".into());
        let capture = StatusCapture::default();
        let (ctx, _) = context_with(
            Fixture {
                operation: Some(other),
                compute: Some(observation(ComputePhase::Running, AbortState::NotRequested)),
                disk: Some(disk(at, None, false)),
            },
            &capture,
        );
        reconcile(Arc::new(vm(MigrationPhase::Migrating, at)), ctx)
            .await
            .unwrap();
        assert_eq!(
            capture.last_attempt().message.as_deref(),
            Some("Operation move no longer exists.")
        );
    }

    /// Story: unschedulable target stays pending without writes
    #[tokio::test]
    async fn unschedulable_target_waits() {
        let at = start();
        let mut pending = observation(ComputePhase::Pending, AbortState::NotRequested);
        pending.unschedulable = Some("0/3 nodes are available".into());
        let capture = StatusCapture::default();
        let (ctx, aborts) = context_with(
            Fixture {
                operation: Some(operation(false)),
                compute: Some(pending),
                disk: Some(disk(at, None, false)),
            },
            &capture,
        );
        let action = reconcile(Arc::new(vm(MigrationPhase::Migrating, at)), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(PROGRESS_REQUEUE));
        assert!(capture.patches().is_empty());
        assert_eq!(*aborts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn genuine_compute_success_is_never_reverted() {
        let at = start();
        let capture = StatusCapture::default();
        let (ctx, aborts) = context_with(
            Fixture {
                operation: None,
                compute: Some(observation(ComputePhase::Succeeded, AbortState::NotRequested)),
                disk: Some(disk(at, Some(MigrationResult::Failed), false)),
            },
            &capture,
        );
        reconcile(Arc::new(vm(MigrationPhase::Migrating, at)), ctx)
            .await
            .unwrap();
        assert_eq!(*aborts.lock().unwrap(), 0);
        assert_eq!(capture.last_attempt().phase, MigrationPhase::Settling);
    }

    /// A disk that failed to promote leaves the attempt Succeeded with a named warning
    #[tokio::test]
    async fn failed_disk_after_landing_stays_on_source() {
        let at = start();
        let capture = StatusCapture::default();
        let (ctx, _) = context_with(
            Fixture {
                operation: Some(operation(false)),
                compute: Some(observation(ComputePhase::Succeeded, AbortState::NotRequested)),
                disk: Some(disk(at, Some(MigrationResult::Failed), false)),
            },
            &capture,
        );
        reconcile(Arc::new(vm(MigrationPhase::Settling, at)), ctx)
            .await
            .unwrap();
        let patch = capture.last();
        assert_eq!(patch.node.as_deref(), Some("node-b"));
        let attempt = patch.migration_state.unwrap();
        assert_eq!(attempt.result, Some(MigrationResult::Succeeded));
        assert!(attempt.message.unwrap().contains("data"));
    }

    #[tokio::test]
    async fn settling_waits_for_disks_still_copying() {
        let at = start();
        let capture = StatusCapture::default();
        let (ctx, _) = context_with(
            Fixture {
                operation: Some(operation(false)),
                compute: Some(observation(ComputePhase::Succeeded, AbortState::NotRequested)),
                disk: Some(disk(at, None, true)),
            },
            &capture,
        );
        let action = reconcile(Arc::new(vm(MigrationPhase::Settling, at)), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(PROGRESS_REQUEUE));
        assert!(capture.patches().is_empty());
    }

    fn without_instance(mut vm: VirtualMachine) -> VirtualMachine {
        if let Some(a) = vm.status.as_mut().and_then(|s| s.migration_state.as_mut()) {
            a.instance = None;
        }
        vm
    }

    /// Story: the attempt was recorded but compute never started. Once the
    /// disk's target is ready the controller starts compute with that target
    /// wired in, and records both the instance and the mirrored claim.
    #[tokio::test]
    async fn recorded_attempt_starts_compute_once_targets_are_ready() {
        let at = start();
        let capture = StatusCapture::default();

        let mut kube = MockKubeClient::new();
        kube.expect_get_operation()
            .returning(|_, _| Ok(Some(operation(false))));
        kube.expect_get_disk()
            .returning(move |_, _| Ok(Some(disk(at, None, true))));
        kube.expect_patch_vm_status().never();
        let sink = capture.0.clone();
        kube.expect_record_attempt().times(1).returning(move |vm, patch| {
            sink.lock().unwrap().push(patch.clone());
            Ok(vm.clone())
        });

        let mut compute = MockCompute::new();
        compute.expect_get().returning(|_, _| Ok(None));
        compute
            .expect_start_migration()
            .times(1)
            .withf(|_, _, _, volumes| volumes == [mirrored("data", "pvc-src", "pvc-dst")])
            .returning(|_, _, _, volumes| Ok(instance_with(volumes)));
        compute
            .expect_observe()
            .returning(|_| Ok(observation(ComputePhase::Pending, AbortState::NotRequested)));
        compute.expect_request_abort().never();
        let ctx = Arc::new(Context::for_testing(Arc::new(kube), Arc::new(compute)));

        let machine = without_instance(vm(MigrationPhase::Migrating, at));
        let action = reconcile(Arc::new(machine), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(PROGRESS_REQUEUE));

        let recorded = capture.last_attempt();
        assert_eq!(recorded.phase, MigrationPhase::Migrating);
        assert_eq!(recorded.instance.as_deref(), Some("vmop-move"));
        assert!(recorded.mirrors("data", "pvc-dst"));
    }

    /// Story: a recorded attempt whose compute never started is not treated
    /// as a lost instance while its disk target is still provisioning.
    #[tokio::test]
    async fn unstarted_compute_waits_for_targets_instead_of_reverting() {
        let at = start();
        let capture = StatusCapture::default();
        let (ctx, aborts) = context_with(
            Fixture {
                operation: Some(operation(false)),
                compute: None,
                disk: Some(disk(at, None, false)),
            },
            &capture,
        );
        let machine = without_instance(vm(MigrationPhase::Migrating, at));
        let action = reconcile(Arc::new(machine), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(PROGRESS_REQUEUE));
        assert!(capture.patches().is_empty());
        assert_eq!(*aborts.lock().unwrap(), 0);
    }

    /// Story: an operation was deleted and recreated under the same name. The
    /// old operation's instance still exists and is not adopted by the new
    /// attempt.
    #[tokio::test]
    async fn leftover_instance_of_another_operation_is_not_adopted() {
        let at = start();
        let capture = StatusCapture::default();
        let (ctx, aborts) = context_with(
            Fixture {
                operation: Some(operation(false)),
                compute: Some(observation(ComputePhase::Failed, AbortState::NotRequested)),
                disk: Some(disk(at, None, false)),
            },
            &capture,
        );
        let machine = without_instance(vm(MigrationPhase::Migrating, at));
        let action = reconcile(Arc::new(machine), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(PROGRESS_REQUEUE));
        assert!(capture.patches().is_empty());
        assert_eq!(*aborts.lock().unwrap(), 0);
    }

    #[test]
    fn only_in_flight_records_of_the_attempt_are_mirrored() {
        let at = start();
        let attempt = vm(MigrationPhase::Migrating, at)
            .migration_state()
            .cloned()
            .unwrap();
        let stale = disk(at - ChronoDuration::hours(1), None, true);
        let finished = disk(at, Some(MigrationResult::Failed), false);
        let disks = vec![
            ("data".to_string(), Some(disk(at, None, true))),
            ("old".to_string(), Some(stale)),
            ("done".to_string(), Some(finished)),
            ("gone".to_string(), None),
        ];
        assert_eq!(
            mirrored_volumes(&attempt, &disks),
            vec![mirrored("data", "pvc-src", "pvc-dst")]
        );
    }

    #[tokio::test]
    async fn finished_attempt_is_a_sink() {
        let at = start();
        let mut vm = vm(MigrationPhase::Migrating, at);
        if let Some(s) = vm.status.as_mut() {
            s.migration_state = s
                .migration_state
                .take()
                .map(|a| a.finish(MigrationResult::Succeeded, Utc::now()));
        }
        let mut kube = MockKubeClient::new();
        kube.expect_get_operation().never();
        kube.expect_patch_vm_status().never();
        let mut compute = MockCompute::new();
        compute.expect_get().never();
        let ctx = Arc::new(Context::for_testing(Arc::new(kube), Arc::new(compute)));

        let action = reconcile(Arc::new(vm), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn vm_without_attempt_is_ignored() {
        let mut vm = VirtualMachine::new("vm-a", VirtualMachineSpec::default());
        vm.metadata.namespace = Some("default".into());
        let ctx = Arc::new(Context::for_testing(
            Arc::new(MockKubeClient::new()),
            Arc::new(MockCompute::new()),
        ));
        let action = reconcile(Arc::new(vm), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn error_policy_backs_off_by_retryability() {
        let vm = Arc::new(vm(MigrationPhase::Migrating, start()));
        let ctx = Arc::new(Context::for_testing(
            Arc::new(MockKubeClient::new()),
            Arc::new(MockCompute::new()),
        ));
        assert_eq!(
            error_policy(vm.clone(), &OrchestratorError::MissingNamespace, ctx.clone()),
            Action::requeue(Duration::from_secs(60))
        );
        assert_eq!(
            error_policy(
                vm,
                &OrchestratorError::Common(virt_common::Error::internal("boom")),
                ctx
            ),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
