//! VirtualMachineOperation controller for Migrate and Evict
//!
//! Admits a request, hands it to the orchestrator once and then mirrors the
//! attempt's progress. Deleting a running operation is the cancellation
//! signal: the handler asks the compute side to abort and lets the
//! orchestrator walk the attempt back.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use virt_common::crd::{
    find_condition, CompletedReason, Condition, ConditionKind, ConditionStatus, MigrationPhase,
    OperationPhase, VirtualMachine, VirtualMachineOperation, VirtualMachineOperationStatus,
    SIGNAL_SENT_SUCCESS,
};
use virt_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use virt_common::metrics::record_reconcile_error;
use virt_common::VMOP_CLEANUP_FINALIZER;
use virt_compute::{instance_name, ComputeMigrationDriver, ComputeObservation, KubeComputeDriver};
use virt_migration::{MigrationOrchestrator, OrchestrationState, Orchestrator};

use crate::client::{KubeClient, KubeClientImpl};
use crate::error::OperationError;
use crate::progress::{own_attempt, sync_progress};
use crate::validation::{validate_preconditions, HotplugDisk, PreconditionView};

/// Name the controller reports events as
pub const CONTROLLER_NAME: &str = "virtualmachineoperation-controller";

/// Requeue while the attempt is in flight
const PROGRESS_REQUEUE: Duration = Duration::from_secs(10);

/// Controller context for the operation handler
///
/// Use [`ContextBuilder`] to construct instances.
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Compute migration driver, read for progress and abort
    pub compute: Arc<dyn ComputeMigrationDriver>,
    /// Starts attempts
    pub orchestrator: Arc<dyn MigrationOrchestrator>,
    /// Event publisher for `kubectl describe` visibility
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        compute: Arc<dyn ComputeMigrationDriver>,
        orchestrator: Arc<dyn MigrationOrchestrator>,
    ) -> Self {
        Self {
            kube,
            compute,
            orchestrator,
            events: Arc::new(virt_common::events::NoopEventPublisher),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    compute: Option<Arc<dyn ComputeMigrationDriver>>,
    orchestrator: Option<Arc<dyn MigrationOrchestrator>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            compute: None,
            orchestrator: None,
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

    /// Override the orchestrator
    pub fn orchestrator(mut self, orchestrator: Arc<dyn MigrationOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let compute: Arc<dyn ComputeMigrationDriver> = self
            .compute
            .unwrap_or_else(|| Arc::new(KubeComputeDriver::new(self.client.clone())));
        let events: Arc<dyn EventPublisher> = self.events.unwrap_or_else(|| {
            Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
        });
        let orchestrator = self.orchestrator.unwrap_or_else(|| {
            Arc::new(Orchestrator::new(
                Arc::new(virt_migration::KubeClientImpl::new(self.client.clone())),
                compute.clone(),
                events.clone(),
            ))
        });
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            compute,
            orchestrator,
            events,
        }
    }
}

/// Reconcile a VirtualMachineOperation
#[instrument(skip(vmop, ctx), fields(vmop = %vmop.name_any()))]
pub async fn reconcile(
    vmop: Arc<VirtualMachineOperation>,
    ctx: Arc<Context>,
) -> Result<Action, OperationError> {
    if !vmop.is_migration() {
        return Ok(Action::await_change());
    }
    let namespace = vmop.namespace().ok_or(OperationError::MissingNamespace)?;
    let name = vmop.name_any();

    if vmop.is_deleting() {
        return cancel(&vmop, &namespace, &ctx).await;
    }
    if vmop.is_terminal() {
        return Ok(Action::await_change());
    }
    if !vmop.has_finalizer(VMOP_CLEANUP_FINALIZER) {
        ctx.kube
            .add_finalizer(&namespace, &name, VMOP_CLEANUP_FINALIZER)
            .await?;
    }

    let vm = ctx
        .kube
        .get_vm(&namespace, &vmop.spec.virtual_machine)
        .await?;

    let status = if vmop.signal_sent() {
        let observation = observe(&ctx, &namespace, &vmop, vm.as_ref()).await?;
        sync_progress(&vmop, vm.as_ref(), observation.as_ref())
    } else if let Some((vm, attempt)) = vm
        .as_ref()
        .and_then(|vm| own_attempt(&vmop, vm).map(|a| (vm, a)))
    {
        // A previous pass began the attempt but lost the SignalSent write.
        info!("attempt already recorded on VM, re-marking signal");
        let observation = match observe(&ctx, &namespace, &vmop, Some(vm)).await? {
            Some(observation) => Some(observation),
            // It may also have stopped before compute started; begin resumes it.
            None if attempt.instance.is_none() && attempt.phase == MigrationPhase::Migrating => {
                ctx.orchestrator.begin(vm, &vmop).await?
            }
            None => None,
        };
        signal_sent(sync_progress(&vmop, Some(vm), observation.as_ref()))
    } else {
        match admit(&ctx, &namespace, &vmop, vm.as_ref()).await? {
            Admission::Rejected(status) => status,
            Admission::Begun { vm, observation } => {
                signal_sent(sync_progress(&vmop, Some(&vm), observation.as_ref()))
            }
        }
    };

    publish_transition(&ctx, &vmop, &status).await;
    write_status(&ctx, &namespace, &vmop, status).await
}

/// Error policy for the operation handler
pub fn error_policy(
    vmop: Arc<VirtualMachineOperation>,
    error: &OperationError,
    _ctx: Arc<Context>,
) -> Action {
    let retryable = error.is_retryable();
    error!(
        ?error,
        vmop = %vmop.name_any(),
        retryable,
        "operation reconciliation failed"
    );
    record_reconcile_error("operation", retryable);
    if retryable {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}

enum Admission {
    Rejected(VirtualMachineOperationStatus),
    Begun {
        vm: VirtualMachine,
        observation: Option<ComputeObservation>,
    },
}

/// Check preconditions and, if they hold, begin the attempt
async fn admit(
    ctx: &Context,
    namespace: &str,
    vmop: &VirtualMachineOperation,
    vm: Option<&VirtualMachine>,
) -> Result<Admission, OperationError> {
    debug!(state = %OrchestrationState::Validating, "checking preconditions");
    let (hotplugged, foreign_instances) = match vm {
        Some(vm) => (
            hotplugged_disks(ctx, namespace, vm).await?,
            foreign_instances(ctx, namespace, vmop, vm).await?,
        ),
        None => (Vec::new(), Vec::new()),
    };

    let view = PreconditionView {
        operation: vmop,
        vm,
        hotplugged,
        foreign_instances,
    };
    if let Err(rejection) = validate_preconditions(&view) {
        warn!(reason = %rejection.reason, message = %rejection.message, "operation rejected");
        ctx.events
            .publish(
                &vmop.object_ref(&()),
                EventType::Warning,
                reasons::PRECONDITION_FAILED,
                actions::VALIDATE,
                Some(rejection.message.clone()),
            )
            .await;
        let status = vmop
            .status
            .clone()
            .unwrap_or_default()
            .observed_generation(vmop.metadata.generation)
            .phase(OperationPhase::Failed)
            .completed(ConditionStatus::False, rejection.reason, rejection.message);
        return Ok(Admission::Rejected(status));
    }

    // validate_preconditions rejects a missing VM
    let Some(vm) = vm else {
        return Err(OperationError::Common(virt_common::Error::internal(
            "admitted operation without a VM",
        )));
    };

    let observation = ctx.orchestrator.begin(vm, vmop).await?;
    match &observation {
        Some(o) => info!(instance = %o.instance, "migration handed to orchestrator"),
        None => info!("migration handed to orchestrator, compute waits for disk targets"),
    }
    ctx.events
        .publish(
            &vmop.object_ref(&()),
            EventType::Normal,
            reasons::MIGRATION_STARTED,
            actions::MIGRATE,
            Some(format!("Migration of {} started.", vm.name_any())),
        )
        .await;

    // Re-read so progress reflects the attempt begin just recorded.
    let vm = ctx
        .kube
        .get_vm(namespace, &vm.name_any())
        .await?
        .unwrap_or_else(|| vm.clone());
    debug!(state = %OrchestrationState::of(own_attempt(vmop, &vm)), "attempt recorded");
    Ok(Admission::Begun { vm, observation })
}

async fn hotplugged_disks(
    ctx: &Context,
    namespace: &str,
    vm: &VirtualMachine,
) -> Result<Vec<HotplugDisk>, OperationError> {
    let vm_name = vm.name_any();
    let mut disks = Vec::new();
    for attachment in ctx.kube.list_attachments(namespace).await? {
        if attachment.spec.virtual_machine_name != vm_name {
            continue;
        }
        let Some(disk_name) = attachment.disk_name() else {
            continue;
        };
        let disk = ctx.kube.get_disk(namespace, disk_name).await?;
        disks.push(HotplugDisk {
            name: disk_name.to_string(),
            exists: disk.is_some(),
            access_mode: disk.as_ref().and_then(|d| d.access_mode()),
        });
    }
    Ok(disks)
}

async fn foreign_instances(
    ctx: &Context,
    namespace: &str,
    vmop: &VirtualMachineOperation,
    vm: &VirtualMachine,
) -> Result<Vec<String>, OperationError> {
    let own = instance_name(&vmop.name_any());
    Ok(ctx
        .compute
        .list_for_vm(namespace, &vm.name_any())
        .await?
        .into_iter()
        .filter(|i| !i.is_final())
        .map(|i| i.name_any())
        .filter(|name| *name != own)
        .collect())
}

/// Observe the compute instance of this operation's attempt
async fn observe(
    ctx: &Context,
    namespace: &str,
    vmop: &VirtualMachineOperation,
    vm: Option<&VirtualMachine>,
) -> Result<Option<ComputeObservation>, OperationError> {
    let instance = vm
        .and_then(|vm| own_attempt(vmop, vm))
        .and_then(|a| a.instance.clone())
        .unwrap_or_else(|| instance_name(&vmop.name_any()));
    match ctx.compute.get(namespace, &instance).await? {
        Some(i) => Ok(Some(ctx.compute.observe(&i).await?)),
        None => Ok(None),
    }
}

fn signal_sent(status: VirtualMachineOperationStatus) -> VirtualMachineOperationStatus {
    status.condition(Condition::new(
        ConditionKind::SignalSent,
        ConditionStatus::True,
        SIGNAL_SENT_SUCCESS,
        "",
    ))
}

fn completed_reason(status: Option<&VirtualMachineOperationStatus>) -> Option<String> {
    status
        .and_then(|s| find_condition(&s.conditions, ConditionKind::Completed))
        .map(|c| c.reason.clone())
}

/// Events for transitions worth a `kubectl describe` line
async fn publish_transition(
    ctx: &Context,
    vmop: &VirtualMachineOperation,
    status: &VirtualMachineOperationStatus,
) {
    let before = completed_reason(vmop.status.as_ref());
    let after = completed_reason(Some(status));
    if before == after {
        return;
    }
    let message = find_condition(&status.conditions, ConditionKind::Completed)
        .map(|c| c.message.clone())
        .unwrap_or_default();

    let event = match after.as_deref() {
        Some(r) if r == CompletedReason::QuotaExceeded.as_str() => {
            Some((EventType::Warning, reasons::QUOTA_EXCEEDED))
        }
        Some(r) if r == CompletedReason::OperationCompleted.as_str() => {
            Some((EventType::Normal, reasons::MIGRATION_SUCCEEDED))
        }
        Some(r) if r == CompletedReason::OperationFailed.as_str() => {
            Some((EventType::Warning, reasons::MIGRATION_FAILED))
        }
        _ => None,
    };
    if let Some((type_, reason)) = event {
        ctx.events
            .publish(
                &vmop.object_ref(&()),
                type_,
                reason,
                actions::MIGRATE,
                Some(message),
            )
            .await;
    }
}

/// Patch the status if it changed and pick the next requeue
async fn write_status(
    ctx: &Context,
    namespace: &str,
    vmop: &VirtualMachineOperation,
    status: VirtualMachineOperationStatus,
) -> Result<Action, OperationError> {
    let terminal = status.phase.is_terminal();
    if vmop.status.as_ref() != Some(&status) {
        debug!(phase = %status.phase, "updating operation status");
        ctx.kube
            .patch_operation_status(namespace, &vmop.name_any(), &status)
            .await?;
    }
    if terminal {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(PROGRESS_REQUEUE))
    }
}

/// Handle deletion: signal cancellation once, then release the operation
async fn cancel(
    vmop: &VirtualMachineOperation,
    namespace: &str,
    ctx: &Context,
) -> Result<Action, OperationError> {
    if !vmop.has_finalizer(VMOP_CLEANUP_FINALIZER) {
        return Ok(Action::await_change());
    }
    let name = vmop.name_any();

    if vmop.signal_sent() && !vmop.is_terminal() {
        info!("operation deleted while running, cancelling migration");
        if vmop.phase() != OperationPhase::Terminating {
            let status = vmop
                .status
                .clone()
                .unwrap_or_default()
                .phase(OperationPhase::Terminating);
            ctx.kube
                .patch_operation_status(namespace, &name, &status)
                .await?;
        }

        // The orchestrator reverts on its own once the operation is gone.
        if let Err(e) = ctx
            .compute
            .request_abort(namespace, &instance_name(&name))
            .await
        {
            warn!(error = %e, "abort request failed, orchestrator will retry");
        }

        ctx.events
            .publish(
                &vmop.object_ref(&()),
                EventType::Normal,
                reasons::MIGRATION_CANCELLED,
                actions::REVERT,
                Some(format!(
                    "Migration of {} cancelled.",
                    vmop.spec.virtual_machine
                )),
            )
            .await;
    }

    ctx.kube
        .remove_finalizer(namespace, &name, VMOP_CLEANUP_FINALIZER)
        .await?;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use virt_common::crd::{
        AccessMode, BlockDeviceRef, InstanceMigrationPhase, MigratedVolume, MigrationPhase,
        MigrationResult,
        OperationType, RunPolicy, VirtualDisk, VirtualDiskSpec, VirtualDiskStatus,
        VirtualMachineBlockDeviceAttachment, VirtualMachineBlockDeviceAttachmentSpec,
        VirtualMachineInstanceMigration, VirtualMachineInstanceMigrationSpec,
        VirtualMachineInstanceMigrationStatus, VirtualMachineMigrationState,
        VirtualMachineOperationSpec, VirtualMachinePhase, VirtualMachineSpec,
        VirtualMachineStatus,
    };
    use virt_common::Error;
    use virt_compute::{AbortState, ComputePhase};
    use virt_migration::OrchestratorError;

    use crate::client::MockKubeClient;

    mockall::mock! {
        Compute {}

        #[async_trait]
        impl ComputeMigrationDriver for Compute {
            async fn start_migration(
                &self,
                vm: &VirtualMachine,
                operation: &VirtualMachineOperation,
                target: &BTreeMap<String, String>,
                volumes: &[MigratedVolume],
            ) -> Result<VirtualMachineInstanceMigration, Error>;
            async fn get(
                &self,
                namespace: &str,
                name: &str,
            ) -> Result<Option<VirtualMachineInstanceMigration>, Error>;
            async fn list_for_vm(
                &self,
                namespace: &str,
                vm: &str,
            ) -> Result<Vec<VirtualMachineInstanceMigration>, Error>;
            async fn observe(
                &self,
                instance: &VirtualMachineInstanceMigration,
            ) -> Result<ComputeObservation, Error>;
            async fn request_abort(&self, namespace: &str, name: &str) -> Result<(), Error>;
            async fn target_unschedulable(
                &self,
                instance: &VirtualMachineInstanceMigration,
            ) -> Result<Option<String>, Error>;
        }
    }

    mockall::mock! {
        Orchestrator {}

        #[async_trait]
        impl MigrationOrchestrator for Orchestrator {
            async fn begin(
                &self,
                vm: &VirtualMachine,
                operation: &VirtualMachineOperation,
            ) -> Result<Option<ComputeObservation>, OrchestratorError>;
        }
    }

    #[derive(Clone, Default)]
    struct StatusCapture(Arc<Mutex<Vec<VirtualMachineOperationStatus>>>);

    impl StatusCapture {
        fn patches(&self) -> Vec<VirtualMachineOperationStatus> {
            self.0.lock().unwrap().clone()
        }

        fn last(&self) -> VirtualMachineOperationStatus {
            self.patches().pop().expect("no status patch written")
        }
    }

    fn operation() -> VirtualMachineOperation {
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
            generation: Some(1),
            finalizers: Some(vec![VMOP_CLEANUP_FINALIZER.to_string()]),
            ..Default::default()
        };
        op
    }

    fn signalled(mut op: VirtualMachineOperation) -> VirtualMachineOperation {
        op.status = Some(signal_sent(
            VirtualMachineOperationStatus::with_phase(OperationPhase::InProgress)
                .observed_generation(Some(1))
                .completed(ConditionStatus::False, CompletedReason::MigrationRunning, ""),
        ));
        op
    }

    fn vm(attempt: Option<VirtualMachineMigrationState>) -> VirtualMachine {
        let mut vm = VirtualMachine::new(
            "vm-a",
            VirtualMachineSpec {
                run_policy: RunPolicy::AlwaysOn,
                block_device_refs: vec![BlockDeviceRef::disk("root")],
                ..Default::default()
            },
        );
        vm.metadata.namespace = Some("default".into());
        vm.status = Some(VirtualMachineStatus {
            phase: VirtualMachinePhase::Running,
            node: Some("node-a".into()),
            migration_state: attempt,
            ..Default::default()
        });
        vm
    }

    fn own_attempt_record(phase: MigrationPhase) -> VirtualMachineMigrationState {
        let mut a =
            VirtualMachineMigrationState::begin("move", "op-uid", Some("node-a".into()), vec![], Utc::now());
        a.phase = phase;
        a.instance = Some("vmop-move".into());
        a
    }

    fn instance(phase: Option<InstanceMigrationPhase>) -> VirtualMachineInstanceMigration {
        let mut i = VirtualMachineInstanceMigration::new(
            "vmop-move",
            VirtualMachineInstanceMigrationSpec {
                vmi_name: "vm-a".into(),
                added_node_selector: None,
                abort_requested: false,
                volumes: vec![],
            },
        );
        i.status = Some(VirtualMachineInstanceMigrationStatus {
            phase,
            ..Default::default()
        });
        i
    }

    fn observation(detail: Option<InstanceMigrationPhase>) -> ComputeObservation {
        ComputeObservation {
            instance: "vmop-move".into(),
            phase: ComputePhase::Pending,
            detail_phase: detail,
            abort: AbortState::NotRequested,
            target_node: None,
            failure_reason: None,
            quota_rejected: None,
            unschedulable: None,
        }
    }

    fn kube(vm: Option<VirtualMachine>, capture: &StatusCapture) -> MockKubeClient {
        let mut kube = MockKubeClient::new();
        kube.expect_get_vm().returning(move |_, _| Ok(vm.clone()));
        kube.expect_list_attachments().returning(|_| Ok(vec![]));
        kube.expect_add_finalizer().returning(|_, _, _| Ok(()));
        let sink = capture.0.clone();
        kube.expect_patch_operation_status()
            .returning(move |_, _, status| {
                sink.lock().unwrap().push(status.clone());
                Ok(())
            });
        kube
    }

    fn compute_at(detail: Option<InstanceMigrationPhase>) -> MockCompute {
        let mut compute = MockCompute::new();
        compute.expect_list_for_vm().returning(|_, _| Ok(vec![]));
        compute
            .expect_get()
            .returning(move |_, _| Ok(Some(instance(detail))));
        compute
            .expect_observe()
            .returning(move |_| Ok(observation(detail)));
        compute
    }

    fn ctx(
        kube: MockKubeClient,
        compute: MockCompute,
        orchestrator: MockOrchestrator,
    ) -> Arc<Context> {
        Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(compute),
            Arc::new(orchestrator),
        ))
    }

    fn completed(status: &VirtualMachineOperationStatus) -> &Condition {
        find_condition(&status.conditions, ConditionKind::Completed).expect("Completed condition")
    }

    #[tokio::test]
    async fn admitted_operation_begins_and_signals() {
        let capture = StatusCapture::default();
        let mut kube = MockKubeClient::new();
        let mut calls = 0;
        kube.expect_get_vm().returning(move |_, _| {
            calls += 1;
            // Second read sees the attempt begin recorded
            Ok(Some(if calls == 1 {
                vm(None)
            } else {
                vm(Some(own_attempt_record(MigrationPhase::Migrating)))
            }))
        });
        kube.expect_list_attachments().returning(|_| Ok(vec![]));
        let sink = capture.0.clone();
        kube.expect_patch_operation_status()
            .returning(move |_, _, status| {
                sink.lock().unwrap().push(status.clone());
                Ok(())
            });

        let mut orchestrator = MockOrchestrator::new();
        orchestrator
            .expect_begin()
            .times(1)
            .returning(|_, _| Ok(Some(observation(None))));

        let mut compute = MockCompute::new();
        compute.expect_list_for_vm().returning(|_, _| Ok(vec![]));

        let action = reconcile(Arc::new(operation()), ctx(kube, compute, orchestrator))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(PROGRESS_REQUEUE));

        let status = capture.last();
        assert_eq!(status.phase, OperationPhase::Pending);
        assert_eq!(completed(&status).reason, "MigrationPending");
        let signal = find_condition(&status.conditions, ConditionKind::SignalSent).unwrap();
        assert_eq!(signal.status, ConditionStatus::True);
        assert_eq!(signal.reason, SIGNAL_SENT_SUCCESS);
    }

    #[tokio::test]
    async fn finalizer_is_added_on_first_pass() {
        let mut op = operation();
        op.metadata.finalizers = None;
        let capture = StatusCapture::default();
        let mut kube = MockKubeClient::new();
        kube.expect_get_vm().returning(|_, _| Ok(None));
        kube.expect_add_finalizer()
            .withf(|ns, name, f| ns == "default" && name == "move" && f == VMOP_CLEANUP_FINALIZER)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let sink = capture.0.clone();
        kube.expect_patch_operation_status()
            .returning(move |_, _, status| {
                sink.lock().unwrap().push(status.clone());
                Ok(())
            });

        reconcile(Arc::new(op), ctx(kube, MockCompute::new(), MockOrchestrator::new()))
            .await
            .unwrap();
        assert_eq!(completed(&capture.last()).reason, "VirtualMachineNotFound");
    }

    /// Precondition short-circuit: a read-write-once hotplug disk fails the
    /// request in one pass and nothing is started
    #[tokio::test]
    async fn unshared_hotplug_disk_rejects_without_side_effects() {
        let capture = StatusCapture::default();
        let mut kube = MockKubeClient::new();
        kube.expect_get_vm().returning(|_, _| Ok(Some(vm(None))));
        kube.expect_list_attachments().returning(|_| {
            Ok(vec![VirtualMachineBlockDeviceAttachment::new(
                "hp",
                VirtualMachineBlockDeviceAttachmentSpec {
                    virtual_machine_name: "vm-a".into(),
                    block_device_ref: BlockDeviceRef::disk("scratch"),
                },
            )])
        });
        kube.expect_get_disk().returning(|_, name| {
            let mut d = VirtualDisk::new(name, VirtualDiskSpec::default());
            d.status = Some(VirtualDiskStatus {
                access_mode: Some(AccessMode::ReadWriteOnce),
                ..Default::default()
            });
            Ok(Some(d))
        });
        let sink = capture.0.clone();
        kube.expect_patch_operation_status()
            .times(1)
            .returning(move |_, _, status| {
                sink.lock().unwrap().push(status.clone());
                Ok(())
            });

        let mut compute = MockCompute::new();
        compute.expect_list_for_vm().returning(|_, _| Ok(vec![]));
        compute.expect_start_migration().never();
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_begin().never();

        let action = reconcile(Arc::new(operation()), ctx(kube, compute, orchestrator))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());

        let status = capture.last();
        assert_eq!(status.phase, OperationPhase::Failed);
        assert_eq!(completed(&status).reason, "HotplugDisksNotShared");
        assert!(find_condition(&status.conditions, ConditionKind::SignalSent).is_none());
    }

    #[tokio::test]
    async fn other_compute_migration_rejects() {
        let capture = StatusCapture::default();
        let kube = kube(Some(vm(None)), &capture);
        let mut compute = MockCompute::new();
        compute.expect_list_for_vm().returning(|_, _| {
            let mut other = instance(Some(InstanceMigrationPhase::Running));
            other.metadata.name = Some("evacuation-123".into());
            Ok(vec![other])
        });
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_begin().never();

        reconcile(Arc::new(operation()), ctx(kube, compute, orchestrator))
            .await
            .unwrap();
        assert_eq!(completed(&capture.last()).reason, "OtherMigrationInProgress");
    }

    /// Idempotent re-entry: the attempt exists but SignalSent was lost
    #[tokio::test]
    async fn recovery_re_marks_signal_without_beginning_again() {
        let capture = StatusCapture::default();
        let kube = kube(
            Some(vm(Some(own_attempt_record(MigrationPhase::Migrating)))),
            &capture,
        );
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_begin().never();

        reconcile(
            Arc::new(operation()),
            ctx(kube, compute_at(Some(InstanceMigrationPhase::Running)), orchestrator),
        )
        .await
        .unwrap();

        let status = capture.last();
        assert_eq!(status.phase, OperationPhase::InProgress);
        assert_eq!(completed(&status).reason, "MigrationRunning");
        assert!(find_condition(&status.conditions, ConditionKind::SignalSent).is_some());
    }

    /// Story: the attempt was recorded, then the process died before compute
    /// started and before SignalSent was written. Recovery begins again so
    /// the attempt does not sit in Migrating forever.
    #[tokio::test]
    async fn recovery_begins_again_when_compute_never_started() {
        let capture = StatusCapture::default();
        let mut recorded = own_attempt_record(MigrationPhase::Migrating);
        recorded.instance = None;
        let kube = kube(Some(vm(Some(recorded))), &capture);

        let mut compute = MockCompute::new();
        compute.expect_get().returning(|_, _| Ok(None));
        let mut orchestrator = MockOrchestrator::new();
        orchestrator
            .expect_begin()
            .times(1)
            .returning(|_, _| Ok(Some(observation(None))));

        reconcile(Arc::new(operation()), ctx(kube, compute, orchestrator))
            .await
            .unwrap();

        let status = capture.last();
        assert!(find_condition(&status.conditions, ConditionKind::SignalSent).is_some());
        assert_eq!(status.phase, OperationPhase::Pending);
    }

    #[tokio::test]
    async fn recovery_leaves_a_lost_instance_to_the_orchestrator() {
        let capture = StatusCapture::default();
        let kube = kube(
            Some(vm(Some(own_attempt_record(MigrationPhase::Migrating)))),
            &capture,
        );
        let mut compute = MockCompute::new();
        compute.expect_get().returning(|_, _| Ok(None));
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_begin().never();

        reconcile(Arc::new(operation()), ctx(kube, compute, orchestrator))
            .await
            .unwrap();
        assert!(find_condition(&capture.last().conditions, ConditionKind::SignalSent).is_some());
    }

    #[tokio::test]
    async fn recovery_never_begins_a_finished_attempt() {
        let capture = StatusCapture::default();
        let mut recorded = own_attempt_record(MigrationPhase::Failed);
        recorded.instance = None;
        let kube = kube(Some(vm(Some(recorded))), &capture);
        let mut compute = MockCompute::new();
        compute.expect_get().returning(|_, _| Ok(None));
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_begin().never();

        reconcile(Arc::new(operation()), ctx(kube, compute, orchestrator))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn progress_is_mirrored_and_unchanged_status_is_not_rewritten() {
        let op = signalled(operation());
        let capture = StatusCapture::default();
        let kube = kube(
            Some(vm(Some(own_attempt_record(MigrationPhase::Migrating)))),
            &capture,
        );
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_begin().never();

        reconcile(
            Arc::new(op),
            ctx(kube, compute_at(Some(InstanceMigrationPhase::Running)), orchestrator),
        )
        .await
        .unwrap();
        assert!(capture.patches().is_empty());
    }

    #[tokio::test]
    async fn terminal_attempt_completes_operation() {
        let op = signalled(operation());
        let capture = StatusCapture::default();
        let done = own_attempt_record(MigrationPhase::Settling)
            .finish(MigrationResult::Succeeded, Utc::now());
        let kube = kube(Some(vm(Some(done))), &capture);

        let action = reconcile(
            Arc::new(op),
            ctx(
                kube,
                compute_at(Some(InstanceMigrationPhase::Succeeded)),
                MockOrchestrator::new(),
            ),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());

        let status = capture.last();
        assert_eq!(status.phase, OperationPhase::Completed);
        assert_eq!(completed(&status).status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn quota_rejection_keeps_operation_pending() {
        let op = signalled(operation());
        let capture = StatusCapture::default();
        let kube = kube(
            Some(vm(Some(own_attempt_record(MigrationPhase::Migrating)))),
            &capture,
        );
        let mut compute = MockCompute::new();
        compute
            .expect_get()
            .returning(|_, _| Ok(Some(instance(Some(InstanceMigrationPhase::Pending)))));
        compute.expect_observe().returning(|_| {
            let mut o = observation(Some(InstanceMigrationPhase::Pending));
            o.quota_rejected = Some("exceeded quota: compute".into());
            Ok(o)
        });

        reconcile(Arc::new(op), ctx(kube, compute, MockOrchestrator::new()))
            .await
            .unwrap();
        let status = capture.last();
        assert_eq!(status.phase, OperationPhase::Pending);
        assert_eq!(completed(&status).reason, "QuotaExceeded");
    }

    #[tokio::test]
    async fn terminal_operation_is_a_sink() {
        let mut op = signalled(operation());
        if let Some(s) = op.status.as_mut() {
            s.phase = OperationPhase::Completed;
        }
        let mut kube = MockKubeClient::new();
        kube.expect_get_vm().never();
        kube.expect_patch_operation_status().never();

        let action = reconcile(
            Arc::new(op),
            ctx(kube, MockCompute::new(), MockOrchestrator::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn power_operations_are_ignored() {
        let mut op = operation();
        op.spec.type_ = OperationType::Restart;
        let action = reconcile(
            Arc::new(op),
            ctx(MockKubeClient::new(), MockCompute::new(), MockOrchestrator::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: deleting a running operation aborts and releases it
    /// without waiting for the revert
    #[tokio::test]
    async fn deletion_cancels_and_releases() {
        let mut op = signalled(operation());
        op.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let capture = StatusCapture::default();
        let mut kube = MockKubeClient::new();
        let sink = capture.0.clone();
        kube.expect_patch_operation_status()
            .returning(move |_, _, status| {
                sink.lock().unwrap().push(status.clone());
                Ok(())
            });
        kube.expect_remove_finalizer()
            .withf(|_, name, f| name == "move" && f == VMOP_CLEANUP_FINALIZER)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut compute = MockCompute::new();
        compute
            .expect_request_abort()
            .withf(|ns, name| ns == "default" && name == "vmop-move")
            .times(1)
            .returning(|_, _| Err(Error::internal("api down")));

        let action = reconcile(Arc::new(op), ctx(kube, compute, MockOrchestrator::new()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(capture.last().phase, OperationPhase::Terminating);
    }

    #[tokio::test]
    async fn deletion_before_signal_only_releases() {
        let mut op = operation();
        op.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut kube = MockKubeClient::new();
        kube.expect_patch_operation_status().never();
        kube.expect_remove_finalizer()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut compute = MockCompute::new();
        compute.expect_request_abort().never();

        reconcile(Arc::new(op), ctx(kube, compute, MockOrchestrator::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn begin_failure_propagates_for_retry() {
        let capture = StatusCapture::default();
        let kube = kube(Some(vm(None)), &capture);
        let mut compute = MockCompute::new();
        compute.expect_list_for_vm().returning(|_, _| Ok(vec![]));
        let mut orchestrator = MockOrchestrator::new();
        orchestrator
            .expect_begin()
            .returning(|_, _| Err(OrchestratorError::Common(Error::internal("conflict"))));

        let err = reconcile(Arc::new(operation()), ctx(kube, compute, orchestrator))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(capture.patches().is_empty());
    }
}
