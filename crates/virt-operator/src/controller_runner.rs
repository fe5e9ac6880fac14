//! Controller runner - builds the controller futures
//!
//! Each controller watches its own resource plus the objects it decides on.
//! Secondary watches go through a [`TransitionFilter`] so a controller is
//! woken only when a field it reads changed, and through a
//! [`ReferenceIndex`] where the link points the other way.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use virt_common::crd::{
    VirtualDisk, VirtualMachine, VirtualMachineInstanceMigration, VirtualMachineOperation,
};
use virt_common::VMOP_LABEL;
use virt_watch::triggers::{
    disk_changed_for_orchestrator, instance_changed, operation_changed,
    vm_changed_for_disks, vm_changed_for_orchestrator,
};
use virt_watch::{ReferenceIndex, TransitionFilter};

use crate::config::ControllerArgs;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be joined
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Namespaced or cluster-wide API depending on `--watch-namespace`
fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Keep a filter from holding deleted objects
///
/// Runs as a detached task for the life of the process.
fn prune_deleted<K>(filter: Arc<TransitionFilter<K>>, api: Api<K>)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut events = watcher::watcher(api, watcher_config()).boxed();
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => filter.track(&event),
                Err(e) => tracing::debug!(error = %e, "filter pruning watch error"),
            }
        }
    });
}

/// Build all migration controllers
pub fn build_controllers(client: Client, args: &ControllerArgs) -> Vec<ControllerFuture> {
    let namespace = args.watch_namespace.as_deref();
    let index = Arc::new(ReferenceIndex::new());

    let vm_ctx = Arc::new(virt_migration::Context::builder(client.clone()).build());
    let op_ctx = Arc::new(
        virt_operation::Context::builder(client.clone())
            .compute_driver(vm_ctx.compute.clone())
            .orchestrator(Arc::new(vm_ctx.orchestrator()))
            .build(),
    );
    let disk_ctx = Arc::new(
        virt_volume::Context::builder(client.clone())
            .index(index.clone())
            .config(args.volume_config())
            .build(),
    );

    let mut controllers = Vec::new();
    controllers.push(build_operation_controller(&client, namespace, op_ctx));
    controllers.push(build_vm_controller(&client, namespace, vm_ctx));
    controllers.extend(build_disk_controllers(&client, namespace, index, disk_ctx));
    controllers
}

/// VirtualMachineOperation handler
///
/// Woken by its compute instance and by the attempt record on its VM.
fn build_operation_controller(
    client: &Client,
    namespace: Option<&str>,
    ctx: Arc<virt_operation::Context>,
) -> ControllerFuture {
    let instances = Arc::new(TransitionFilter::new(instance_changed));
    let vms = Arc::new(TransitionFilter::new(vm_changed_for_orchestrator));
    prune_deleted(instances.clone(), api(client, namespace));
    prune_deleted(vms.clone(), api(client, namespace));

    tracing::info!("- VirtualMachineOperation controller");

    Box::pin(
        Controller::new(api::<VirtualMachineOperation>(client, namespace), watcher_config())
            .watches(
                api::<VirtualMachineInstanceMigration>(client, namespace),
                watcher_config(),
                move |instance| {
                    if !instances.admit(&instance) {
                        return None;
                    }
                    instance_to_operation(&instance)
                },
            )
            .watches(
                api::<VirtualMachine>(client, namespace),
                watcher_config(),
                move |vm| {
                    if !vms.admit(&vm) {
                        return None;
                    }
                    vm_to_operation(&vm)
                },
            )
            .shutdown_on_signal()
            .run(
                virt_operation::reconcile,
                virt_operation::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("VirtualMachineOperation")),
    )
}

/// VM migration orchestrator
///
/// Woken by the operation, the compute instance and every attached disk.
fn build_vm_controller(
    client: &Client,
    namespace: Option<&str>,
    ctx: Arc<virt_migration::Context>,
) -> ControllerFuture {
    let operations = Arc::new(TransitionFilter::new(operation_changed));
    let instances = Arc::new(TransitionFilter::new(instance_changed));
    let disks = Arc::new(TransitionFilter::new(disk_changed_for_orchestrator));
    prune_deleted(operations.clone(), api(client, namespace));
    prune_deleted(instances.clone(), api(client, namespace));
    prune_deleted(disks.clone(), api(client, namespace));

    tracing::info!("- VirtualMachine migration controller");

    Box::pin(
        Controller::new(api::<VirtualMachine>(client, namespace), watcher_config())
            .watches(
                api::<VirtualMachineOperation>(client, namespace),
                watcher_config(),
                move |op| {
                    if !operations.admit(&op) {
                        return None;
                    }
                    operation_to_vm(&op)
                },
            )
            .watches(
                api::<VirtualMachineInstanceMigration>(client, namespace),
                watcher_config(),
                move |instance| {
                    if !instances.admit(&instance) {
                        return None;
                    }
                    instance_to_vm(&instance)
                },
            )
            .watches(
                api::<VirtualDisk>(client, namespace),
                watcher_config(),
                move |disk| {
                    if !disks.admit(&disk) {
                        return Vec::new();
                    }
                    disk_to_vms(&disk)
                },
            )
            .shutdown_on_signal()
            .run(
                virt_migration::reconcile,
                virt_migration::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("VirtualMachine")),
    )
}

/// Per-disk coordinator and storage-class trigger
///
/// Both map VM and operation changes to disks through the index the
/// coordinator maintains.
fn build_disk_controllers(
    client: &Client,
    namespace: Option<&str>,
    index: Arc<ReferenceIndex>,
    ctx: Arc<virt_volume::Context>,
) -> Vec<ControllerFuture> {
    let vms = Arc::new(TransitionFilter::new(vm_changed_for_disks));
    prune_deleted(vms.clone(), api(client, namespace));
    let vm_index = index.clone();
    let coordinator = Controller::new(api::<VirtualDisk>(client, namespace), watcher_config())
        .watches(
            api::<VirtualMachine>(client, namespace),
            watcher_config(),
            move |vm| {
                if !vms.admit(&vm) {
                    return Vec::new();
                }
                dependent_disks(&vm_index, vm.namespace().as_deref(), &vm.name_any())
            },
        )
        .shutdown_on_signal()
        .run(
            virt_volume::reconcile,
            virt_volume::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("VirtualDisk"));

    // A finished operation can unblock a storage class change.
    let operations = Arc::new(TransitionFilter::new(operation_changed));
    prune_deleted(operations.clone(), api(client, namespace));
    let trigger = Controller::new(api::<VirtualDisk>(client, namespace), watcher_config())
        .watches(
            api::<VirtualMachineOperation>(client, namespace),
            watcher_config(),
            move |op| {
                if !operations.admit(&op) || !op.is_migration() {
                    return Vec::new();
                }
                dependent_disks(&index, op.namespace().as_deref(), &op.spec.virtual_machine)
            },
        )
        .shutdown_on_signal()
        .run(
            virt_volume::trigger::reconcile,
            virt_volume::trigger::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("StorageClassTrigger"));

    tracing::info!("- VirtualDisk migration controller");
    tracing::info!("- Storage class migration trigger");

    vec![Box::pin(coordinator), Box::pin(trigger)]
}

/// The operation that created a compute instance, from its label
pub fn instance_to_operation(
    instance: &VirtualMachineInstanceMigration,
) -> Option<ObjectRef<VirtualMachineOperation>> {
    let namespace = instance.namespace()?;
    let op = instance.labels().get(VMOP_LABEL)?;
    Some(ObjectRef::new(op).within(&namespace))
}

/// The operation owning the VM's attempt
pub fn vm_to_operation(vm: &VirtualMachine) -> Option<ObjectRef<VirtualMachineOperation>> {
    let namespace = vm.namespace()?;
    let attempt = vm.migration_state()?;
    Some(ObjectRef::new(&attempt.operation).within(&namespace))
}

/// The VM a migration operation targets
pub fn operation_to_vm(op: &VirtualMachineOperation) -> Option<ObjectRef<VirtualMachine>> {
    if !op.is_migration() {
        return None;
    }
    let namespace = op.namespace()?;
    Some(ObjectRef::new(&op.spec.virtual_machine).within(&namespace))
}

/// The VM a compute instance moves
pub fn instance_to_vm(
    instance: &VirtualMachineInstanceMigration,
) -> Option<ObjectRef<VirtualMachine>> {
    let namespace = instance.namespace()?;
    Some(ObjectRef::new(&instance.spec.vmi_name).within(&namespace))
}

/// VMs a disk is attached to
pub fn disk_to_vms(disk: &VirtualDisk) -> Vec<ObjectRef<VirtualMachine>> {
    let Some(namespace) = disk.namespace() else {
        return Vec::new();
    };
    disk.attached_vm_names()
        .map(|vm| ObjectRef::new(vm).within(&namespace))
        .collect()
}

/// Disks the coordinator has recorded as attached to a VM
pub fn dependent_disks(
    index: &ReferenceIndex,
    namespace: Option<&str>,
    vm: &str,
) -> Vec<ObjectRef<VirtualDisk>> {
    let Some(namespace) = namespace else {
        return Vec::new();
    };
    let disks = index.dependents(namespace, vm);
    tracing::debug!(
        vm = %vm,
        namespace = %namespace,
        affected_count = disks.len(),
        "Triggering re-reconciliation of dependent disks"
    );
    disks
        .into_iter()
        .map(|disk| ObjectRef::new(&disk).within(namespace))
        .collect()
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
