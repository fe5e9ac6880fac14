//! Compute migration driver
//!
//! Wraps the hypervisor layer's `VirtualMachineInstanceMigration` resource.
//! The driver only ever creates one instance per operation (named after it),
//! reads its progress and asks it to abort. It never deletes instances and
//! never cancels on its own: an unschedulable target stays Pending until the
//! operation is withdrawn.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use virt_common::crd::{
    InstanceMigrationPhase, MigratedVolume, VirtualMachine, VirtualMachineInstanceMigration,
    VirtualMachineInstanceMigrationSpec, VirtualMachineOperation, MIGRATION_JOB_UID_LABEL,
};
use virt_common::{Error, FIELD_MANAGER, VMOP_LABEL, VM_LABEL};

use crate::observation::ComputeObservation;

/// Name of the compute migration instance owned by an operation
pub fn instance_name(operation: &str) -> String {
    format!("vmop-{operation}")
}

/// Trait abstracting the hypervisor migration primitive
///
/// This trait allows mocking the hypervisor layer in tests while using
/// the real Kubernetes API in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeMigrationDriver: Send + Sync {
    /// Create the instance for an operation, or return the one that already exists
    ///
    /// # Arguments
    ///
    /// * `vm` - The virtual machine to move
    /// * `operation` - The operation owning the attempt
    /// * `target` - Extra node labels for the target, passed through verbatim
    /// * `volumes` - Disks whose data the migration mirrors onto target claims
    ///
    /// An existing instance owned by a different operation is a conflict.
    async fn start_migration(
        &self,
        vm: &VirtualMachine,
        operation: &VirtualMachineOperation,
        target: &BTreeMap<String, String>,
        volumes: &[MigratedVolume],
    ) -> Result<VirtualMachineInstanceMigration, Error>;

    /// Get an instance by name
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineInstanceMigration>, Error>;

    /// List every instance moving the given VM, whoever created it
    async fn list_for_vm(
        &self,
        namespace: &str,
        vm: &str,
    ) -> Result<Vec<VirtualMachineInstanceMigration>, Error>;

    /// Observe an instance, including the target pod's scheduling verdict while pending
    async fn observe(
        &self,
        instance: &VirtualMachineInstanceMigration,
    ) -> Result<ComputeObservation, Error>;

    /// Ask an instance to abort; idempotent, and a missing instance counts as done
    async fn request_abort(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Why the target pod cannot be scheduled, if it cannot
    async fn target_unschedulable(
        &self,
        instance: &VirtualMachineInstanceMigration,
    ) -> Result<Option<String>, Error>;
}

/// Real driver talking to the Kubernetes API
pub struct KubeComputeDriver {
    client: Client,
}

impl KubeComputeDriver {
    /// Create a new driver wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<VirtualMachineInstanceMigration> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Build the instance an operation would create
pub fn build_instance(
    vm: &VirtualMachine,
    operation: &VirtualMachineOperation,
    target: &BTreeMap<String, String>,
    volumes: &[MigratedVolume],
) -> Result<VirtualMachineInstanceMigration, Error> {
    let op_name = operation.name_any();
    let namespace = operation
        .namespace()
        .ok_or_else(|| Error::validation_for(&op_name, "operation has no namespace"))?;
    let owner = operation.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(format!("{namespace}/{op_name}"), "operation has no uid")
    })?;

    let mut instance = VirtualMachineInstanceMigration::new(
        &instance_name(&op_name),
        VirtualMachineInstanceMigrationSpec {
            vmi_name: vm.name_any(),
            added_node_selector: (!target.is_empty()).then(|| target.clone()),
            abort_requested: false,
            volumes: volumes.to_vec(),
        },
    );
    instance.metadata.namespace = Some(namespace);
    instance.metadata.owner_references = Some(vec![owner]);
    instance.metadata.labels = Some(BTreeMap::from([
        (VMOP_LABEL.to_string(), op_name),
        (VM_LABEL.to_string(), vm.name_any()),
    ]));
    Ok(instance)
}

/// Whether an instance is controlled by the operation with the given uid
pub fn owned_by(instance: &VirtualMachineInstanceMigration, operation_uid: &str) -> bool {
    instance
        .owner_references()
        .iter()
        .any(|o| o.uid == operation_uid)
}

/// Extract the Unschedulable message from a target pod
pub fn pod_unschedulable_message(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some("Unschedulable")
        })
        .map(|c| {
            c.message
                .clone()
                .unwrap_or_else(|| "target pod is unschedulable".to_string())
        })
}

#[async_trait]
impl ComputeMigrationDriver for KubeComputeDriver {
    async fn start_migration(
        &self,
        vm: &VirtualMachine,
        operation: &VirtualMachineOperation,
        target: &BTreeMap<String, String>,
        volumes: &[MigratedVolume],
    ) -> Result<VirtualMachineInstanceMigration, Error> {
        let instance = build_instance(vm, operation, target, volumes)?;
        let namespace = instance.namespace().unwrap_or_default();
        let name = instance.name_any();
        let api = self.api(&namespace);

        match api.create(&PostParams::default(), &instance).await {
            Ok(created) => {
                info!(instance = %name, vm = %vm.name_any(), "created compute migration instance");
                Ok(created)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let existing = api.get(&name).await?;
                let uid = operation.uid().unwrap_or_default();
                if !owned_by(&existing, &uid) {
                    warn!(
                        instance = %name,
                        operation_uid = %uid,
                        "compute migration instance belongs to another operation"
                    );
                    return Err(Error::migration_for(
                        &name,
                        "compute migration instance belongs to another operation",
                    ));
                }
                debug!(instance = %name, "compute migration instance already exists");
                Ok(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineInstanceMigration>, Error> {
        match self.api(namespace).get(name).await {
            Ok(instance) => Ok(Some(instance)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_for_vm(
        &self,
        namespace: &str,
        vm: &str,
    ) -> Result<Vec<VirtualMachineInstanceMigration>, Error> {
        let list = self.api(namespace).list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|i| i.spec.vmi_name == vm)
            .collect())
    }

    async fn observe(
        &self,
        instance: &VirtualMachineInstanceMigration,
    ) -> Result<ComputeObservation, Error> {
        let scheduling = matches!(
            instance.phase(),
            None | Some(InstanceMigrationPhase::Pending | InstanceMigrationPhase::Scheduling)
        );
        let unschedulable = if scheduling {
            self.target_unschedulable(instance).await?
        } else {
            None
        };
        Ok(ComputeObservation::from_instance(instance, unschedulable))
    }

    async fn request_abort(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let patch = serde_json::json!({
            "spec": { "abortRequested": true }
        });
        match self
            .api(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                info!(instance = %name, "requested compute migration abort");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(instance = %name, "compute migration instance already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn target_unschedulable(
        &self,
        instance: &VirtualMachineInstanceMigration,
    ) -> Result<Option<String>, Error> {
        let (Some(namespace), Some(uid)) = (instance.namespace(), instance.uid()) else {
            return Ok(None);
        };
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let selector = format!("{MIGRATION_JOB_UID_LABEL}={uid}");
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items.iter().find_map(pod_unschedulable_message))
    }
}
