//! Kubernetes access for the orchestrator

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use virt_common::crd::{
    Condition, VirtualDisk, VirtualMachine, VirtualMachineBlockDeviceAttachment,
    VirtualMachineMigrationState, VirtualMachineOperation,
};
use virt_common::{Error, FIELD_MANAGER};

/// Status fields the orchestrator owns on a VirtualMachine
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatusPatch {
    /// Replacement attempt record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<VirtualMachineMigrationState>,
    /// Node the guest now runs on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Full condition list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl VmStatusPatch {
    /// Patch that only replaces the attempt record
    pub fn attempt(state: VirtualMachineMigrationState) -> Self {
        Self {
            migration_state: Some(state),
            ..Default::default()
        }
    }
}

/// Trait abstracting Kubernetes client operations for the orchestrator
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a VirtualMachineOperation, None if it does not exist
    async fn get_operation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineOperation>, Error>;

    /// Get a VirtualDisk, None if it does not exist
    async fn get_disk(&self, namespace: &str, name: &str) -> Result<Option<VirtualDisk>, Error>;

    /// List hotplug attachments in a namespace
    async fn list_attachments(
        &self,
        namespace: &str,
    ) -> Result<Vec<VirtualMachineBlockDeviceAttachment>, Error>;

    /// Merge-patch the owned fields of a VirtualMachine status
    async fn patch_vm_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &VmStatusPatch,
    ) -> Result<(), Error>;

    /// Merge-patch the VM status only if it is unchanged since `vm` was read
    ///
    /// The patch carries `vm`'s resourceVersion, so a concurrent write fails
    /// with a 409 instead of being overwritten. Returns the updated VM.
    async fn record_attempt(
        &self,
        vm: &VirtualMachine,
        patch: &VmStatusPatch,
    ) -> Result<VirtualMachine, Error>;
}

/// Merge body for a status patch guarded by a resourceVersion
pub fn guarded_status_body(
    resource_version: &str,
    patch: &VmStatusPatch,
) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "status": patch,
    })
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_operation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineOperation>, Error> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn get_disk(&self, namespace: &str, name: &str) -> Result<Option<VirtualDisk>, Error> {
        get_opt(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn list_attachments(
        &self,
        namespace: &str,
    ) -> Result<Vec<VirtualMachineBlockDeviceAttachment>, Error> {
        let api: Api<VirtualMachineBlockDeviceAttachment> =
            Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_vm_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &VmStatusPatch,
    ) -> Result<(), Error> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        let body = serde_json::json!({ "status": patch });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
            .await?;
        debug!(vm = %name, "patched VM status");
        Ok(())
    }

    async fn record_attempt(
        &self,
        vm: &VirtualMachine,
        patch: &VmStatusPatch,
    ) -> Result<VirtualMachine, Error> {
        let name = vm.name_any();
        let namespace = vm
            .namespace()
            .ok_or_else(|| Error::validation_for(&name, "virtual machine has no namespace"))?;
        let version = vm.resource_version().ok_or_else(|| {
            Error::internal_with_context(&name, "virtual machine has no resourceVersion")
        })?;
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), &namespace);
        let body = guarded_status_body(&version, patch);
        let updated = api
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
            .await?;
        debug!(vm = %name, resource_version = %version, "recorded migration attempt");
        Ok(updated)
    }
}
