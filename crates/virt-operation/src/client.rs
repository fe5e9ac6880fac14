//! Kubernetes access for the operation handler

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use virt_common::crd::{
    VirtualDisk, VirtualMachine, VirtualMachineBlockDeviceAttachment, VirtualMachineOperation,
    VirtualMachineOperationStatus,
};
use virt_common::{Error, FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations for the operation handler
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a VirtualMachine, None if it does not exist
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, Error>;

    /// Get a VirtualDisk, None if it does not exist
    async fn get_disk(&self, namespace: &str, name: &str) -> Result<Option<VirtualDisk>, Error>;

    /// List hotplug attachments in a namespace
    async fn list_attachments(
        &self,
        namespace: &str,
    ) -> Result<Vec<VirtualMachineBlockDeviceAttachment>, Error>;

    /// Merge-patch the status of a VirtualMachineOperation
    async fn patch_operation_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualMachineOperationStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer to a VirtualMachineOperation
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from a VirtualMachineOperation
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
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

    fn operations(&self, namespace: &str) -> Api<VirtualMachineOperation> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, Error> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_disk(&self, namespace: &str, name: &str) -> Result<Option<VirtualDisk>, Error> {
        let api: Api<VirtualDisk> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_attachments(
        &self,
        namespace: &str,
    ) -> Result<Vec<VirtualMachineBlockDeviceAttachment>, Error> {
        let api: Api<VirtualMachineBlockDeviceAttachment> =
            Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_operation_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualMachineOperationStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.operations(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        debug!(vmop = %name, phase = %status.phase, "patched operation status");
        Ok(())
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api = self.operations(namespace);
        let Some(op) = api.get_opt(name).await? else {
            return Ok(());
        };
        let mut finalizers = op.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api = self.operations(namespace);
        let Some(op) = api.get_opt(name).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = op
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
