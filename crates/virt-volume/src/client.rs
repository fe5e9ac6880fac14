//! Kubernetes access for the disk controllers

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use virt_common::crd::{
    Condition, DiskTarget, VirtualDisk, VirtualDiskMigrationState, VirtualMachine,
    VirtualMachineOperation,
};
use virt_common::{Error, FIELD_MANAGER};

/// Status fields the disk migration handler owns
///
/// Serialized as a merge patch; unset fields are left alone on the server.
/// `conditions` is always written in full when present.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskStatusPatch {
    /// Replacement migration record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<VirtualDiskMigrationState>,
    /// Full condition list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// New backing volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<DiskTarget>,
    /// New storage class
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

impl DiskStatusPatch {
    /// Whether the patch would write nothing
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Trait abstracting Kubernetes client operations for the disk controllers
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a VirtualMachine, None if it does not exist
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, Error>;

    /// Merge-patch the owned fields of a VirtualDisk status
    async fn patch_disk_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &DiskStatusPatch,
    ) -> Result<(), Error>;

    /// List every VirtualMachineOperation in a namespace
    async fn list_operations(&self, namespace: &str)
        -> Result<Vec<VirtualMachineOperation>, Error>;

    /// Create a VirtualMachineOperation
    async fn create_operation(
        &self,
        namespace: &str,
        operation: &VirtualMachineOperation,
    ) -> Result<VirtualMachineOperation, Error>;
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

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, Error> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(vm) => Ok(Some(vm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_disk_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &DiskStatusPatch,
    ) -> Result<(), Error> {
        let api: Api<VirtualDisk> = Api::namespaced(self.client.clone(), namespace);
        let body = serde_json::json!({ "status": patch });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
            .await?;
        debug!(disk = %name, "patched disk status");
        Ok(())
    }

    async fn list_operations(
        &self,
        namespace: &str,
    ) -> Result<Vec<VirtualMachineOperation>, Error> {
        let api: Api<VirtualMachineOperation> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_operation(
        &self,
        namespace: &str,
        operation: &VirtualMachineOperation,
    ) -> Result<VirtualMachineOperation, Error> {
        let api: Api<VirtualMachineOperation> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), operation).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn empty_patch_serializes_to_empty_object() {
        let patch = DiskStatusPatch::default();
        assert!(patch.is_empty());
        assert_eq!(serde_json::to_value(&patch).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn patch_writes_only_owned_fields() {
        let patch = DiskStatusPatch {
            migration_state: Some(VirtualDiskMigrationState::started(
                Some("src".into()),
                "dst".into(),
                Utc::now(),
            )),
            storage_class_name: Some("fast".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["migrationState"]["targetPvc"], "dst");
        assert_eq!(json["storageClassName"], "fast");
        assert!(json.get("conditions").is_none());
        assert!(json.get("target").is_none());
    }
}
