//! Target volume primitive
//!
//! The coordinator never copies bytes itself. It asks a [`StorageBackend`]
//! for a target volume and the compute migration mirrors the disk into it.
//! The backend only reports whether a target can receive data. A bound
//! claim says nothing about whether the mirror ran.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use virt_common::crd::VirtualDisk;
use virt_common::quantity::{format_bytes, parse_bytes, VolumeMode};
use virt_common::{
    Error, DEPRECATED_STORAGE_CLASS_LABEL, FIELD_MANAGER, VOLUME_MODE_ANNOTATION,
};

/// Binding mode that defers provisioning until a consumer is scheduled
pub const WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";

/// Label placed on target volumes naming the disk they belong to
pub const DISK_LABEL: &str = "virtualization.dev/disk";

/// Readiness of a target volume to receive mirrored data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetStatus {
    /// Waiting for provisioning
    Pending,
    /// Provisioning deferred to the consumer; usable by the target
    AwaitingConsumer,
    /// Provisioned
    Bound,
    /// The volume is lost
    Lost,
    /// The volume does not exist
    Missing,
}

impl TargetStatus {
    /// Whether the compute migration can mirror into the volume
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Bound | Self::AwaitingConsumer)
    }

    /// Whether the volume is gone for good
    pub fn is_lost(self) -> bool {
        matches!(self, Self::Lost | Self::Missing)
    }
}

/// What to create as a migration target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetVolumeSpec {
    /// StorageClass of the target
    pub storage_class: String,
    /// Requested size in bytes
    pub size_bytes: u64,
    /// Block or Filesystem
    pub volume_mode: VolumeMode,
    /// Access modes, copied from the source
    pub access_modes: Vec<String>,
}

/// A StorageClass as the coordinator sees it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageClassInfo {
    /// Class name
    pub name: String,
    /// `volumeBindingMode`
    pub volume_binding_mode: Option<String>,
    /// Marked with the deprecated label
    pub deprecated: bool,
    /// Being deleted
    pub terminating: bool,
    /// Volume mode new volumes of this class should use
    pub volume_mode: Option<VolumeMode>,
}

impl StorageClassInfo {
    /// Whether claims bind only once a consumer is scheduled
    pub fn waits_for_first_consumer(&self) -> bool {
        self.volume_binding_mode.as_deref() == Some(WAIT_FOR_FIRST_CONSUMER)
    }
}

/// A volume as the coordinator sees it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Claim name
    pub name: String,
    /// Claim phase (Pending, Bound, Lost)
    pub phase: Option<String>,
    /// Provisioned capacity in bytes
    pub capacity_bytes: Option<u64>,
    /// Requested capacity in bytes
    pub requested_bytes: Option<u64>,
    /// Block or Filesystem
    pub volume_mode: VolumeMode,
    /// StorageClass of the claim
    pub storage_class: Option<String>,
    /// Access modes
    pub access_modes: Vec<String>,
}

/// Trait abstracting the target volume primitive
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create a target volume owned by the disk and return its name
    async fn create_target_volume(
        &self,
        disk: &VirtualDisk,
        spec: &TargetVolumeSpec,
    ) -> Result<String, Error>;

    /// Report whether a volume can receive mirrored data
    async fn target_status(&self, namespace: &str, name: &str) -> Result<TargetStatus, Error>;

    /// Get a volume by name
    async fn get_volume(&self, namespace: &str, name: &str) -> Result<Option<VolumeInfo>, Error>;

    /// Delete a volume, stripping protection finalizers; a missing volume counts as done
    async fn delete_volume(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a StorageClass by name
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClassInfo>, Error>;

    /// List the volumes owned by a disk
    async fn list_owned_volumes(&self, disk: &VirtualDisk) -> Result<Vec<VolumeInfo>, Error>;
}

/// Storage backend built on PersistentVolumeClaims
pub struct PvcStorageBackend {
    client: Client,
}

impl PvcStorageBackend {
    /// Create a new backend wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Project a claim into the coordinator's view
pub fn volume_info(pvc: &PersistentVolumeClaim) -> VolumeInfo {
    let storage_bytes = |map: Option<&BTreeMap<String, Quantity>>| {
        map.and_then(|m| m.get("storage"))
            .and_then(|q| parse_bytes(&q.0).ok())
    };
    let spec = pvc.spec.as_ref();

    VolumeInfo {
        name: pvc.name_any(),
        phase: pvc.status.as_ref().and_then(|s| s.phase.clone()),
        capacity_bytes: storage_bytes(pvc.status.as_ref().and_then(|s| s.capacity.as_ref())),
        requested_bytes: storage_bytes(
            spec.and_then(|s| s.resources.as_ref())
                .and_then(|r| r.requests.as_ref()),
        ),
        volume_mode: VolumeMode::from_spec(spec.and_then(|s| s.volume_mode.as_deref())),
        storage_class: spec.and_then(|s| s.storage_class_name.clone()),
        access_modes: spec
            .and_then(|s| s.access_modes.clone())
            .unwrap_or_default(),
    }
}

/// Project a StorageClass into the coordinator's view
pub fn storage_class_info(class: &StorageClass) -> StorageClassInfo {
    StorageClassInfo {
        name: class.name_any(),
        volume_binding_mode: class.volume_binding_mode.clone(),
        deprecated: class
            .labels()
            .get(DEPRECATED_STORAGE_CLASS_LABEL)
            .is_some_and(|v| v == "true"),
        terminating: class.metadata.deletion_timestamp.is_some(),
        volume_mode: class
            .annotations()
            .get(VOLUME_MODE_ANNOTATION)
            .map(|m| VolumeMode::from_spec(Some(m))),
    }
}

/// Build the target claim for a disk
pub fn build_target_claim(
    disk: &VirtualDisk,
    spec: &TargetVolumeSpec,
) -> Result<PersistentVolumeClaim, Error> {
    let disk_name = disk.name_any();
    let uid = disk
        .uid()
        .ok_or_else(|| Error::storage_permanent(&disk_name, "disk has no uid"))?;
    let owner = disk
        .controller_owner_ref(&())
        .ok_or_else(|| Error::storage_permanent(&disk_name, "disk has no owner reference"))?;

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            generate_name: Some(format!("vd-{uid}-")),
            namespace: disk.namespace(),
            owner_references: Some(vec![owner]),
            labels: Some(BTreeMap::from([(DISK_LABEL.to_string(), disk_name)])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(spec.access_modes.clone()),
            storage_class_name: Some(spec.storage_class.clone()),
            volume_mode: Some(spec.volume_mode.as_str().to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(format_bytes(spec.size_bytes)),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Map a claim phase to target readiness
pub fn target_status_for_phase(phase: Option<&str>, waits_for_consumer: bool) -> TargetStatus {
    match phase {
        Some("Bound") => TargetStatus::Bound,
        Some("Lost") => TargetStatus::Lost,
        _ if waits_for_consumer => TargetStatus::AwaitingConsumer,
        _ => TargetStatus::Pending,
    }
}

#[async_trait]
impl StorageBackend for PvcStorageBackend {
    async fn create_target_volume(
        &self,
        disk: &VirtualDisk,
        spec: &TargetVolumeSpec,
    ) -> Result<String, Error> {
        let claim = build_target_claim(disk, spec)?;
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let created = self
            .claims(&namespace)
            .create(&PostParams::default(), &claim)
            .await?;
        let name = created.name_any();
        info!(
            disk = %disk.name_any(),
            volume = %name,
            storage_class = %spec.storage_class,
            size = %format_bytes(spec.size_bytes),
            "created target volume"
        );
        Ok(name)
    }

    async fn target_status(&self, namespace: &str, name: &str) -> Result<TargetStatus, Error> {
        let Some(volume) = self.get_volume(namespace, name).await? else {
            return Ok(TargetStatus::Missing);
        };

        let waits_for_consumer = match volume.storage_class.as_deref() {
            Some(class) if volume.phase.as_deref() == Some("Pending") => self
                .get_storage_class(class)
                .await?
                .is_some_and(|c| c.waits_for_first_consumer()),
            _ => false,
        };
        Ok(target_status_for_phase(volume.phase.as_deref(), waits_for_consumer))
    }

    async fn get_volume(&self, namespace: &str, name: &str) -> Result<Option<VolumeInfo>, Error> {
        match self.claims(namespace).get(name).await {
            Ok(pvc) => Ok(Some(volume_info(&pvc))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_volume(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api = self.claims(namespace);
        let strip = serde_json::json!({
            "metadata": { "finalizers": null }
        });
        match api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&strip))
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(volume = %name, "volume already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(volume = %name, "deleted volume");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClassInfo>, Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(class) => Ok(Some(storage_class_info(&class))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_owned_volumes(&self, disk: &VirtualDisk) -> Result<Vec<VolumeInfo>, Error> {
        let (Some(namespace), Some(uid)) = (disk.namespace(), disk.uid()) else {
            return Ok(vec![]);
        };
        let list = self
            .claims(&namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list
            .items
            .iter()
            .filter(|pvc| pvc.owner_references().iter().any(|o| o.uid == uid))
            .map(volume_info)
            .collect())
    }
}
