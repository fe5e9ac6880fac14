//! VirtualDisk migration controller
//!
//! Executes the [`DiskAction`] chosen for a disk. Each pass re-reads the VM
//! the disk is attached to, applies at most one action and patches only the
//! status fields that changed. Target readiness is polled; there is no
//! timeout. A target is promoted only if the VM's attempt recorded that the
//! compute migration mirrors into it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use virt_common::crd::{
    remove_condition, set_condition, Condition, ConditionKind, ConditionStatus, DiskTarget,
    MigrationResult, VirtualDisk, VirtualDiskMigrationState, VirtualMachine,
};
use virt_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use virt_common::metrics::{record_disk_migration, record_reconcile_error, Outcome};
use virt_common::quantity::{parse_bytes, target_size};
use virt_watch::ReferenceIndex;

use crate::action::{determine_disk_action, DiskAction};
use crate::client::{DiskStatusPatch, KubeClient, KubeClientImpl};
use crate::error::DiskMigrationError;
use crate::storage::{PvcStorageBackend, StorageBackend, TargetStatus, TargetVolumeSpec};

/// Name the controller reports events as
pub const CONTROLLER_NAME: &str = "virtualdisk-migration-controller";

/// Requeue while a migration is in flight
const PROGRESS_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue while waiting on something the controller does not watch
const BLOCKED_REQUEUE: Duration = Duration::from_secs(30);

/// Message recorded when a declared disk never started before the attempt moved on
pub const NOT_STARTED_MESSAGE: &str = "not started";

/// Message recorded when a disk rolls back to its source
pub const REVERTED_MESSAGE: &str = "Migration reverted.";

/// Reasons on a disk's `Migrating` condition
pub mod condition_reasons {
    /// Target volume created, not yet able to receive data
    pub const WAIT_FOR_TARGET_READY: &str = "WaitForTargetReady";
    /// Target volume usable by the destination
    pub const TARGET_READY: &str = "TargetReady";
    /// Disk is being resized
    pub const RESIZING_IN_PROGRESS: &str = "ResizingInProgress";
    /// Disk is being snapshotted
    pub const SNAPSHOTTING_IN_PROGRESS: &str = "SnapshottingInProgress";
    /// Target storage class does not exist yet
    pub const STORAGE_CLASS_NOT_FOUND: &str = "StorageClassNotFound";
}

use condition_reasons::*;

/// Operator-level settings for disk migrations
#[derive(Clone, Debug)]
pub struct VolumeConfig {
    /// Storage classes disks may migrate to; empty allows all
    pub allowed_storage_classes: Vec<String>,
    /// Steady-state requeue interval
    pub requeue_interval: Duration,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            allowed_storage_classes: Vec::new(),
            requeue_interval: Duration::from_secs(300),
        }
    }
}

impl VolumeConfig {
    /// Whether disks may migrate to the class
    pub fn allows(&self, class: &str) -> bool {
        self.allowed_storage_classes.is_empty()
            || self.allowed_storage_classes.iter().any(|c| c == class)
    }
}

/// Controller context shared by the disk migration and trigger controllers
///
/// Use [`ContextBuilder`] to construct instances.
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Target volume primitive
    pub storage: Arc<dyn StorageBackend>,
    /// Event publisher for `kubectl describe` visibility
    pub events: Arc<dyn EventPublisher>,
    /// Disk → VM references, read only by the watch mappers
    pub index: Arc<ReferenceIndex>,
    /// Operator settings
    pub config: VolumeConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            kube,
            storage,
            events: Arc::new(virt_common::events::NoopEventPublisher),
            index: Arc::new(ReferenceIndex::new()),
            config: VolumeConfig::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    storage: Option<Arc<dyn StorageBackend>>,
    events: Option<Arc<dyn EventPublisher>>,
    index: Option<Arc<ReferenceIndex>>,
    config: VolumeConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            storage: None,
            events: None,
            index: None,
            config: VolumeConfig::default(),
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the storage backend
    pub fn storage_backend(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a reference index with the watch mappers
    pub fn index(mut self, index: Arc<ReferenceIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Set operator settings
    pub fn config(mut self, config: VolumeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            storage: self
                .storage
                .unwrap_or_else(|| Arc::new(PvcStorageBackend::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            index: self.index.unwrap_or_default(),
            config: self.config,
        }
    }
}

/// Reconcile the migration side of a VirtualDisk
#[instrument(skip(disk, ctx), fields(disk = %disk.name_any()))]
pub async fn reconcile(
    disk: Arc<VirtualDisk>,
    ctx: Arc<Context>,
) -> Result<Action, DiskMigrationError> {
    let name = disk.name_any();
    let namespace = disk
        .namespace()
        .ok_or(DiskMigrationError::MissingNamespace)?;

    if disk.metadata.deletion_timestamp.is_some() {
        ctx.index.remove(&namespace, &name);
        return Ok(Action::await_change());
    }

    // A detached disk finds its VM through the in-flight record.
    let attached: Vec<String> = disk.attached_vm_names().map(str::to_string).collect();
    let vm_name = attached.first().cloned().or_else(|| {
        disk.migration_state()
            .filter(|r| r.is_in_progress())
            .and_then(|r| r.virtual_machine.clone())
    });
    match (&vm_name, attached.is_empty()) {
        (_, false) => ctx.index.put(&namespace, &name, attached.iter().cloned()),
        (Some(vm), true) => ctx.index.put(&namespace, &name, [vm.clone()]),
        (None, true) => ctx.index.remove(&namespace, &name),
    }

    let vm = match &vm_name {
        Some(vm_name) => ctx.kube.get_vm(&namespace, vm_name).await?,
        None => None,
    };

    let action = determine_disk_action(&disk, vm.as_ref());
    debug!(?action, vm = ?vm_name, "determined disk action");

    let pass = Pass {
        ctx: &ctx,
        disk: &disk,
        vm: vm.as_ref(),
        namespace: &namespace,
    };
    match action {
        DiskAction::None => Ok(Action::requeue(ctx.config.requeue_interval)),
        DiskAction::PrepareTarget => pass.prepare_target().await,
        DiskAction::Sync => pass.sync().await,
        DiskAction::Complete => pass.complete().await,
        DiskAction::Revert => pass.revert().await,
        DiskAction::Abandon => pass.abandon().await,
    }
}

/// Error policy for the disk migration controller
pub fn error_policy(
    disk: Arc<VirtualDisk>,
    error: &DiskMigrationError,
    _ctx: Arc<Context>,
) -> Action {
    let retryable = error.is_retryable();
    error!(
        ?error,
        disk = %disk.name_any(),
        retryable,
        "disk migration reconciliation failed"
    );
    record_reconcile_error("virtualdisk", retryable);
    if retryable {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}

/// One reconcile pass over a disk
struct Pass<'a> {
    ctx: &'a Context,
    disk: &'a VirtualDisk,
    vm: Option<&'a VirtualMachine>,
    namespace: &'a str,
}

impl Pass<'_> {
    fn name(&self) -> String {
        self.disk.name_any()
    }

    /// Conditions with `Migrating` replaced (or removed), None when nothing changes
    fn migrating(&self, condition: Option<Condition>) -> Option<Vec<Condition>> {
        let current = self.disk.conditions();
        let mut conditions = current.to_vec();
        match condition {
            Some(c) => set_condition(&mut conditions, c),
            None => remove_condition(&mut conditions, ConditionKind::Migrating),
        }
        (conditions != current).then_some(conditions)
    }

    fn migrating_condition(status: ConditionStatus, reason: &str, message: &str) -> Condition {
        Condition::new(ConditionKind::Migrating, status, reason, message)
    }

    async fn write(&self, patch: DiskStatusPatch) -> Result<(), DiskMigrationError> {
        if patch.is_empty() {
            return Ok(());
        }
        self.ctx
            .kube
            .patch_disk_status(self.namespace, &self.name(), &patch)
            .await?;
        Ok(())
    }

    async fn event(&self, type_: EventType, reason: &str, note: String) {
        self.ctx
            .events
            .publish(
                &self.disk.object_ref(&()),
                type_,
                reason,
                actions::MIGRATE_VOLUME,
                Some(note),
            )
            .await;
    }

    /// Park the disk with a False `Migrating` condition and try again later
    async fn wait(&self, reason: &str, message: String) -> Result<Action, DiskMigrationError> {
        info!(disk = %self.name(), reason, %message, "disk migration cannot start yet");
        let conditions = self.migrating(Some(Self::migrating_condition(
            ConditionStatus::False,
            reason,
            &message,
        )));
        self.write(DiskStatusPatch {
            conditions,
            ..Default::default()
        })
        .await?;
        Ok(Action::requeue(BLOCKED_REQUEUE))
    }

    /// Record a terminal failure that never touched storage
    async fn fail_now(&self, message: String) -> Result<Action, DiskMigrationError> {
        warn!(disk = %self.name(), %message, "disk migration failed before start");
        let record = VirtualDiskMigrationState::failed_immediately(
            self.disk.current_pvc().map(str::to_string),
            &message,
            Utc::now(),
        );
        self.write(DiskStatusPatch {
            migration_state: Some(record),
            conditions: self.migrating(None),
            ..Default::default()
        })
        .await?;
        record_disk_migration(Outcome::Failed);
        self.event(EventType::Warning, reasons::DISK_MIGRATION_REVERTED, message)
            .await;
        Ok(Action::requeue(self.ctx.config.requeue_interval))
    }

    async fn prepare_target(&self) -> Result<Action, DiskMigrationError> {
        let name = self.name();

        if self.disk.has_condition(ConditionKind::Resizing) {
            return self
                .wait(RESIZING_IN_PROGRESS, "Disk is being resized.".to_string())
                .await;
        }
        if self.disk.has_condition(ConditionKind::Snapshotting) {
            return self
                .wait(
                    SNAPSHOTTING_IN_PROGRESS,
                    "Disk is being snapshotted.".to_string(),
                )
                .await;
        }

        let Some(class_name) = self.disk.desired_storage_class() else {
            return self
                .fail_now("Target storage class is not known.".to_string())
                .await;
        };
        let Some(class) = self.ctx.storage.get_storage_class(class_name).await? else {
            return self
                .wait(
                    STORAGE_CLASS_NOT_FOUND,
                    format!("Storage class {class_name} not found."),
                )
                .await;
        };
        if !self.ctx.config.allows(&class.name) {
            return self
                .fail_now(format!(
                    "Storage class {} is not allowed for disk migration.",
                    class.name
                ))
                .await;
        }
        if class.deprecated {
            return self
                .fail_now(format!("Storage class {} is deprecated.", class.name))
                .await;
        }
        if class.terminating {
            return self
                .fail_now(format!("Storage class {} is being deleted.", class.name))
                .await;
        }

        let Some(source_name) = self.disk.current_pvc() else {
            return self
                .fail_now("Source volume is not known.".to_string())
                .await;
        };
        let Some(source) = self.ctx.storage.get_volume(self.namespace, source_name).await? else {
            return self
                .fail_now(format!("Source volume {source_name} not found."))
                .await;
        };
        let capacity = source.capacity_bytes.unwrap_or(0);
        if capacity == 0 {
            return self
                .fail_now(format!("Source volume {source_name} reports no capacity."))
                .await;
        }

        let provisioned = self
            .disk
            .status
            .as_ref()
            .and_then(|s| s.provisioned_capacity.as_deref())
            .map(parse_bytes)
            .transpose()?;
        let target_mode = class.volume_mode.unwrap_or(source.volume_mode);
        let spec = TargetVolumeSpec {
            storage_class: class.name.clone(),
            size_bytes: target_size(capacity, provisioned, Some(source.volume_mode), target_mode),
            volume_mode: target_mode,
            access_modes: source.access_modes.clone(),
        };

        let owned = self.ctx.storage.list_owned_volumes(self.disk).await?;
        if owned.len() > 2 {
            return Err(DiskMigrationError::TooManyVolumes {
                disk: name,
                count: owned.len(),
            });
        }
        let target = match owned.iter().find(|v| v.name != source_name) {
            Some(existing) => {
                debug!(disk = %name, volume = %existing.name, "reusing target volume");
                existing.name.clone()
            }
            None => self.ctx.storage.create_target_volume(self.disk, &spec).await?,
        };
        if target == source_name {
            return Err(DiskMigrationError::TargetIsSource {
                disk: name,
                volume: target,
            });
        }

        info!(
            disk = %name,
            source = %source_name,
            target = %target,
            storage_class = %spec.storage_class,
            size_bytes = spec.size_bytes,
            "started disk migration"
        );
        let mut record =
            VirtualDiskMigrationState::started(Some(source_name.to_string()), target.clone(), Utc::now());
        if let Some(vm) = self.vm {
            record = record.for_vm(vm.name_any());
        }
        self.write(DiskStatusPatch {
            migration_state: Some(record),
            conditions: self.migrating(Some(Self::migrating_condition(
                ConditionStatus::False,
                WAIT_FOR_TARGET_READY,
                "Waiting for the target volume.",
            ))),
            ..Default::default()
        })
        .await?;
        self.event(
            EventType::Normal,
            reasons::DISK_MIGRATION_STARTED,
            format!("Migrating from {source_name} to {target} ({}).", spec.storage_class),
        )
        .await;
        Ok(Action::requeue(PROGRESS_REQUEUE))
    }

    async fn sync(&self) -> Result<Action, DiskMigrationError> {
        let Some(target) = self
            .disk
            .migration_state()
            .and_then(|r| r.target_pvc.as_deref())
        else {
            return self.revert().await;
        };

        let status = self.ctx.storage.target_status(self.namespace, target).await?;
        let condition = match status {
            TargetStatus::Bound | TargetStatus::AwaitingConsumer => Self::migrating_condition(
                ConditionStatus::True,
                TARGET_READY,
                "Target volume is ready to receive data.",
            ),
            TargetStatus::Pending => Self::migrating_condition(
                ConditionStatus::False,
                WAIT_FOR_TARGET_READY,
                "Waiting for the target volume.",
            ),
            TargetStatus::Lost | TargetStatus::Missing => {
                warn!(disk = %self.name(), target, ?status, "target volume lost during migration");
                return self.revert().await;
            }
        };
        self.write(DiskStatusPatch {
            conditions: self.migrating(Some(condition)),
            ..Default::default()
        })
        .await?;
        Ok(Action::requeue(PROGRESS_REQUEUE))
    }

    async fn complete(&self) -> Result<Action, DiskMigrationError> {
        let name = self.name();
        let Some(record) = self.disk.migration_state() else {
            return Ok(Action::await_change());
        };
        let Some(target) = record.target_pvc.as_deref() else {
            return self.revert().await;
        };

        // The source is the only complete copy unless the compute migration
        // mirrored into this exact target.
        let mirrored = self
            .vm
            .and_then(|vm| vm.migration_state())
            .is_some_and(|attempt| attempt.mirrors(&name, target));
        let status = self.ctx.storage.target_status(self.namespace, target).await?;
        if !mirrored || status.is_lost() {
            warn!(disk = %name, target, mirrored, ?status, "target not usable at commit; staying on source");
            self.ctx.storage.delete_volume(self.namespace, target).await?;
            let message = if mirrored {
                format!("Target volume {target} was lost before commit.")
            } else {
                format!("Target volume {target} was never mirrored.")
            };
            self.write(DiskStatusPatch {
                migration_state: Some(record.clone().finish(
                    MigrationResult::Failed,
                    Some(message.clone()),
                    Utc::now(),
                )),
                conditions: self.migrating(None),
                ..Default::default()
            })
            .await?;
            record_disk_migration(Outcome::Failed);
            self.event(EventType::Warning, reasons::DISK_MIGRATION_REVERTED, message)
                .await;
            return Ok(Action::requeue(self.ctx.config.requeue_interval));
        }

        if let Some(source) = record.source_pvc.as_deref().filter(|s| *s != target) {
            self.ctx.storage.delete_volume(self.namespace, source).await?;
        }
        self.write(DiskStatusPatch {
            migration_state: Some(record.clone().finish(
                MigrationResult::Succeeded,
                None,
                Utc::now(),
            )),
            conditions: self.migrating(None),
            target: Some(DiskTarget {
                persistent_volume_claim: Some(target.to_string()),
            }),
            storage_class_name: self.disk.desired_storage_class().map(str::to_string),
        })
        .await?;
        info!(disk = %name, target, "promoted target volume");
        record_disk_migration(Outcome::Succeeded);
        self.event(
            EventType::Normal,
            reasons::DISK_MIGRATION_COMPLETED,
            format!("Disk now backed by {target}."),
        )
        .await;
        Ok(Action::requeue(self.ctx.config.requeue_interval))
    }

    async fn revert(&self) -> Result<Action, DiskMigrationError> {
        let Some(record) = self.disk.migration_state() else {
            return Ok(Action::await_change());
        };
        if let Some(target) = record
            .target_pvc
            .as_deref()
            .filter(|t| record.source_pvc.as_deref() != Some(*t))
        {
            self.ctx.storage.delete_volume(self.namespace, target).await?;
        }
        self.write(DiskStatusPatch {
            migration_state: Some(record.clone().finish(
                MigrationResult::Failed,
                Some(REVERTED_MESSAGE.to_string()),
                Utc::now(),
            )),
            conditions: self.migrating(None),
            ..Default::default()
        })
        .await?;
        info!(disk = %self.name(), "reverted disk migration");
        record_disk_migration(Outcome::Failed);
        self.event(
            EventType::Normal,
            reasons::DISK_MIGRATION_REVERTED,
            REVERTED_MESSAGE.to_string(),
        )
        .await;
        Ok(Action::requeue(self.ctx.config.requeue_interval))
    }

    async fn abandon(&self) -> Result<Action, DiskMigrationError> {
        debug!(disk = %self.name(), "declared disk never started; closing record");
        let record = VirtualDiskMigrationState::failed_immediately(
            self.disk.current_pvc().map(str::to_string),
            NOT_STARTED_MESSAGE,
            Utc::now(),
        );
        self.write(DiskStatusPatch {
            migration_state: Some(record),
            conditions: self.migrating(None),
            ..Default::default()
        })
        .await?;
        Ok(Action::requeue(self.ctx.config.requeue_interval))
    }
}
