//! Storage side of VM migrations
//!
//! - [`controller`]: per-disk coordinator that creates, promotes or discards
//!   a disk's target volume as the VM's migration attempt progresses
//! - [`trigger`]: files an Evict operation when a disk's StorageClass changes
//! - [`storage`]: the target volume primitive and its PersistentVolumeClaim backend
//!
//! The coordinator and the VM orchestrator never call each other. The VM's
//! `migrationState` and each disk's `migrationState` are the only channel
//! between them.

#![deny(missing_docs)]

pub mod action;
pub mod client;
pub mod controller;
pub mod error;
pub mod storage;
pub mod trigger;

pub use action::{determine_disk_action, DiskAction};
pub use client::{DiskStatusPatch, KubeClient, KubeClientImpl};
pub use controller::{error_policy, reconcile, Context, ContextBuilder, VolumeConfig};
pub use error::DiskMigrationError;
pub use storage::{
    PvcStorageBackend, StorageBackend, StorageClassInfo, TargetStatus, TargetVolumeSpec, VolumeInfo,
};
