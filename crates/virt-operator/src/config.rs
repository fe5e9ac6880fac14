//! Command-line and environment configuration

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use virt_volume::VolumeConfig;

/// Virtualization operator - co-migrates virtual machines and their disks
#[derive(Parser, Debug)]
#[command(name = "virt-operator", version, about, long_about = None)]
pub struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Controller settings
    #[command(flatten)]
    pub controller: ControllerArgs,

    /// Mode to run in
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Operator modes
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run as controller (default mode)
    ///
    /// Runs the operation handler, the VM migration orchestrator, the
    /// per-disk migration coordinator and the storage-class trigger.
    Controller,
}

/// Settings shared by the controllers
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Storage classes disks may migrate to (comma separated, empty allows all)
    #[arg(
        long,
        env = "VIRT_ALLOWED_STORAGE_CLASSES",
        value_delimiter = ',',
        global = true
    )]
    pub allowed_storage_classes: Vec<String>,

    /// Only watch this namespace (all namespaces if unset)
    #[arg(long, env = "VIRT_WATCH_NAMESPACE", global = true)]
    pub watch_namespace: Option<String>,

    /// Steady-state requeue interval for disks with nothing to do
    #[arg(long, default_value_t = 300, global = true)]
    pub requeue_seconds: u64,
}

impl ControllerArgs {
    /// Disk coordinator settings
    pub fn volume_config(&self) -> VolumeConfig {
        VolumeConfig {
            allowed_storage_classes: self
                .allowed_storage_classes
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            requeue_interval: Duration::from_secs(self.requeue_seconds.max(1)),
        }
    }
}
