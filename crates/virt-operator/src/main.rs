//! Virtualization operator - co-migrates virtual machines and their disks

use clap::Parser;
use futures::future::join_all;
use kube::Client;

use virt_common::telemetry::{init_telemetry, TelemetryConfig};
use virt_operator::config::{Cli, Commands, ControllerArgs};
use virt_operator::{controller_runner, crds};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crds::to_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!(
        namespace = ?args.watch_namespace,
        allowed_storage_classes = ?args.allowed_storage_classes,
        "Virtualization controller starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    crds::ensure_installed(&client).await?;

    tracing::info!("Starting controllers:");
    let controllers = controller_runner::build_controllers(client, &args);

    // Each controller stops on SIGTERM via shutdown_on_signal.
    join_all(controllers).await;

    tracing::info!("Virtualization controller shut down");
    Ok(())
}
