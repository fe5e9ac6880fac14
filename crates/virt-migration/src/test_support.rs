//! Shared fixtures for the orchestrator tests

use std::collections::BTreeMap;

use async_trait::async_trait;
use virt_common::crd::{
    MigratedVolume, VirtualMachine, VirtualMachineInstanceMigration,
    VirtualMachineInstanceMigrationSpec, VirtualMachineOperation,
};
use virt_common::Error;
use virt_compute::{AbortState, ComputeMigrationDriver, ComputeObservation, ComputePhase};

mockall::mock! {
    pub Compute {}

    #[async_trait]
    impl ComputeMigrationDriver for Compute {
        async fn start_migration(
            &self,
            vm: &VirtualMachine,
            operation: &VirtualMachineOperation,
            target: &BTreeMap<String, String>,
            volumes: &[MigratedVolume],
        ) -> Result<VirtualMachineInstanceMigration, Error>;
        async fn get(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<VirtualMachineInstanceMigration>, Error>;
        async fn list_for_vm(
            &self,
            namespace: &str,
            vm: &str,
        ) -> Result<Vec<VirtualMachineInstanceMigration>, Error>;
        async fn observe(
            &self,
            instance: &VirtualMachineInstanceMigration,
        ) -> Result<ComputeObservation, Error>;
        async fn request_abort(&self, namespace: &str, name: &str) -> Result<(), Error>;
        async fn target_unschedulable(
            &self,
            instance: &VirtualMachineInstanceMigration,
        ) -> Result<Option<String>, Error>;
    }
}

pub fn instance() -> VirtualMachineInstanceMigration {
    VirtualMachineInstanceMigration::new(
        "vmop-move",
        VirtualMachineInstanceMigrationSpec {
            vmi_name: "vm-a".into(),
            added_node_selector: None,
            abort_requested: false,
            volumes: vec![],
        },
    )
}

/// Instance mirroring `volumes`, as the driver would have created it
pub fn instance_with(volumes: &[MigratedVolume]) -> VirtualMachineInstanceMigration {
    let mut i = instance();
    i.spec.volumes = volumes.to_vec();
    i
}

pub fn mirrored(disk: &str, source: &str, target: &str) -> MigratedVolume {
    MigratedVolume {
        name: disk.into(),
        source_claim: source.into(),
        target_claim: target.into(),
    }
}

/// A 409 from the API server
pub fn conflict() -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

pub fn observation(phase: ComputePhase, abort: AbortState) -> ComputeObservation {
    ComputeObservation {
        instance: "vmop-move".into(),
        phase,
        detail_phase: None,
        abort,
        target_node: Some("node-b".into()),
        failure_reason: None,
        quota_rejected: None,
        unschedulable: None,
    }
}
