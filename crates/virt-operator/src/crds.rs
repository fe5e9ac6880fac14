//! CRDs owned by the operator
//!
//! The operator installs its own CRDs on startup using server-side apply,
//! so the served schema always matches the running version. The compute
//! migration type belongs to the hypervisor layer and is never installed.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use virt_common::crd::{
    VirtualDisk, VirtualMachine, VirtualMachineBlockDeviceAttachment, VirtualMachineOperation,
};
use virt_common::retry::{retry_with_backoff, RetryConfig};
use virt_common::FIELD_MANAGER;

/// Every CRD the operator serves
pub fn all() -> Vec<CustomResourceDefinition> {
    vec![
        VirtualMachine::crd(),
        VirtualDisk::crd(),
        VirtualMachineOperation::crd(),
        VirtualMachineBlockDeviceAttachment::crd(),
    ]
}

/// CRDs as a multi-document YAML stream, for `--crd`
pub fn to_yaml() -> anyhow::Result<String> {
    let docs = all()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
    Ok(docs.join("---\n"))
}

/// Ensure all CRDs are installed
pub async fn ensure_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let retry = RetryConfig::with_max_attempts(5);

    for crd in all() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        retry_with_backoff(
            &retry,
            "install_crd",
            || {
                let crds = crds.clone();
                let params = params.clone();
                let name = name.clone();
                let crd = crd.clone();
                async move { crds.patch(&name, &params, &Patch::Apply(&crd)).await }
            },
            |e: &kube::Error| !matches!(e, kube::Error::Api(ae) if ae.code < 500 && ae.code != 429),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All virtualization CRDs installed/updated");
    Ok(())
}
