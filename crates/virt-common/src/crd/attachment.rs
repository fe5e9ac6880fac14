//! VirtualMachineBlockDeviceAttachment CRD types
//!
//! Hotplugs a block device into a running VM. Migration only cares which
//! disk is hotplugged; the attachment lifecycle is driven elsewhere.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::virtual_machine::{BlockDeviceKind, BlockDeviceRef};

/// Phase of a hotplug attachment
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AttachmentPhase {
    /// Waiting for the device
    #[default]
    Pending,
    /// Hotplug in flight
    InProgress,
    /// Device is attached to the guest
    Attached,
    /// Hotplug failed
    Failed,
    /// Attachment is being removed
    Terminating,
}

/// Hotplug attachment of a block device to a VM
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.dev",
    version = "v1alpha1",
    kind = "VirtualMachineBlockDeviceAttachment",
    plural = "virtualmachineblockdeviceattachments",
    shortname = "vmbda",
    namespaced,
    status = "VirtualMachineBlockDeviceAttachmentStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"VirtualMachine","type":"string","jsonPath":".spec.virtualMachineName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineBlockDeviceAttachmentSpec {
    /// VM receiving the device
    pub virtual_machine_name: String,

    /// Device to hotplug
    pub block_device_ref: BlockDeviceRef,
}

/// Status of a VirtualMachineBlockDeviceAttachment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineBlockDeviceAttachmentStatus {
    /// Current phase
    #[serde(default)]
    pub phase: AttachmentPhase,
}

impl VirtualMachineBlockDeviceAttachment {
    /// Name of the hotplugged VirtualDisk, None for images
    pub fn disk_name(&self) -> Option<&str> {
        let device = &self.spec.block_device_ref;
        (device.kind == BlockDeviceKind::VirtualDisk).then_some(device.name.as_str())
    }
}
