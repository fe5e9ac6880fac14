//! Admission checks for migration requests
//!
//! [`validate_preconditions`] runs over state the handler has already
//! fetched and returns the first failing check. Nothing here talks to the
//! API server, so a rejection is always reached before any side effect.

use std::collections::BTreeMap;

use virt_common::crd::{
    AccessMode, CompletedReason, VirtualMachine, VirtualMachineOperation, VirtualMachinePhase,
};

/// Maximum length of a label name or value
const LABEL_MAX: usize = 63;

/// Maximum length of a label key prefix
const PREFIX_MAX: usize = 253;

/// A disk hotplugged into the VM through an attachment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotplugDisk {
    /// Disk name
    pub name: String,
    /// Whether the disk object exists
    pub exists: bool,
    /// Access mode of its backing volume, once known
    pub access_mode: Option<AccessMode>,
}

impl HotplugDisk {
    /// A present disk that is not known to be shared pins the VM to its node
    pub fn blocks_migration(&self) -> bool {
        self.exists && !self.access_mode.is_some_and(|m| m.is_shared())
    }
}

/// Everything admission looks at
#[derive(Clone, Debug)]
pub struct PreconditionView<'a> {
    /// The operation being admitted
    pub operation: &'a VirtualMachineOperation,
    /// The VM it targets, None when missing
    pub vm: Option<&'a VirtualMachine>,
    /// Disks hotplugged into the VM
    pub hotplugged: Vec<HotplugDisk>,
    /// Non-final compute instances for the VM created by someone else
    pub foreign_instances: Vec<String>,
}

/// Why an operation was refused
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    /// Reason on the `Completed` condition
    pub reason: CompletedReason,
    /// Human-readable explanation
    pub message: String,
}

impl Rejection {
    fn new(reason: CompletedReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// Check a migration request against the current state of its VM
///
/// Checks run in order and the first failure wins:
/// 1. the VM exists
/// 2. the VM is Running
/// 3. its run policy allows migration
/// 4. every hotplugged disk is absent or shared
/// 5. the target constraint is well-formed
/// 6. no other attempt owns the VM
pub fn validate_preconditions(view: &PreconditionView<'_>) -> Result<(), Rejection> {
    let op_name = view.operation.metadata.name.as_deref().unwrap_or_default();

    let Some(vm) = view.vm else {
        return Err(Rejection::new(
            CompletedReason::VirtualMachineNotFound,
            format!(
                "Virtual machine {} not found.",
                view.operation.spec.virtual_machine
            ),
        ));
    };

    if vm.phase() != VirtualMachinePhase::Running {
        return Err(Rejection::new(
            CompletedReason::NotApplicableForVmPhase,
            format!(
                "Virtual machine is not running (phase {}).",
                vm.phase()
            ),
        ));
    }

    if !vm.spec.run_policy.allows_migration() {
        return Err(Rejection::new(
            CompletedReason::NotApplicableForRunPolicy,
            format!(
                "Migration is not applicable for run policy {}.",
                vm.spec.run_policy
            ),
        ));
    }

    let pinned: Vec<&str> = view
        .hotplugged
        .iter()
        .filter(|d| d.blocks_migration())
        .map(|d| d.name.as_str())
        .collect();
    if !pinned.is_empty() {
        return Err(Rejection::new(
            CompletedReason::HotplugDisksNotShared,
            format!(
                "Hotplugged disks {} are not shared and cannot follow the guest.",
                pinned.join(", ")
            ),
        ));
    }

    validate_node_selector(&view.operation.spec.target_selector())
        .map_err(|e| Rejection::new(CompletedReason::InvalidTargetConstraint, e))?;

    if let Some(active) = vm.active_migration().filter(|a| !a.is_for(op_name)) {
        return Err(Rejection::new(
            CompletedReason::OtherMigrationInProgress,
            format!(
                "Migration {} is already in progress for this virtual machine.",
                active.operation
            ),
        ));
    }
    if let Some(instance) = view.foreign_instances.first() {
        return Err(Rejection::new(
            CompletedReason::OtherMigrationInProgress,
            format!("Compute migration {instance} is already in progress."),
        ));
    }

    Ok(())
}

/// Structural check of a node selector: label-syntax keys and values
pub fn validate_node_selector(selector: &BTreeMap<String, String>) -> Result<(), String> {
    for (key, value) in selector {
        validate_label_key(key)?;
        validate_label_value(value).map_err(|e| format!("node selector {key}: {e}"))?;
    }
    Ok(())
}

/// Validate a label key: optional DNS subdomain prefix, then a name
pub fn validate_label_key(key: &str) -> Result<(), String> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > PREFIX_MAX {
            return Err(format!("label key prefix must be 1-{PREFIX_MAX} characters: {key}"));
        }
        for segment in prefix.split('.') {
            validate_dns_label(segment)
                .map_err(|e| format!("label key prefix {prefix}: {e}"))?;
        }
    }

    if name.is_empty() {
        return Err(format!("label key name cannot be empty: {key}"));
    }
    validate_label_value(name).map_err(|e| format!("label key {key}: {e}"))
}

/// Validate a label value: empty, or at most 63 alphanumerics with `-_.` inside
pub fn validate_label_value(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > LABEL_MAX {
        return Err(format!("must be at most {LABEL_MAX} characters"));
    }

    let bytes = value.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return Err(format!("must start and end with an alphanumeric character: {value}"));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
    {
        return Err(format!("invalid character '{c}' in {value}"));
    }
    Ok(())
}

/// One segment of a DNS subdomain (RFC 1123 label)
fn validate_dns_label(segment: &str) -> Result<(), String> {
    if segment.is_empty() || segment.len() > LABEL_MAX {
        return Err(format!("segment must be 1-{LABEL_MAX} characters"));
    }
    if segment.starts_with('-') || segment.ends_with('-') {
        return Err(format!("segment cannot start or end with hyphen: {segment}"));
    }
    if segment
        .chars()
        .any(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-')
    {
        return Err(format!(
            "segment must be lowercase alphanumeric with hyphens: {segment}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use virt_common::crd::{
        MigrateSpec, OperationType, RunPolicy, VirtualMachineMigrationState,
        VirtualMachineOperationSpec, VirtualMachineSpec, VirtualMachineStatus,
    };

    fn op(selector: &[(&str, &str)]) -> VirtualMachineOperation {
        VirtualMachineOperation::new(
            "move",
            VirtualMachineOperationSpec {
                type_: OperationType::Migrate,
                virtual_machine: "vm-a".into(),
                force: false,
                migrate: Some(MigrateSpec {
                    node_selector: selector
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                }),
            },
        )
    }

    fn vm(phase: VirtualMachinePhase, policy: RunPolicy) -> VirtualMachine {
        let mut vm = VirtualMachine::new(
            "vm-a",
            VirtualMachineSpec {
                run_policy: policy,
                ..Default::default()
            },
        );
        vm.status = Some(VirtualMachineStatus {
            phase,
            ..Default::default()
        });
        vm
    }

    fn view<'a>(operation: &'a VirtualMachineOperation, vm: Option<&'a VirtualMachine>) -> PreconditionView<'a> {
        PreconditionView {
            operation,
            vm,
            hotplugged: vec![],
            foreign_instances: vec![],
        }
    }

    fn reason(result: Result<(), Rejection>) -> CompletedReason {
        result.expect_err("expected rejection").reason
    }

    #[test]
    fn running_vm_is_admitted() {
        let op = op(&[("topology.kubernetes.io/zone", "zone-b")]);
        let vm = vm(VirtualMachinePhase::Running, RunPolicy::AlwaysOn);
        assert_eq!(validate_preconditions(&view(&op, Some(&vm))), Ok(()));
    }

    #[test]
    fn missing_vm_is_first() {
        let op = op(&[("bad key!", "x")]);
        assert_eq!(
            reason(validate_preconditions(&view(&op, None))),
            CompletedReason::VirtualMachineNotFound
        );
    }

    #[test]
    fn stopped_vm_is_not_applicable() {
        let op = op(&[]);
        let vm = vm(VirtualMachinePhase::Stopped, RunPolicy::Manual);
        let rejection = validate_preconditions(&view(&op, Some(&vm))).unwrap_err();
        assert_eq!(rejection.reason, CompletedReason::NotApplicableForVmPhase);
        assert!(rejection.message.contains("not running"));
    }

    #[test]
    fn always_off_policy_is_not_applicable() {
        let op = op(&[]);
        let vm = vm(VirtualMachinePhase::Running, RunPolicy::AlwaysOff);
        assert_eq!(
            reason(validate_preconditions(&view(&op, Some(&vm)))),
            CompletedReason::NotApplicableForRunPolicy
        );
    }

    /// Precondition short-circuit: a read-write-once hotplug disk rejects the
    /// request before the target constraint or any active attempt is looked at
    #[test]
    fn unshared_hotplug_disk_blocks() {
        let op = op(&[("bad key!", "x")]);
        let vm = vm(VirtualMachinePhase::Running, RunPolicy::AlwaysOn);
        let mut v = view(&op, Some(&vm));
        v.hotplugged = vec![
            HotplugDisk {
                name: "gone".into(),
                exists: false,
                access_mode: None,
            },
            HotplugDisk {
                name: "shared".into(),
                exists: true,
                access_mode: Some(AccessMode::ReadWriteMany),
            },
            HotplugDisk {
                name: "scratch".into(),
                exists: true,
                access_mode: Some(AccessMode::ReadWriteOnce),
            },
        ];
        let rejection = validate_preconditions(&v).unwrap_err();
        assert_eq!(rejection.reason, CompletedReason::HotplugDisksNotShared);
        assert!(rejection.message.contains("scratch"));
        assert!(!rejection.message.contains("shared,"));
    }

    #[test]
    fn malformed_selector_is_invalid_constraint() {
        let vm = vm(VirtualMachinePhase::Running, RunPolicy::AlwaysOn);
        for selector in [
            vec![("", "x")],
            vec![("Bad_Prefix/zone", "a")],
            vec![("zone", "-leading")],
            vec![("example.com/", "a")],
            vec![("zone", "has space")],
        ] {
            let op = op(&selector);
            assert_eq!(
                reason(validate_preconditions(&view(&op, Some(&vm)))),
                CompletedReason::InvalidTargetConstraint,
                "selector {selector:?}"
            );
        }
    }

    #[test]
    fn label_rules() {
        assert!(validate_label_key("kubernetes.io/hostname").is_ok());
        assert!(validate_label_key("node-role.kubernetes.io/worker").is_ok());
        assert!(validate_label_key("zone").is_ok());
        assert!(validate_label_key(&"a".repeat(64)).is_err());
        assert!(validate_label_value("").is_ok());
        assert!(validate_label_value("v1.2_b-c").is_ok());
        assert!(validate_label_value("trailing-").is_err());
    }

    #[test]
    fn other_active_attempt_is_rejected() {
        let op = op(&[]);
        let mut vm = vm(VirtualMachinePhase::Running, RunPolicy::AlwaysOn);
        if let Some(s) = vm.status.as_mut() {
            s.migration_state = Some(VirtualMachineMigrationState::begin(
                "earlier",
                "uid-1",
                None,
                vec![],
                Utc::now(),
            ));
        }
        let rejection = validate_preconditions(&view(&op, Some(&vm))).unwrap_err();
        assert_eq!(rejection.reason, CompletedReason::OtherMigrationInProgress);
        assert!(rejection.message.contains("earlier"));
    }

    #[test]
    fn own_attempt_and_finished_attempts_do_not_block() {
        let op = op(&[]);
        let mut vm = vm(VirtualMachinePhase::Running, RunPolicy::AlwaysOn);
        if let Some(s) = vm.status.as_mut() {
            s.migration_state = Some(VirtualMachineMigrationState::begin(
                "move",
                "uid-1",
                None,
                vec![],
                Utc::now(),
            ));
        }
        assert_eq!(validate_preconditions(&view(&op, Some(&vm))), Ok(()));

        if let Some(s) = vm.status.as_mut() {
            s.migration_state = Some(
                VirtualMachineMigrationState::begin("earlier", "uid-0", None, vec![], Utc::now())
                    .finish(virt_common::crd::MigrationResult::Failed, Utc::now()),
            );
        }
        assert_eq!(validate_preconditions(&view(&op, Some(&vm))), Ok(()));
    }

    #[test]
    fn foreign_compute_instance_is_rejected() {
        let op = op(&[]);
        let vm = vm(VirtualMachinePhase::Running, RunPolicy::AlwaysOn);
        let mut v = view(&op, Some(&vm));
        v.foreign_instances = vec!["kubevirt-evacuation-x".into()];
        assert_eq!(
            reason(validate_preconditions(&v)),
            CompletedReason::OtherMigrationInProgress
        );
    }
}
