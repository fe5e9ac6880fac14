//! Shared status types: conditions and condition kinds

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Every condition type the controllers read or write.
///
/// Conditions are stored with a string `type` on the wire; inside the
/// controllers they are always addressed through this enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    /// Disk: backing volume is usable
    Ready,
    /// Disk: attached to a virtual machine
    InUse,
    /// Disk: backing volume is being expanded
    Resizing,
    /// Disk or VM: a snapshot is being taken
    Snapshotting,
    /// VM or disk: a migration attempt is running
    Migrating,
    /// VM: whether the guest can be live-migrated
    Migratable,
    /// VM: the guest is running
    Running,
    /// VM: guest filesystems are frozen
    FilesystemFrozen,
    /// Operation: terminal outcome and progress reason
    Completed,
    /// Operation: the request reached the orchestrator
    SignalSent,
}

impl ConditionKind {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::InUse => "InUse",
            Self::Resizing => "Resizing",
            Self::Snapshotting => "Snapshotting",
            Self::Migrating => "Migrating",
            Self::Migratable => "Migratable",
            Self::Running => "Running",
            Self::FilesystemFrozen => "FilesystemFrozen",
            Self::Completed => "Completed",
            Self::SignalSent => "SignalSent",
        }
    }
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConditionKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Ready" => Self::Ready,
            "InUse" => Self::InUse,
            "Resizing" => Self::Resizing,
            "Snapshotting" => Self::Snapshotting,
            "Migrating" => Self::Migrating,
            "Migratable" => Self::Migratable,
            "Running" => Self::Running,
            "FilesystemFrozen" => Self::FilesystemFrozen,
            "Completed" => Self::Completed,
            "SignalSent" => Self::SignalSent,
            other => {
                return Err(crate::Error::serialization_for_kind(
                    "Condition",
                    format!("unknown condition type: {other}"),
                ))
            }
        })
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Migrating, Completed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the object this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        kind: ConditionKind,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: kind.as_str().to_string(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: Utc::now(),
        }
    }

    /// Attach the generation the condition was computed from
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Typed kind; None for condition types written by other controllers
    pub fn kind(&self) -> Option<ConditionKind> {
        self.type_.parse().ok()
    }

    /// Same status, reason and message, ignoring timestamps
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Find a condition by kind
pub fn find_condition(conditions: &[Condition], kind: ConditionKind) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == kind.as_str())
}

/// Returns true if the condition exists with status True
pub fn is_condition_true(conditions: &[Condition], kind: ConditionKind) -> bool {
    find_condition(conditions, kind).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Insert or replace a condition.
///
/// The previous transition time is kept while the status is unchanged so
/// that re-applying an identical condition is a no-op on the wire.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Remove a condition by kind
pub fn remove_condition(conditions: &mut Vec<Condition>, kind: ConditionKind) {
    conditions.retain(|c| c.type_ != kind.as_str());
}
