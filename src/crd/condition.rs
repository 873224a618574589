//! Status conditions shared by the storage resources
//!
//! Conditions are stored as maps keyed by a closed enumeration per resource
//! kind, so a misspelled condition type is a compile error rather than a
//! silently missing entry.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Condition Status
// =============================================================================

/// Tri-state status of a condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

// =============================================================================
// Condition Types
// =============================================================================

/// Conditions reported on a StorageNode
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum NodeConditionType {
    Ready,
    MountPropagation,
}

/// Conditions reported on each disk of a StorageNode
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum DiskConditionType {
    Ready,
    Schedulable,
}

/// Conditions reported on an EngineImage
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum EngineImageConditionType {
    Ready,
}

/// Condition reasons written by the controllers
pub mod reason {
    pub const MANAGER_POD_DOWN: &str = "ManagerPodDown";
    pub const KUBERNETES_NODE_DOWN: &str = "KubernetesNodeDown";
    pub const KUBERNETES_NODE_NOT_READY: &str = "KubernetesNodeNotReady";
    pub const KUBERNETES_NODE_PRESSURE: &str = "KubernetesNodePressure";
    pub const NO_MOUNT_PROPAGATION_SUPPORT: &str = "NoMountPropagationSupport";

    pub const DISK_PRESSURE: &str = "DiskPressure";
    pub const DISK_FILESYSTEM_CHANGED: &str = "DiskFilesystemChanged";
    pub const DISK_PROBE_FAILED: &str = "DiskProbeFailed";

    pub const INVALID_IMAGE: &str = "InvalidImage";
    pub const DAEMON_SET_NOT_AVAILABLE: &str = "DaemonSetNotAvailable";
    pub const INCOMPATIBLE_VERSION: &str = "IncompatibleVersion";
    pub const INSTANCE_MANAGERS_NOT_RUNNING: &str = "InstanceManagersNotRunning";
}

// =============================================================================
// Condition
// =============================================================================

/// A single status condition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Machine-readable reason for the current status
    #[serde(default)]
    pub reason: String,
    /// Human-readable detail
    #[serde(default)]
    pub message: String,
    /// Last time the condition was evaluated and written. Status writes are
    /// skipped while nothing changes, so this can lag the latest evaluation
    /// by up to the controller's refresh interval.
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_probe_time: Option<DateTime<Utc>>,
    /// Last time the status value changed
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// Compare everything except the probe timestamp
    pub fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.last_transition_time == other.last_transition_time
    }
}

/// Set a condition in a keyed condition map.
///
/// `last_transition_time` only moves when the status value changes;
/// `last_probe_time` moves on every call.
pub fn set_condition<T: Ord>(
    conditions: &mut BTreeMap<T, Condition>,
    condition_type: T,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let entry = conditions.entry(condition_type).or_insert_with(|| Condition {
        status: ConditionStatus::Unknown,
        ..Default::default()
    });

    if entry.status != status || entry.last_transition_time.is_none() {
        entry.last_transition_time = Some(now);
    }
    entry.status = status;
    entry.reason = reason.to_string();
    entry.message = message.to_string();
    entry.last_probe_time = Some(now);
}

/// Look up a condition, returning an Unknown placeholder when absent
pub fn get_condition<T: Ord>(conditions: &BTreeMap<T, Condition>, condition_type: T) -> Condition {
    conditions.get(&condition_type).cloned().unwrap_or_default()
}

/// Compare two condition maps ignoring probe timestamps
pub fn conditions_equivalent<T: Ord>(
    a: &BTreeMap<T, Condition>,
    b: &BTreeMap<T, Condition>,
) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|((ka, ca), (kb, cb))| ka == kb && ca.same_state(cb))
}
