//! StorageNode CRD
//!
//! Represents a cluster node's participation in the block store: the disks an
//! operator declared on it, and the health and scheduling capacity the node
//! controller computed for each of them.

use super::condition::{
    conditions_equivalent, Condition, DiskConditionType, NodeConditionType,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// StorageNode CRD
// =============================================================================

/// StorageNode tracks the declared disks and computed conditions of a cluster node.
/// The object name is the cluster node name.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "blockstore.io",
    version = "v1",
    kind = "StorageNode",
    plural = "storagenodes",
    shortname = "sn",
    namespaced,
    status = "StorageNodeStatus",
    printcolumn = r#"{"name": "Ready", "type": "string", "jsonPath": ".status.conditions.Ready.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeSpec {
    /// Disks declared on this node, keyed by disk ID
    #[serde(default)]
    pub disks: BTreeMap<String, DiskSpec>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Operator-declared disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    /// Mount path of the disk's filesystem on the node
    pub path: String,

    /// Whether new replicas may be scheduled here
    #[serde(default = "default_true")]
    pub allow_scheduling: bool,

    /// Bytes held back from scheduling
    #[serde(default)]
    pub storage_reserved: i64,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the StorageNode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeStatus {
    /// Node conditions
    #[serde(default)]
    pub conditions: BTreeMap<NodeConditionType, Condition>,

    /// Computed state per declared disk
    #[serde(default)]
    pub disk_status: BTreeMap<String, DiskStatus>,
}

/// Computed state of one disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskStatus {
    /// Total capacity in bytes
    #[serde(default)]
    pub storage_maximum: i64,

    /// Free capacity in bytes
    #[serde(default)]
    pub storage_available: i64,

    /// Sum of the sizes of replicas scheduled to this disk
    #[serde(default)]
    pub storage_scheduled: i64,

    /// Filesystem identity recorded on first successful probe
    #[serde(default)]
    pub filesystem_id: Option<String>,

    /// Disk conditions
    #[serde(default)]
    pub conditions: BTreeMap<DiskConditionType, Condition>,

    /// Replica name to size for replicas placed on this disk
    #[serde(default)]
    pub scheduled_replica: BTreeMap<String, i64>,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_true() -> bool {
    true
}

// =============================================================================
// Implementations
// =============================================================================

impl StorageNode {
    /// Name of the cluster node this object describes
    pub fn node_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    /// Whether any disks are declared
    pub fn has_disks(&self) -> bool {
        !self.spec.disks.is_empty()
    }

    /// Ready condition, Unknown when never computed
    pub fn ready_condition(&self) -> Condition {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.get(&NodeConditionType::Ready).cloned())
            .unwrap_or_default()
    }
}

impl DiskStatus {
    /// Compare ignoring condition probe timestamps
    pub fn equivalent(&self, other: &DiskStatus) -> bool {
        self.storage_maximum == other.storage_maximum
            && self.storage_available == other.storage_available
            && self.storage_scheduled == other.storage_scheduled
            && self.filesystem_id == other.filesystem_id
            && self.scheduled_replica == other.scheduled_replica
            && conditions_equivalent(&self.conditions, &other.conditions)
    }
}

impl StorageNodeStatus {
    /// Compare ignoring condition probe timestamps
    pub fn equivalent(&self, other: &StorageNodeStatus) -> bool {
        conditions_equivalent(&self.conditions, &other.conditions)
            && self.disk_status.len() == other.disk_status.len()
            && self
                .disk_status
                .iter()
                .zip(other.disk_status.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a.equivalent(b))
    }
}
