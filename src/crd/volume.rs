//! Volume, Engine and Replica CRDs
//!
//! These are owned by the data-path components. The controllers in this crate
//! only read them, except for `Volume.status.kubernetesStatus` which the
//! workload-status synchronizer maintains.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Volume
// =============================================================================

/// A replicated block volume
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "blockstore.io",
    version = "v1",
    kind = "Volume",
    plural = "volumes",
    shortname = "bv",
    namespaced,
    status = "VolumeStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".spec.size"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".status.currentNodeId"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Size in bytes
    #[serde(default)]
    pub size: i64,

    /// Requested engine image reference
    #[serde(default)]
    pub engine_image: String,

    /// Desired replica count
    #[serde(default = "default_replicas")]
    pub number_of_replicas: i32,
}

fn default_replicas() -> i32 {
    3
}

/// Status of the Volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    #[serde(default)]
    pub state: VolumeState,

    /// Engine image currently running the volume
    #[serde(default)]
    pub current_image: String,

    /// Node the volume is attached to
    #[serde(default)]
    pub current_node_id: String,

    /// Manager instance responsible for this volume
    #[serde(default)]
    pub owner_id: String,

    /// Attachment linkage observed on the cluster
    #[serde(default)]
    pub kubernetes_status: KubernetesStatus,
}

/// Attachment state of a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Creating,
    Attached,
    #[default]
    Detached,
    Attaching,
    Detaching,
    Deleting,
}

/// Persistent-volume, claim and pod linkage of a volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesStatus {
    #[serde(default)]
    pub pv_name: String,

    #[serde(default)]
    pub pv_status: String,

    /// Namespace of the bound claim
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub pvc_name: String,

    /// Set when the recorded claim was first observed missing
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_pvc_ref_at: Option<DateTime<Utc>>,

    /// Set when the recorded pods were first observed missing
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_pod_ref_at: Option<DateTime<Utc>>,

    /// Pods using the volume, sorted by pod name
    #[serde(default)]
    pub workloads_status: Vec<WorkloadStatus>,
}

/// One pod using a volume and the workload that owns it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    pub pod_name: String,
    #[serde(default)]
    pub pod_status: String,
    #[serde(default)]
    pub workload_name: String,
    #[serde(default)]
    pub workload_type: String,
}

// =============================================================================
// Engine
// =============================================================================

/// The controller process of a volume
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "blockstore.io",
    version = "v1",
    kind = "Engine",
    plural = "engines",
    shortname = "be",
    namespaced,
    status = "EngineStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeId"}"#,
    printcolumn = r#"{"name": "Image", "type": "string", "jsonPath": ".status.currentImage"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EngineSpec {
    pub volume_name: String,

    /// Requested engine image reference
    #[serde(default)]
    pub engine_image: String,

    #[serde(default)]
    pub node_id: String,
}

/// Status of the Engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    /// Image the running process was started from
    #[serde(default)]
    pub current_image: String,

    /// Instance manager hosting the running process
    #[serde(default)]
    pub instance_manager_name: String,
}

// =============================================================================
// Replica
// =============================================================================

/// One data replica of a volume placed on a node disk
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "blockstore.io",
    version = "v1",
    kind = "Replica",
    plural = "replicas",
    shortname = "br",
    namespaced,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeId"}"#,
    printcolumn = r#"{"name": "Disk", "type": "string", "jsonPath": ".spec.diskId"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    pub volume_name: String,

    #[serde(default)]
    pub node_id: String,

    #[serde(default)]
    pub disk_id: String,

    /// Bytes reserved for the replica on its disk
    #[serde(default)]
    pub volume_size: i64,

    /// Set when the replica was marked failed
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub failed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Implementations
// =============================================================================

impl Volume {
    pub fn owner_id(&self) -> &str {
        self.status.as_ref().map(|s| s.owner_id.as_str()).unwrap_or("")
    }

    pub fn current_image(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.current_image.as_str())
            .unwrap_or("")
    }

    pub fn kubernetes_status(&self) -> KubernetesStatus {
        self.status
            .as_ref()
            .map(|s| s.kubernetes_status.clone())
            .unwrap_or_default()
    }
}

impl Engine {
    pub fn current_image(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.current_image.as_str())
            .unwrap_or("")
    }

    pub fn instance_manager_name(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.instance_manager_name.as_str())
            .unwrap_or("")
    }
}

impl Replica {
    /// Occupies disk space: not being deleted and not failed
    pub fn is_active(&self) -> bool {
        self.metadata.deletion_timestamp.is_none() && self.spec.failed_at.is_none()
    }

    /// Whether the replica is placed on the given node disk
    pub fn is_placed_on(&self, node: &str, disk: &str) -> bool {
        self.spec.node_id == node && self.spec.disk_id == disk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn replica(node: &str, disk: &str) -> Replica {
        Replica::new(
            "vol-r-1",
            ReplicaSpec {
                volume_name: "vol".into(),
                node_id: node.into(),
                disk_id: disk.into(),
                volume_size: 1024,
                failed_at: None,
            },
        )
    }

    #[test]
    fn test_replica_activity() {
        let mut r = replica("node-1", "disk-1");
        assert!(r.is_active());
        assert!(r.is_placed_on("node-1", "disk-1"));
        assert!(!r.is_placed_on("node-1", "disk-2"));

        r.spec.failed_at = Some(Utc::now());
        assert!(!r.is_active());

        let mut r = replica("node-1", "disk-1");
        r.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert!(!r.is_active());
    }

    #[test]
    fn test_kubernetes_status_uses_camel_case() {
        let status = KubernetesStatus {
            pv_name: "pv-1".into(),
            pvc_name: "claim".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["pvName"], "pv-1");
        assert_eq!(json["pvcName"], "claim");
    }
}
