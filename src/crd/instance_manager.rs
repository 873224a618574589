//! InstanceManager CRD
//!
//! Describes a supervised engine-role or replica-role process running a
//! specific engine image on one node.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// InstanceManager binds an engine image to a node in a given role
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "blockstore.io",
    version = "v1",
    kind = "InstanceManager",
    plural = "instancemanagers",
    shortname = "im",
    namespaced,
    status = "InstanceManagerStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.currentState"}"#,
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.type"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeId"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceManagerSpec {
    /// Node the process runs on
    pub node_id: String,

    /// Engine image reference the process runs
    pub image: String,

    /// Role of the process
    #[serde(rename = "type")]
    pub manager_type: InstanceManagerType,
}

/// Role of an instance manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum InstanceManagerType {
    Engine,
    Replica,
}

impl std::fmt::Display for InstanceManagerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceManagerType::Engine => write!(f, "engine"),
            InstanceManagerType::Replica => write!(f, "replica"),
        }
    }
}

/// Status of the InstanceManager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceManagerStatus {
    #[serde(default)]
    pub current_state: InstanceManagerState,
}

/// Lifecycle state of the supervised process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum InstanceManagerState {
    #[default]
    Starting,
    Running,
    Stopped,
    Error,
}

impl InstanceManager {
    pub fn is_running(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.current_state == InstanceManagerState::Running)
            .unwrap_or(false)
    }
}
