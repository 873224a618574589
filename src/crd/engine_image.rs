//! EngineImage CRD
//!
//! An engine image is a versioned storage-engine binary distributed to every
//! node through a managed DaemonSet. Its status carries the deployment state,
//! the reported version details and the reference count used for expiry.

use super::condition::{conditions_equivalent, Condition, EngineImageConditionType};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// EngineImage CRD
// =============================================================================

/// EngineImage declares an engine binary image that should be deployed cluster-wide
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "blockstore.io",
    version = "v1",
    kind = "EngineImage",
    plural = "engineimages",
    shortname = "ei",
    namespaced,
    status = "EngineImageStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Image", "type": "string", "jsonPath": ".spec.image"}"#,
    printcolumn = r#"{"name": "RefCount", "type": "integer", "jsonPath": ".status.refCount"}"#,
    printcolumn = r#"{"name": "Owner", "type": "string", "jsonPath": ".status.ownerId"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EngineImageSpec {
    /// Container image reference of the engine binary
    pub image: String,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the EngineImage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EngineImageStatus {
    /// Deployment state
    #[serde(default)]
    pub state: EngineImageState,

    /// Number of distinct volumes using this image
    #[serde(default)]
    pub ref_count: i32,

    /// Set when the reference count dropped to zero
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub no_ref_since: Option<DateTime<Utc>>,

    /// Node currently performing this image's housekeeping
    #[serde(default)]
    pub owner_id: String,

    /// Version details reported by the engine binary
    #[serde(default)]
    pub version_details: EngineVersionDetails,

    /// Conditions
    #[serde(default)]
    pub conditions: BTreeMap<EngineImageConditionType, Condition>,
}

/// Engine image deployment state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EngineImageState {
    #[default]
    Deploying,
    Ready,
    Incompatible,
}

impl std::fmt::Display for EngineImageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineImageState::Deploying => write!(f, "deploying"),
            EngineImageState::Ready => write!(f, "ready"),
            EngineImageState::Incompatible => write!(f, "incompatible"),
        }
    }
}

/// Value of an API version field that has not been reported yet
pub const INVALID_VERSION: i32 = -1;

/// Version information reported by an engine binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EngineVersionDetails {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub git_commit: String,
    #[serde(default)]
    pub build_date: String,

    #[serde(default = "invalid_version")]
    pub cli_api_version: i32,
    #[serde(default = "invalid_version")]
    pub cli_api_min_version: i32,
    #[serde(default = "invalid_version")]
    pub controller_api_version: i32,
    #[serde(default = "invalid_version")]
    pub controller_api_min_version: i32,
    #[serde(default = "invalid_version")]
    pub data_format_version: i32,
    #[serde(default = "invalid_version")]
    pub data_format_min_version: i32,
}

impl Default for EngineVersionDetails {
    fn default() -> Self {
        Self {
            version: String::new(),
            git_commit: String::new(),
            build_date: String::new(),
            cli_api_version: INVALID_VERSION,
            cli_api_min_version: INVALID_VERSION,
            controller_api_version: INVALID_VERSION,
            controller_api_min_version: INVALID_VERSION,
            data_format_version: INVALID_VERSION,
            data_format_min_version: INVALID_VERSION,
        }
    }
}

impl EngineVersionDetails {
    /// Whether the binary has been inspected yet
    pub fn is_reported(&self) -> bool {
        self.cli_api_version != INVALID_VERSION
    }
}

fn invalid_version() -> i32 {
    INVALID_VERSION
}

// =============================================================================
// Implementations
// =============================================================================

impl EngineImageStatus {
    /// Compare ignoring condition probe timestamps
    pub fn equivalent(&self, other: &EngineImageStatus) -> bool {
        self.state == other.state
            && self.ref_count == other.ref_count
            && self.no_ref_since == other.no_ref_since
            && self.owner_id == other.owner_id
            && self.version_details == other.version_details
            && conditions_equivalent(&self.conditions, &other.conditions)
    }
}

impl EngineImage {
    /// Current state, defaulting to Deploying for a fresh object
    pub fn state(&self) -> EngineImageState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn owner_id(&self) -> &str {
        self.status.as_ref().map(|s| s.owner_id.as_str()).unwrap_or("")
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
