//! Manager configuration
//!
//! Everything the controllers treat as cluster-configurable input. The binary
//! fills this from command-line flags and environment; tests start from
//! [`ManagerConfig::default`] and override what they need.

use crate::domain::ports::ApiVersionRange;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by all controllers
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Namespace holding the manager's own objects
    pub namespace: String,
    /// Name of the node this instance runs on
    pub controller_id: String,

    /// Engine image exempt from expiry
    pub default_engine_image: String,
    /// How long an unreferenced engine image survives before deletion
    pub engine_image_grace: Duration,
    /// Host directory the engine-image DaemonSet copies binaries into
    pub engine_binaries_dir: PathBuf,
    /// Engine CLI API range this manager speaks
    pub api_range: ApiVersionRange,

    /// Percentage of a disk's maximum that must stay free for scheduling
    pub storage_minimal_available_percentage: i64,
    /// Scheduled bytes may reach this percentage of usable capacity
    pub storage_over_provisioning_percentage: i64,

    /// Labels selecting the per-node manager daemon pods
    pub manager_pod_labels: BTreeMap<String, String>,
    /// CSI driver name that marks persistent volumes as ours
    pub csi_driver_name: String,

    /// Worker tasks per controller
    pub workers: usize,
    /// Failed reconciles of one key before it is dropped
    pub max_retries: u32,
    /// First requeue delay after a failure
    pub backoff_initial: Duration,
    /// Cap on the requeue delay
    pub backoff_max: Duration,
    /// Time allowed for one disk probe or engine binary run
    pub probe_timeout: Duration,
    /// Period at which every node and image is re-enqueued
    pub resync_period: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            namespace: "blockstore-system".into(),
            controller_id: String::new(),
            default_engine_image: String::new(),
            engine_image_grace: Duration::from_secs(60 * 60),
            engine_binaries_dir: PathBuf::from("/var/lib/blockstore/engine-binaries"),
            api_range: ApiVersionRange {
                min_version: 3,
                current_version: 4,
            },
            storage_minimal_available_percentage: 25,
            storage_over_provisioning_percentage: 200,
            manager_pod_labels: BTreeMap::from([(
                "app".to_string(),
                "blockstore-manager".to_string(),
            )]),
            csi_driver_name: "driver.blockstore.io".into(),
            workers: 2,
            max_retries: 15,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            resync_period: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    /// Check invariants between fields
    pub fn validate(&self) -> Result<()> {
        if self.controller_id.is_empty() {
            return Err(Error::Configuration(
                "controller id (this node's name) is required".into(),
            ));
        }
        if self.namespace.is_empty() {
            return Err(Error::Configuration("namespace is required".into()));
        }
        if !(0..=100).contains(&self.storage_minimal_available_percentage) {
            return Err(Error::Configuration(format!(
                "minimal available percentage must be within 0..=100, got {}",
                self.storage_minimal_available_percentage
            )));
        }
        if self.storage_over_provisioning_percentage < 0 {
            return Err(Error::Configuration(format!(
                "over-provisioning percentage must not be negative, got {}",
                self.storage_over_provisioning_percentage
            )));
        }
        if self.api_range.min_version > self.api_range.current_version {
            return Err(Error::Configuration(format!(
                "engine API range is empty: min {} > current {}",
                self.api_range.min_version, self.api_range.current_version
            )));
        }
        if self.workers == 0 {
            return Err(Error::Configuration("at least one worker is required".into()));
        }
        if self.backoff_initial > self.backoff_max {
            return Err(Error::Configuration(
                "initial backoff exceeds maximum backoff".into(),
            ));
        }
        if self.manager_pod_labels.is_empty() {
            return Err(Error::Configuration(
                "manager pod selector must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Parse `k=v[,k=v...]` into a label map
pub fn parse_label_selector(raw: &str) -> Result<BTreeMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(Error::Configuration(format!(
                "invalid label selector term '{}'",
                pair
            ))),
        })
        .collect()
}
