//! Node Controller
//!
//! Computes a StorageNode's Ready condition from the manager pod and the
//! cluster node, and, on the node this instance runs on, its mount
//! propagation condition and per-disk capacity and scheduling state.

use super::runner::Reconciler;
use crate::config::ManagerConfig;
use crate::crd::{
    reason, set_condition, ConditionStatus, DiskConditionType, DiskSpec, DiskStatus,
    NodeConditionType, Replica, StorageNode, StorageNodeStatus,
};
use crate::datastore::Datastore;
use crate::domain::ports::{Clock, DiagnosticEvent, DiskProbe, EventRecorder, EventSeverity};
use crate::error::{Error, Result, ResultExt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Resource;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cluster node conditions that indicate resource pressure when True
const PRESSURE_CONDITIONS: &[&str] = &[
    "DiskPressure",
    "MemoryPressure",
    "PIDPressure",
    "OutOfDisk",
    "NetworkUnavailable",
];

const BIDIRECTIONAL: &str = "Bidirectional";

/// Longest an unchanged status goes without refreshing `lastProbeTime`
const PROBE_TIME_REFRESH_SECS: i64 = 300;

/// A condition outcome before it is stamped into a map
#[derive(Debug, Clone, PartialEq, Eq)]
struct Verdict {
    status: ConditionStatus,
    reason: &'static str,
    message: String,
}

impl Verdict {
    fn ok() -> Self {
        Self {
            status: ConditionStatus::True,
            reason: "",
            message: String::new(),
        }
    }

    fn fail(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: ConditionStatus::False,
            reason,
            message: message.into(),
        }
    }
}

/// Reconciles StorageNode status
pub struct NodeController {
    ds: Datastore,
    config: ManagerConfig,
    probe: Arc<dyn DiskProbe>,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn EventRecorder>,
}

impl NodeController {
    pub fn new(
        ds: Datastore,
        config: ManagerConfig,
        probe: Arc<dyn DiskProbe>,
        clock: Arc<dyn Clock>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            ds,
            config,
            probe,
            clock,
            recorder,
        }
    }

    async fn manager_pod(&self, node: &str) -> Result<Option<Pod>> {
        let mut pods: Vec<Pod> = self
            .ds
            .list_pods_by_labels(&self.config.manager_pod_labels)
            .await?
            .into_iter()
            .filter(|pod| {
                pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node)
            })
            .collect();
        // A replacement pod may coexist with its terminating predecessor
        pods.sort_by_key(|pod| pod.metadata.deletion_timestamp.is_some());
        Ok(pods.into_iter().next())
    }

    async fn sync_disks(
        &self,
        node: &StorageNode,
        status: &mut StorageNodeStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let node_name = node.node_name();
        let replicas: Vec<Replica> = self
            .ds
            .list_replicas_on_node(node_name)
            .await?
            .into_iter()
            .filter(Replica::is_active)
            .collect();

        status
            .disk_status
            .retain(|disk_id, _| node.spec.disks.contains_key(disk_id));

        for (disk_id, disk) in &node.spec.disks {
            let entry = status.disk_status.entry(disk_id.clone()).or_default();

            entry.scheduled_replica = replicas
                .iter()
                .filter(|r| r.is_placed_on(node_name, disk_id))
                .map(|r| (r.metadata.name.clone().unwrap_or_default(), r.spec.volume_size))
                .collect();
            entry.storage_scheduled = entry.scheduled_replica.values().sum();

            match self.probe.probe(&disk.path).await {
                Ok(info) => {
                    let recorded = entry
                        .filesystem_id
                        .get_or_insert_with(|| info.filesystem_id.clone())
                        .clone();
                    if recorded != info.filesystem_id {
                        warn!(
                            "Disk {} on {} changed filesystem: recorded {}, found {}",
                            disk_id, node_name, recorded, info.filesystem_id
                        );
                        let message = format!(
                            "disk {} filesystem changed from {} to {}; remove and re-add the disk to use it",
                            disk.path, recorded, info.filesystem_id
                        );
                        entry.storage_maximum = 0;
                        entry.storage_available = 0;
                        set_condition(
                            &mut entry.conditions,
                            DiskConditionType::Ready,
                            ConditionStatus::False,
                            reason::DISK_FILESYSTEM_CHANGED,
                            &message,
                            now,
                        );
                        set_condition(
                            &mut entry.conditions,
                            DiskConditionType::Schedulable,
                            ConditionStatus::False,
                            reason::DISK_FILESYSTEM_CHANGED,
                            "disk is not ready",
                            now,
                        );
                        continue;
                    }

                    entry.storage_maximum = info.storage_maximum;
                    entry.storage_available = info.storage_available;
                    set_condition(
                        &mut entry.conditions,
                        DiskConditionType::Ready,
                        ConditionStatus::True,
                        "",
                        "",
                        now,
                    );
                    let verdict = schedulability(
                        disk,
                        entry,
                        self.config.storage_minimal_available_percentage,
                        self.config.storage_over_provisioning_percentage,
                    );
                    set_condition(
                        &mut entry.conditions,
                        DiskConditionType::Schedulable,
                        verdict.status,
                        verdict.reason,
                        &verdict.message,
                        now,
                    );
                }
                Err(e) => {
                    // Keep the last known capacity; only this disk is affected
                    warn!("Failed to probe disk {} on {}: {}", disk_id, node_name, e);
                    let message = e.to_string();
                    for condition in [DiskConditionType::Ready, DiskConditionType::Schedulable] {
                        set_condition(
                            &mut entry.conditions,
                            condition,
                            ConditionStatus::Unknown,
                            reason::DISK_PROBE_FAILED,
                            &message,
                            now,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, node: &StorageNode, event: DiagnosticEvent) {
        self.recorder.publish(&node.object_ref(&()), event).await;
    }
}

#[async_trait]
impl Reconciler for NodeController {
    fn name(&self) -> &'static str {
        "node"
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        let node = self.ds.storage_nodes.get(&self.ds.key(key)).await?;
        if node.meta().deletion_timestamp.is_some() {
            debug!("Storage node {} is being deleted", key);
            return Ok(());
        }

        let now = self.clock.now();
        let current = node.status.clone().unwrap_or_default();
        let mut status = current.clone();

        let pod = self.manager_pod(key).await?;
        let kube_node = self
            .ds
            .kube_nodes
            .get(&crate::datastore::ObjectKey::cluster(key))
            .await
            .ignore_not_found()?;

        let ready = ready_verdict(key, pod.as_ref(), kube_node.as_ref());
        set_condition(
            &mut status.conditions,
            NodeConditionType::Ready,
            ready.status,
            ready.reason,
            &ready.message,
            now,
        );

        // Disk paths and the manager pod's mounts are only visible locally
        if key == self.config.controller_id {
            let propagation = mount_propagation_verdict(pod.as_ref());
            set_condition(
                &mut status.conditions,
                NodeConditionType::MountPropagation,
                propagation.status,
                propagation.reason,
                &propagation.message,
                now,
            );
            self.sync_disks(&node, &mut status, now).await?;
        }

        let probe_is_recent = current
            .conditions
            .get(&NodeConditionType::Ready)
            .and_then(|c| c.last_probe_time)
            .map(|probed| (now - probed).num_seconds() < PROBE_TIME_REFRESH_SECS)
            .unwrap_or(false);
        if node.status.is_some() && status.equivalent(&current) && probe_is_recent {
            debug!("Storage node {} unchanged", key);
            return Ok(());
        }

        let was_ready = current
            .conditions
            .get(&NodeConditionType::Ready)
            .map(|c| c.status);
        let mut updated = node.clone();
        updated.status = Some(status);
        self.ds.storage_nodes.update_status(&updated).await?;

        if was_ready != Some(ready.status) {
            info!(
                "Node {} Ready is now {} {}",
                key, ready.status, ready.reason
            );
            let event = if ready.status == ConditionStatus::True {
                DiagnosticEvent {
                    severity: EventSeverity::Normal,
                    reason: "Ready".into(),
                    note: format!("node {} is ready", key),
                    action: "UpdateCondition".into(),
                }
            } else {
                DiagnosticEvent {
                    severity: EventSeverity::Warning,
                    reason: ready.reason.to_string(),
                    note: ready.message.clone(),
                    action: "UpdateCondition".into(),
                }
            };
            self.publish(&node, event).await;
        }
        Ok(())
    }

    async fn retries_exhausted(&self, key: &str, error: &Error) {
        if let Ok(node) = self.ds.storage_nodes.get(&self.ds.key(key)).await {
            self.publish(
                &node,
                DiagnosticEvent {
                    severity: EventSeverity::Warning,
                    reason: "ReconcileFailed".into(),
                    note: error.to_string(),
                    action: "Reconcile".into(),
                },
            )
            .await;
        }
    }
}

fn ready_verdict(node: &str, pod: Option<&Pod>, kube_node: Option<&Node>) -> Verdict {
    let pod = match pod {
        Some(pod) => pod,
        None => {
            return Verdict::fail(
                reason::MANAGER_POD_DOWN,
                format!("manager pod is missing on node {}", node),
            )
        }
    };
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    if phase != "Running" {
        return Verdict::fail(
            reason::MANAGER_POD_DOWN,
            format!(
                "manager pod {} is {}",
                pod.metadata.name.as_deref().unwrap_or(""),
                phase
            ),
        );
    }

    let kube_node = match kube_node {
        Some(n) => n,
        None => {
            return Verdict::fail(
                reason::KUBERNETES_NODE_DOWN,
                format!("kubernetes node {} is gone", node),
            )
        }
    };
    let conditions = kube_node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    for condition in conditions.iter().filter(|c| c.type_ == "Ready") {
        if condition.status != "True" {
            return Verdict::fail(
                reason::KUBERNETES_NODE_NOT_READY,
                format!(
                    "kubernetes node {} not ready: {}",
                    node,
                    condition.message.as_deref().unwrap_or(&condition.status)
                ),
            );
        }
    }
    let pressure: Vec<&str> = conditions
        .iter()
        .filter(|c| PRESSURE_CONDITIONS.contains(&c.type_.as_str()) && c.status == "True")
        .map(|c| c.type_.as_str())
        .collect();
    if !pressure.is_empty() {
        return Verdict::fail(
            reason::KUBERNETES_NODE_PRESSURE,
            format!("kubernetes node {} has {}", node, pressure.join(", ")),
        );
    }
    Verdict::ok()
}

fn mount_propagation_verdict(pod: Option<&Pod>) -> Verdict {
    let bidirectional = pod
        .and_then(|p| p.spec.as_ref())
        .map(|spec| {
            spec.containers.iter().any(|c| {
                c.volume_mounts.iter().flatten().any(|m| {
                    m.mount_propagation.as_deref() == Some(BIDIRECTIONAL)
                })
            })
        })
        .unwrap_or(false);
    if bidirectional {
        Verdict::ok()
    } else {
        Verdict::fail(
            reason::NO_MOUNT_PROPAGATION_SUPPORT,
            "manager pod has no bidirectional volume mount",
        )
    }
}

/// Scheduling verdict for one probed disk.
///
/// The disk takes new replicas only when scheduling is allowed, it has free
/// space, the headroom left after reserved and scheduled bytes exceeds the
/// minimal-available share of its maximum, and scheduled bytes stay within
/// the over-provisioning limit of its usable capacity.
fn schedulability(
    spec: &DiskSpec,
    status: &DiskStatus,
    minimal_available_percentage: i64,
    over_provisioning_percentage: i64,
) -> Verdict {
    if !spec.allow_scheduling {
        return Verdict::fail(reason::DISK_PRESSURE, "scheduling disabled on this disk");
    }
    let maximum = status.storage_maximum;
    let available = status.storage_available;
    let scheduled = status.storage_scheduled;

    if maximum <= 0 || available <= 0 {
        return Verdict::fail(
            reason::DISK_PRESSURE,
            format!("no space available (maximum {}, available {})", maximum, available),
        );
    }

    let headroom = available
        .saturating_sub(spec.storage_reserved)
        .saturating_sub(scheduled);
    let threshold = maximum.saturating_mul(minimal_available_percentage) / 100;
    if headroom <= threshold {
        return Verdict::fail(
            reason::DISK_PRESSURE,
            format!(
                "headroom {} is at or below {}% of maximum {}",
                headroom, minimal_available_percentage, maximum
            ),
        );
    }

    let limit = maximum
        .saturating_sub(spec.storage_reserved)
        .max(0)
        .saturating_mul(over_provisioning_percentage)
        / 100;
    if scheduled > limit {
        return Verdict::fail(
            reason::DISK_PRESSURE,
            format!(
                "scheduled {} exceeds over-provisioning limit {}",
                scheduled, limit
            ),
        );
    }
    Verdict::ok()
}
