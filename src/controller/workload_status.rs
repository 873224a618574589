//! Workload Status Controller
//!
//! Mirrors the platform's view of a volume into `status.kubernetesStatus`:
//! the persistent volume provisioned for it, the claim bound to that volume
//! and the pods mounting the claim. When a claim or pod reference disappears
//! the last recorded values stay in place and a `last*RefAt` timestamp marks
//! when the loss was first seen.
//!
//! The controller also detaches volumes from nodes that are confirmed down:
//! once no pod mounting the claim is still terminating or scheduled on the
//! failed node, the VolumeAttachment is deleted so the volume can be attached
//! elsewhere.
//!
//! Keys are persistent volume names.

use super::runner::Reconciler;
use crate::config::ManagerConfig;
use crate::crd::{KubernetesStatus, Volume, WorkloadStatus};
use crate::datastore::{Datastore, ObjectKey};
use crate::domain::ports::{Clock, DiagnosticEvent, EventRecorder, EventSeverity};
use crate::error::{Error, Result, ResultExt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, Pod};
use kube::Resource;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

const PHASE_BOUND: &str = "Bound";

/// Workload owning a pod
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkloadRef {
    pub kind: String,
    pub name: String,
}

impl WorkloadRef {
    /// The pod's controller owner, else its first owner
    pub fn of(pod: &Pod) -> Option<Self> {
        let owners = pod.metadata.owner_references.as_ref()?;
        owners
            .iter()
            .find(|o| o.controller == Some(true))
            .or_else(|| owners.first())
            .map(|o| Self {
                kind: o.kind.clone(),
                name: o.name.clone(),
            })
    }
}

fn workload_status(pod: &Pod) -> WorkloadStatus {
    let owner = WorkloadRef::of(pod).unwrap_or_default();
    WorkloadStatus {
        pod_name: pod.metadata.name.clone().unwrap_or_default(),
        pod_status: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default(),
        workload_name: owner.name,
        workload_type: owner.kind,
    }
}

fn pv_phase(pv: &PersistentVolume) -> String {
    pv.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default()
}

/// Bound claim of a PV as `(namespace, name)`
fn claim_of(pv: &PersistentVolume) -> Option<(String, String)> {
    let claim = pv.spec.as_ref()?.claim_ref.as_ref()?;
    Some((
        claim.namespace.clone().unwrap_or_default(),
        claim.name.clone()?,
    ))
}

/// Record that the claim and pods were lost, keeping the last values seen
fn mark_references_lost(status: &mut KubernetesStatus, now: DateTime<Utc>) {
    if status.pvc_name.is_empty() {
        status.namespace.clear();
        status.last_pvc_ref_at = None;
    } else if status.last_pvc_ref_at.is_none() {
        status.last_pvc_ref_at = Some(now);
    }
    if !status.workloads_status.is_empty() && status.last_pod_ref_at.is_none() {
        status.last_pod_ref_at = Some(now);
    }
}

/// Replace the recorded workloads with the live pods mounting the claim
fn apply_live_pods(status: &mut KubernetesStatus, live: Vec<WorkloadStatus>, now: DateTime<Utc>) {
    let recorded: BTreeSet<&str> = status
        .workloads_status
        .iter()
        .map(|w| w.pod_name.as_str())
        .collect();
    let current: BTreeSet<&str> = live.iter().map(|w| w.pod_name.as_str()).collect();

    if current.is_empty() {
        // Keep the last pods seen
        if !recorded.is_empty() && status.last_pod_ref_at.is_none() {
            status.last_pod_ref_at = Some(now);
        }
        return;
    }

    // A new pod clears the stamp; losing one of several stamps it once
    let gained = current.difference(&recorded).next().is_some();
    let lost = recorded.difference(&current).next().is_some();
    if gained {
        status.last_pod_ref_at = None;
    } else if lost && status.last_pod_ref_at.is_none() {
        status.last_pod_ref_at = Some(now);
    }
    status.workloads_status = live;
}

/// Reconciles persistent volumes provisioned for our volumes
pub struct WorkloadStatusController {
    ds: Datastore,
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn EventRecorder>,
    /// Volume of every PV seen, so a vanished PV can still be resolved
    pv_volumes: DashMap<String, String>,
}

impl WorkloadStatusController {
    pub fn new(
        ds: Datastore,
        config: ManagerConfig,
        clock: Arc<dyn Clock>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            ds,
            config,
            clock,
            recorder,
            pv_volumes: DashMap::new(),
        }
    }

    /// Volume backing a PV, if the PV belongs to our CSI driver
    pub fn volume_of(&self, pv: &PersistentVolume) -> Option<String> {
        let csi = pv.spec.as_ref()?.csi.as_ref()?;
        if csi.driver != self.config.csi_driver_name || csi.volume_handle.is_empty() {
            return None;
        }
        Some(csi.volume_handle.clone())
    }

    /// Cache the PV to volume mapping. Returns false for foreign PVs.
    pub fn remember_pv(&self, pv: &PersistentVolume) -> bool {
        match (pv.metadata.name.as_ref(), self.volume_of(pv)) {
            (Some(name), Some(volume)) => {
                self.pv_volumes.insert(name.clone(), volume);
                true
            }
            _ => false,
        }
    }

    async fn get_volume(&self, name: &str) -> Result<Option<Volume>> {
        self.ds.volumes.get(&self.ds.key(name)).await.ignore_not_found()
    }

    async fn write_status(&self, volume: &Volume, status: KubernetesStatus) -> Result<()> {
        if volume.kubernetes_status() == status {
            return Ok(());
        }
        let mut updated = volume.clone();
        updated
            .status
            .get_or_insert_with(Default::default)
            .kubernetes_status = status;
        self.ds.volumes.update_status(&updated).await?;
        debug!(
            "Updated kubernetes status of volume {}",
            volume.metadata.name.as_deref().unwrap_or("")
        );
        Ok(())
    }

    /// The PV is gone or terminating: stamp the lost references
    async fn sync_vanished(&self, pv_name: &str, volume_name: &str) -> Result<()> {
        let Some(volume) = self.get_volume(volume_name).await? else {
            return Ok(());
        };
        let mut status = volume.kubernetes_status();
        mark_references_lost(&mut status, self.clock.now());
        self.write_status(&volume, status).await?;
        info!(
            "Persistent volume {} of volume {} is gone",
            pv_name, volume_name
        );
        Ok(())
    }

    async fn sync_status(&self, pv: &PersistentVolume, volume: &Volume) -> Result<()> {
        let now = self.clock.now();
        let mut status = volume.kubernetes_status();
        let phase = pv_phase(pv);
        status.pv_name = pv.metadata.name.clone().unwrap_or_default();
        status.pv_status = phase.clone();

        match claim_of(pv).filter(|_| phase == PHASE_BOUND) {
            Some((namespace, claim)) => {
                let mut live: Vec<WorkloadStatus> = self
                    .ds
                    .list_pods_mounting_claim(&namespace, &claim)
                    .await?
                    .iter()
                    .filter(|pod| pod.metadata.deletion_timestamp.is_none())
                    .map(workload_status)
                    .collect();
                live.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));

                status.namespace = namespace;
                status.pvc_name = claim;
                status.last_pvc_ref_at = None;
                apply_live_pods(&mut status, live, now);
            }
            None => mark_references_lost(&mut status, now),
        }

        self.write_status(volume, status).await
    }

    /// Detach the volume from nodes confirmed down once no pod holds it there
    async fn recover_attachments(&self, pv: &PersistentVolume, volume: Option<&Volume>) -> Result<()> {
        let Some((namespace, claim)) = claim_of(pv) else {
            return Ok(());
        };
        let pvc = self
            .ds
            .persistent_volume_claims
            .get(&ObjectKey::namespaced(namespace.clone(), claim.clone()))
            .await
            .ignore_not_found()?;
        let bound = pvc
            .and_then(|pvc| pvc.status)
            .and_then(|s| s.phase)
            .map(|phase| phase == PHASE_BOUND)
            .unwrap_or(false);
        if !bound {
            return Ok(());
        }

        let pv_name = pv.metadata.name.clone().unwrap_or_default();
        for va in self.ds.list_attachments_for_pv(&pv_name).await? {
            let node = va.spec.node_name.as_str();
            if !self.ds.is_node_confirmed_down(node).await? {
                continue;
            }
            let blocking = self
                .ds
                .list_pods_mounting_claim(&namespace, &claim)
                .await?
                .into_iter()
                .filter(|pod| {
                    pod.metadata.deletion_timestamp.is_some()
                        || pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node)
                })
                .count();
            let va_name = va.metadata.name.clone().unwrap_or_default();
            if blocking > 0 {
                debug!(
                    "Keeping attachment {} on down node {}: {} pods still hold claim {}/{}",
                    va_name, node, blocking, namespace, claim
                );
                continue;
            }

            match self
                .ds
                .volume_attachments
                .delete(&ObjectKey::cluster(va_name.clone()))
                .await
            {
                Ok(()) | Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            info!(
                "Deleted attachment {} of persistent volume {} from down node {}",
                va_name, pv_name, node
            );
            if let Some(volume) = volume {
                self.publish(
                    volume.object_ref(&()),
                    DiagnosticEvent {
                        severity: EventSeverity::Normal,
                        reason: "AttachmentRemoved".into(),
                        note: format!(
                            "removed attachment {} from node {}, which is down",
                            va_name, node
                        ),
                        action: "Detach".into(),
                    },
                )
                .await;
            }
        }
        Ok(())
    }

    async fn publish(&self, target: ObjectReference, event: DiagnosticEvent) {
        self.recorder.publish(&target, event).await;
    }
}

#[async_trait]
impl Reconciler for WorkloadStatusController {
    fn name(&self) -> &'static str {
        "workload-status"
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        let pv = self
            .ds
            .persistent_volumes
            .get(&ObjectKey::cluster(key))
            .await
            .ignore_not_found()?;

        let pv = match pv {
            Some(pv) if pv.metadata.deletion_timestamp.is_none() => pv,
            Some(pv) => {
                self.remember_pv(&pv);
                return match self.pv_volumes.get(key).map(|v| v.clone()) {
                    Some(volume) => self.sync_vanished(key, &volume).await,
                    None => Ok(()),
                };
            }
            None => {
                let Some(volume) = self.pv_volumes.get(key).map(|v| v.clone()) else {
                    return Ok(());
                };
                self.sync_vanished(key, &volume).await?;
                self.pv_volumes.remove(key);
                return Ok(());
            }
        };

        if !self.remember_pv(&pv) {
            return Ok(());
        }
        let volume_name = self.volume_of(&pv).unwrap_or_default();
        let volume = self.get_volume(&volume_name).await?;
        if let Some(volume) = volume.as_ref() {
            self.sync_status(&pv, volume).await?;
        }
        self.recover_attachments(&pv, volume.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::recorder::MemoryEventRecorder;
    use crate::crd::ConditionStatus;
    use crate::domain::ports::FixedClock;
    use crate::testing::*;

    const APP_NS: &str = "default";
    const PV: &str = "pv-1";
    const PVC: &str = "data-0";
    const VOLUME: &str = "vol-1";

    struct Fixture {
        ds: Datastore,
        clock: Arc<FixedClock>,
        recorder: Arc<MemoryEventRecorder>,
        controller: WorkloadStatusController,
    }

    fn fixture() -> Fixture {
        let ds = Datastore::in_memory(NAMESPACE);
        let clock = Arc::new(FixedClock::new(test_now()));
        let recorder = Arc::new(MemoryEventRecorder::new());
        let controller =
            WorkloadStatusController::new(ds.clone(), test_config(), clock.clone(), recorder.clone());
        Fixture {
            ds,
            clock,
            recorder,
            controller,
        }
    }

    impl Fixture {
        async fn bound(&self) {
            self.ds.volumes.create(&volume(VOLUME, ENGINE_IMAGE)).await.unwrap();
            self.ds
                .persistent_volumes
                .create(&persistent_volume(PV, VOLUME, Some((APP_NS, PVC)), "Bound"))
                .await
                .unwrap();
            self.ds
                .persistent_volume_claims
                .create(&persistent_volume_claim(APP_NS, PVC, "Bound"))
                .await
                .unwrap();
        }

        async fn add_pod(&self, pod: Pod) {
            self.ds.pods.create(&pod).await.unwrap();
        }


        async fn reconcile(&self) -> Result<()> {
            self.controller.reconcile(PV).await
        }

        async fn status(&self) -> KubernetesStatus {
            self.ds
                .volumes
                .get(&self.ds.key(VOLUME))
                .await
                .unwrap()
                .kubernetes_status()
        }

        async fn node_down(&self, name: &str, reason: &str) {
            self.ds
                .storage_nodes
                .create(&storage_node_with_ready(name, ConditionStatus::False, reason))
                .await
                .unwrap();
        }

        async fn attachment_exists(&self, name: &str) -> bool {
            self.ds
                .volume_attachments
                .get(&ObjectKey::cluster(name))
                .await
                .is_ok()
        }
    }

    fn sts_pod(name: &str, node: &str) -> Pod {
        workload_pod(
            APP_NS,
            name,
            PVC,
            Some(node),
            "Running",
            Some(("StatefulSet", "db")),
        )
    }

    #[tokio::test]
    async fn test_bound_volume_records_claim_and_pods() {
        let f = fixture();
        f.bound().await;
        f.add_pod(sts_pod("db-1", NODE_2)).await;
        f.add_pod(sts_pod("db-0", NODE_1)).await;

        f.reconcile().await.unwrap();
        let status = f.status().await;
        assert_eq!(status.pv_name, PV);
        assert_eq!(status.pv_status, "Bound");
        assert_eq!(status.namespace, APP_NS);
        assert_eq!(status.pvc_name, PVC);
        assert_eq!(status.last_pvc_ref_at, None);
        assert_eq!(status.last_pod_ref_at, None);
        let pods: Vec<_> = status.workloads_status.iter().map(|w| w.pod_name.as_str()).collect();
        assert_eq!(pods, ["db-0", "db-1"]);
        assert_eq!(status.workloads_status[0].workload_type, "StatefulSet");
        assert_eq!(status.workloads_status[0].workload_name, "db");
        assert_eq!(status.workloads_status[0].pod_status, "Running");
    }

    #[tokio::test]
    async fn test_pod_without_owner_and_failed_pod() {
        let f = fixture();
        f.bound().await;
        f.add_pod(workload_pod(APP_NS, "bare", PVC, Some(NODE_1), "Failed", None))
            .await;

        f.reconcile().await.unwrap();
        let status = f.status().await;
        assert_eq!(
            status.workloads_status,
            vec![WorkloadStatus {
                pod_name: "bare".into(),
                pod_status: "Failed".into(),
                workload_name: String::new(),
                workload_type: String::new(),
            }]
        );
    }

    #[tokio::test]
    async fn test_unclaimed_volume_records_only_pv() {
        let f = fixture();
        f.ds.volumes.create(&volume(VOLUME, ENGINE_IMAGE)).await.unwrap();
        f.ds.persistent_volumes
            .create(&persistent_volume(PV, VOLUME, None, "Available"))
            .await
            .unwrap();

        f.reconcile().await.unwrap();
        assert_eq!(
            f.status().await,
            KubernetesStatus {
                pv_name: PV.into(),
                pv_status: "Available".into(),
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn test_no_pods_and_none_recorded_stamps_nothing() {
        let f = fixture();
        f.bound().await;

        f.reconcile().await.unwrap();
        let status = f.status().await;
        assert_eq!(status.pvc_name, PVC);
        assert!(status.workloads_status.is_empty());
        assert_eq!(status.last_pod_ref_at, None);
    }

    #[tokio::test]
    async fn test_all_pods_terminating_keeps_workloads() {
        let f = fixture();
        f.bound().await;
        f.add_pod(sts_pod("db-0", NODE_1)).await;
        f.reconcile().await.unwrap();

        replace(&f.ds.pods, terminating(sts_pod("db-0", NODE_1))).await;
        f.clock.advance(chrono::Duration::minutes(1));
        f.reconcile().await.unwrap();

        let status = f.status().await;
        assert_eq!(status.workloads_status.len(), 1);
        assert_eq!(status.workloads_status[0].pod_name, "db-0");
        assert_eq!(
            status.last_pod_ref_at,
            Some(test_now() + chrono::Duration::minutes(1))
        );

        // A live pod again clears the stamp
        f.add_pod(sts_pod("db-1", NODE_1)).await;
        f.reconcile().await.unwrap();
        let status = f.status().await;
        assert_eq!(status.workloads_status[0].pod_name, "db-1");
        assert_eq!(status.last_pod_ref_at, None);
    }

    #[tokio::test]
    async fn test_one_statefulset_pod_deleted() {
        let f = fixture();
        f.bound().await;
        f.add_pod(sts_pod("db-0", NODE_1)).await;
        f.add_pod(sts_pod("db-1", NODE_2)).await;
        f.reconcile().await.unwrap();
        assert_eq!(f.status().await.workloads_status.len(), 2);

        f.ds.pods
            .delete(&ObjectKey::namespaced(APP_NS, "db-1"))
            .await
            .unwrap();
        f.reconcile().await.unwrap();
        let status = f.status().await;
        assert_eq!(status.workloads_status.len(), 1);
        assert_eq!(status.workloads_status[0].pod_name, "db-0");
        assert_eq!(status.last_pod_ref_at, Some(test_now()));

        // Stamped once
        f.clock.advance(chrono::Duration::minutes(5));
        f.reconcile().await.unwrap();
        assert_eq!(f.status().await.last_pod_ref_at, Some(test_now()));
    }

    #[tokio::test]
    async fn test_failed_pv_keeps_claim_and_stamps() {
        let f = fixture();
        f.bound().await;
        f.add_pod(sts_pod("db-0", NODE_1)).await;
        f.reconcile().await.unwrap();

        let failed = persistent_volume(PV, VOLUME, Some((APP_NS, PVC)), "Failed");
        replace(&f.ds.persistent_volumes, failed).await;
        f.reconcile().await.unwrap();

        let status = f.status().await;
        assert_eq!(status.pv_status, "Failed");
        assert_eq!(status.namespace, APP_NS);
        assert_eq!(status.pvc_name, PVC);
        assert_eq!(status.workloads_status.len(), 1);
        assert_eq!(status.last_pvc_ref_at, Some(test_now()));
        assert_eq!(status.last_pod_ref_at, Some(test_now()));
    }

    #[tokio::test]
    async fn test_deleted_pv_stamps_former_volume() {
        let f = fixture();
        f.bound().await;
        f.add_pod(sts_pod("db-0", NODE_1)).await;
        f.reconcile().await.unwrap();

        f.ds.persistent_volumes
            .delete(&ObjectKey::cluster(PV))
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::minutes(2));
        f.reconcile().await.unwrap();

        let status = f.status().await;
        let stamped = test_now() + chrono::Duration::minutes(2);
        assert_eq!(status.pv_name, PV);
        assert_eq!(status.pvc_name, PVC);
        assert_eq!(status.last_pvc_ref_at, Some(stamped));
        assert_eq!(status.last_pod_ref_at, Some(stamped));
        assert!(f.controller.pv_volumes.is_empty());
    }

    #[tokio::test]
    async fn test_terminating_pv_is_treated_as_gone() {
        let f = fixture();
        f.bound().await;
        f.add_pod(sts_pod("db-0", NODE_1)).await;
        f.reconcile().await.unwrap();

        let pv = persistent_volume(PV, VOLUME, Some((APP_NS, PVC)), "Bound");
        replace(&f.ds.persistent_volumes, terminating(pv)).await;
        f.reconcile().await.unwrap();

        let status = f.status().await;
        assert_eq!(status.last_pvc_ref_at, Some(test_now()));
        assert_eq!(status.last_pod_ref_at, Some(test_now()));
        assert_eq!(status.workloads_status.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_pv_is_ignored() {
        let f = fixture();
        let mut pv = persistent_volume(PV, VOLUME, None, "Available");
        pv.spec.as_mut().unwrap().csi.as_mut().unwrap().driver = "other.csi.io".into();
        f.ds.volumes.create(&volume(VOLUME, ENGINE_IMAGE)).await.unwrap();
        f.ds.persistent_volumes.create(&pv).await.unwrap();

        f.reconcile().await.unwrap();
        assert_eq!(f.status().await, KubernetesStatus::default());
        assert!(f.controller.pv_volumes.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_rewritten() {
        let f = fixture();
        f.bound().await;
        f.add_pod(sts_pod("db-0", NODE_1)).await;
        f.reconcile().await.unwrap();
        let before = f.ds.volumes.get(&f.ds.key(VOLUME)).await.unwrap();

        f.reconcile().await.unwrap();
        let after = f.ds.volumes.get(&f.ds.key(VOLUME)).await.unwrap();
        assert_eq!(
            before.metadata.resource_version,
            after.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_attachment_removed_from_down_node() {
        let f = fixture();
        f.bound().await;
        f.node_down(NODE_1, crate::crd::reason::KUBERNETES_NODE_DOWN).await;
        f.ds.volume_attachments
            .create(&volume_attachment("va-1", PV, NODE_1))
            .await
            .unwrap();
        // Replacement pod waiting to be scheduled
        f.add_pod(workload_pod(APP_NS, "db-0", PVC, None, "Pending", None))
            .await;

        f.reconcile().await.unwrap();
        assert!(!f.attachment_exists("va-1").await);
        let events = f.recorder.with_reason("AttachmentRemoved");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, VOLUME);
    }

    #[tokio::test]
    async fn test_terminating_pod_retains_attachment() {
        let f = fixture();
        f.bound().await;
        f.node_down(NODE_1, crate::crd::reason::KUBERNETES_NODE_NOT_READY)
            .await;
        f.ds.volume_attachments
            .create(&volume_attachment("va-1", PV, NODE_1))
            .await
            .unwrap();
        f.add_pod(terminating(sts_pod("db-0", NODE_1))).await;
        f.add_pod(workload_pod(APP_NS, "db-1", PVC, None, "Pending", None))
            .await;

        f.reconcile().await.unwrap();
        assert!(f.attachment_exists("va-1").await);

        // Once the terminating pod is gone the attachment goes too
        f.ds.pods
            .delete(&ObjectKey::namespaced(APP_NS, "db-0"))
            .await
            .unwrap();
        f.reconcile().await.unwrap();
        assert!(!f.attachment_exists("va-1").await);
    }

    #[tokio::test]
    async fn test_attachment_kept_on_healthy_node() {
        let f = fixture();
        f.bound().await;
        f.ds.storage_nodes
            .create(&storage_node_with_ready(NODE_1, ConditionStatus::True, ""))
            .await
            .unwrap();
        f.ds.volume_attachments
            .create(&volume_attachment("va-1", PV, NODE_1))
            .await
            .unwrap();

        f.reconcile().await.unwrap();
        assert!(f.attachment_exists("va-1").await);
        assert!(f.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_manager_pod_down_does_not_detach() {
        let f = fixture();
        f.bound().await;
        f.node_down(NODE_1, crate::crd::reason::MANAGER_POD_DOWN).await;
        f.ds.volume_attachments
            .create(&volume_attachment("va-1", PV, NODE_1))
            .await
            .unwrap();

        f.reconcile().await.unwrap();
        assert!(f.attachment_exists("va-1").await);
    }

    #[test]
    fn test_workload_ref_prefers_controller() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
        let mut pod = workload_pod(APP_NS, "p", PVC, None, "Running", None);
        pod.metadata.owner_references = Some(vec![
            OwnerReference {
                kind: "ConfigMap".into(),
                name: "cfg".into(),
                ..Default::default()
            },
            OwnerReference {
                kind: "ReplicaSet".into(),
                name: "web-5d8f".into(),
                controller: Some(true),
                ..Default::default()
            },
        ]);
        assert_eq!(
            WorkloadRef::of(&pod),
            Some(WorkloadRef {
                kind: "ReplicaSet".into(),
                name: "web-5d8f".into(),
            })
        );

        pod.metadata.owner_references.as_mut().unwrap().truncate(1);
        assert_eq!(WorkloadRef::of(&pod).unwrap().kind, "ConfigMap");
    }
}
