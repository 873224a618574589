//! Event fan-out
//!
//! Maps a change to any watched object onto the keys of every controller
//! whose output depends on it, and periodically re-enqueues every key so
//! that missed or coalesced events still converge.

use super::workload_status::WorkloadStatusController;
use super::workqueue::WorkQueue;
use crate::config::ManagerConfig;
use crate::crd::{Engine, EngineImage, InstanceManager, Replica, StorageNode, Volume};
use crate::datastore::{pod_mounts_claim, Datastore};
use crate::domain::naming;
use crate::error::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::runtime::watcher;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reaction to a change of one watched kind
#[async_trait]
pub trait Fanout<K>: Send + Sync {
    async fn on_change(&self, obj: &K) -> Result<()>;
}

/// Enqueues controller keys for watched object changes
pub struct EventFanout {
    ds: Datastore,
    config: ManagerConfig,
    nodes: Arc<WorkQueue<String>>,
    images: Arc<WorkQueue<String>>,
    pvs: Arc<WorkQueue<String>>,
    workload: Arc<WorkloadStatusController>,
}

impl EventFanout {
    pub fn new(
        ds: Datastore,
        config: ManagerConfig,
        nodes: Arc<WorkQueue<String>>,
        images: Arc<WorkQueue<String>>,
        pvs: Arc<WorkQueue<String>>,
        workload: Arc<WorkloadStatusController>,
    ) -> Self {
        Self {
            ds,
            config,
            nodes,
            images,
            pvs,
            workload,
        }
    }

    fn enqueue_node(&self, name: &str) {
        if !name.is_empty() {
            self.nodes.add(name.to_string());
        }
    }

    /// EngineImages deploying `image`, or its canonical name when none
    /// does so that leftovers get cleaned up
    async fn enqueue_image(&self, image: &str) -> Result<()> {
        if image.is_empty() {
            return Ok(());
        }
        let mut found = false;
        for ei in self.ds.list_engine_images().await? {
            if ei.spec.image == image {
                if let Some(name) = ei.metadata.name {
                    self.images.add(name);
                    found = true;
                }
            }
        }
        if !found {
            self.images.add(naming::engine_image_name(image));
        }
        Ok(())
    }

    async fn enqueue_all_images(&self) -> Result<()> {
        for ei in self.ds.list_engine_images().await? {
            if let Some(name) = ei.metadata.name {
                self.images.add(name);
            }
        }
        Ok(())
    }

    /// Persistent volumes with an attachment on `node`
    async fn enqueue_attached_pvs(&self, node: &str) -> Result<()> {
        let pvs: BTreeSet<String> = self
            .ds
            .volume_attachments
            .list(None)
            .await?
            .into_iter()
            .filter(|va| va.spec.node_name == node)
            .filter_map(|va| va.spec.source.persistent_volume_name)
            .collect();
        for pv in pvs {
            self.pvs.add(pv);
        }
        Ok(())
    }

    /// Persistent volumes whose claim is mounted by `pod`
    async fn enqueue_claimed_pvs(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("");
        for pv in self.ds.persistent_volumes.list(None).await? {
            let claim = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref());
            let Some(claim) = claim else { continue };
            let claim_name = claim.name.as_deref().unwrap_or("");
            if claim.namespace.as_deref().unwrap_or("") == namespace
                && pod_mounts_claim(pod, claim_name)
            {
                if let Some(name) = pv.metadata.name {
                    self.pvs.add(name);
                }
            }
        }
        Ok(())
    }

    fn is_manager_pod(&self, pod: &Pod) -> bool {
        if pod.metadata.namespace.as_deref() != Some(self.ds.namespace.as_str()) {
            return false;
        }
        let labels = pod.metadata.labels.as_ref();
        self.config
            .manager_pod_labels
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }

    /// Re-enqueue every node, image and persistent volume we own
    pub async fn resync(&self) -> Result<()> {
        for node in self.ds.list_storage_nodes().await? {
            if let Some(name) = node.metadata.name {
                self.nodes.add(name);
            }
        }
        self.enqueue_all_images().await?;
        for pv in self.ds.persistent_volumes.list(None).await? {
            if self.workload.remember_pv(&pv) {
                if let Some(name) = pv.metadata.name {
                    self.pvs.add(name);
                }
            }
        }
        Ok(())
    }

    /// Resync every `period` until cancelled
    pub async fn run_resync(self: Arc<Self>, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!("Resync failed: {}", e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Fanout<StorageNode> for EventFanout {
    async fn on_change(&self, node: &StorageNode) -> Result<()> {
        let name = node.metadata.name.as_deref().unwrap_or("");
        self.enqueue_node(name);
        // Node health decides image ownership and instance manager placement
        self.enqueue_all_images().await?;
        self.enqueue_attached_pvs(name).await
    }
}

#[async_trait]
impl Fanout<Node> for EventFanout {
    async fn on_change(&self, node: &Node) -> Result<()> {
        let name = node.metadata.name.as_deref().unwrap_or("");
        self.enqueue_node(name);
        self.enqueue_attached_pvs(name).await
    }
}

#[async_trait]
impl Fanout<Pod> for EventFanout {
    async fn on_change(&self, pod: &Pod) -> Result<()> {
        if self.is_manager_pod(pod) {
            let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
            self.enqueue_node(node.unwrap_or(""));
            return Ok(());
        }
        self.enqueue_claimed_pvs(pod).await
    }
}

#[async_trait]
impl Fanout<Replica> for EventFanout {
    async fn on_change(&self, replica: &Replica) -> Result<()> {
        self.enqueue_node(&replica.spec.node_id);
        Ok(())
    }
}

#[async_trait]
impl Fanout<EngineImage> for EventFanout {
    async fn on_change(&self, ei: &EngineImage) -> Result<()> {
        if let Some(name) = ei.metadata.name.clone() {
            self.images.add(name);
        }
        Ok(())
    }
}

#[async_trait]
impl Fanout<DaemonSet> for EventFanout {
    async fn on_change(&self, daemon_set: &DaemonSet) -> Result<()> {
        let owner = daemon_set
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(&naming::label("engine-image")));
        if let Some(owner) = owner {
            self.images.add(owner.clone());
            return Ok(());
        }
        // Deprecated DaemonSets only carry the image in their name
        let name = daemon_set.metadata.name.as_deref().unwrap_or("");
        for ei in self.ds.list_engine_images().await? {
            if naming::daemon_set_name(&ei.spec.image) == name {
                if let Some(ei_name) = ei.metadata.name {
                    self.images.add(ei_name);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Fanout<InstanceManager> for EventFanout {
    async fn on_change(&self, im: &InstanceManager) -> Result<()> {
        self.enqueue_image(&im.spec.image).await
    }
}

#[async_trait]
impl Fanout<Volume> for EventFanout {
    async fn on_change(&self, volume: &Volume) -> Result<()> {
        self.enqueue_image(&volume.spec.engine_image).await?;
        self.enqueue_image(volume.current_image()).await
    }
}

#[async_trait]
impl Fanout<Engine> for EventFanout {
    async fn on_change(&self, engine: &Engine) -> Result<()> {
        self.enqueue_image(&engine.spec.engine_image).await?;
        self.enqueue_image(engine.current_image()).await
    }
}

#[async_trait]
impl Fanout<PersistentVolume> for EventFanout {
    async fn on_change(&self, pv: &PersistentVolume) -> Result<()> {
        if self.workload.remember_pv(pv) {
            if let Some(name) = pv.metadata.name.clone() {
                self.pvs.add(name);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Fanout<PersistentVolumeClaim> for EventFanout {
    async fn on_change(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        if let Some(pv) = pvc.spec.as_ref().and_then(|s| s.volume_name.clone()) {
            self.pvs.add(pv);
        }
        Ok(())
    }
}

#[async_trait]
impl Fanout<VolumeAttachment> for EventFanout {
    async fn on_change(&self, va: &VolumeAttachment) -> Result<()> {
        if let Some(pv) = va.spec.source.persistent_volume_name.clone() {
            self.pvs.add(pv);
        }
        Ok(())
    }
}

/// Feed a watch stream into the fan-out until it ends or `token` fires
pub async fn drive<K, S>(
    fanout: Arc<EventFanout>,
    kind: &'static str,
    stream: S,
    token: CancellationToken,
) where
    K: Send + Sync,
    S: Stream<Item = std::result::Result<K, watcher::Error>> + Send,
    EventFanout: Fanout<K>,
{
    futures::pin_mut!(stream);
    info!("Watching {}", kind);
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(obj)) => {
                if let Err(e) = fanout.on_change(&obj).await {
                    warn!("Failed to fan out {} change: {}", kind, e);
                }
            }
            Some(Err(e)) => warn!("{} watch error: {}", kind, e),
            None => break,
        }
    }
    debug!("Stopped watching {}", kind);
}
