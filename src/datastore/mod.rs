//! Datastore - typed object repositories shared by all controllers
//!
//! Each resource kind gets its own [`Repository`]: reads are served from a
//! cache, writes are compare-and-write against the last observed
//! `resourceVersion`. Controllers never talk to the API server directly; they
//! receive a [`Datastore`] and go through it, which lets tests swap in the
//! in-memory backend.

pub mod cluster;
pub mod memory;

use crate::crd::{
    reason, ConditionStatus, Engine, EngineImage, InstanceManager, Replica, StorageNode, Volume,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use cluster::KubeRepository;
pub use memory::MemoryRepository;

// =============================================================================
// Object Keys
// =============================================================================

/// Namespace/name of an object; cluster-scoped objects have no namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// =============================================================================
// Repository Trait
// =============================================================================

/// Typed access to one resource kind
#[async_trait]
pub trait Repository<K>: Send + Sync
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Read one object from the cache
    async fn get(&self, key: &ObjectKey) -> Result<K>;

    /// List cached objects, optionally restricted to a namespace
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    /// Create a new object; fails with `AlreadyExists` on a name clash
    async fn create(&self, obj: &K) -> Result<K>;

    /// Write the object's status. Fails with `Conflict` when the stored
    /// `resourceVersion` differs from the one carried by `obj`.
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Delete an object; fails with `NotFound` when it is already gone
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Resolve once the cache holds a complete listing
    async fn wait_until_ready(&self) -> Result<()>;
}

/// Shared handle to a repository
pub type Repo<K> = Arc<dyn Repository<K>>;

// =============================================================================
// Datastore
// =============================================================================

/// All repositories the controllers consume
#[derive(Clone)]
pub struct Datastore {
    /// Namespace holding the manager's own objects
    pub namespace: String,

    pub engine_images: Repo<EngineImage>,
    pub storage_nodes: Repo<StorageNode>,
    pub instance_managers: Repo<InstanceManager>,
    pub volumes: Repo<Volume>,
    pub engines: Repo<Engine>,
    pub replicas: Repo<Replica>,

    pub pods: Repo<Pod>,
    pub kube_nodes: Repo<Node>,
    pub daemon_sets: Repo<DaemonSet>,
    pub persistent_volumes: Repo<PersistentVolume>,
    pub persistent_volume_claims: Repo<PersistentVolumeClaim>,
    pub volume_attachments: Repo<VolumeAttachment>,
}

impl Datastore {
    /// Datastore backed entirely by in-memory repositories
    pub fn in_memory(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            engine_images: Arc::new(MemoryRepository::new("EngineImage")),
            storage_nodes: Arc::new(MemoryRepository::new("StorageNode")),
            instance_managers: Arc::new(MemoryRepository::new("InstanceManager")),
            volumes: Arc::new(MemoryRepository::new("Volume")),
            engines: Arc::new(MemoryRepository::new("Engine")),
            replicas: Arc::new(MemoryRepository::new("Replica")),
            pods: Arc::new(MemoryRepository::new("Pod")),
            kube_nodes: Arc::new(MemoryRepository::new("Node")),
            daemon_sets: Arc::new(MemoryRepository::new("DaemonSet")),
            persistent_volumes: Arc::new(MemoryRepository::new("PersistentVolume")),
            persistent_volume_claims: Arc::new(MemoryRepository::new("PersistentVolumeClaim")),
            volume_attachments: Arc::new(MemoryRepository::new("VolumeAttachment")),
        }
    }

    /// Key of an object in the manager namespace
    pub fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::namespaced(self.namespace.clone(), name)
    }

    /// Resolve once every repository's cache is filled. Until then an empty
    /// read cannot be told apart from a missing object.
    pub async fn wait_for_cache_sync(&self) -> Result<()> {
        futures::future::try_join_all(vec![
            self.engine_images.wait_until_ready(),
            self.storage_nodes.wait_until_ready(),
            self.instance_managers.wait_until_ready(),
            self.volumes.wait_until_ready(),
            self.engines.wait_until_ready(),
            self.replicas.wait_until_ready(),
            self.pods.wait_until_ready(),
            self.kube_nodes.wait_until_ready(),
            self.daemon_sets.wait_until_ready(),
            self.persistent_volumes.wait_until_ready(),
            self.persistent_volume_claims.wait_until_ready(),
            self.volume_attachments.wait_until_ready(),
        ])
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Storage objects
    // -------------------------------------------------------------------------

    pub async fn list_engine_images(&self) -> Result<Vec<EngineImage>> {
        self.engine_images.list(Some(&self.namespace)).await
    }

    pub async fn list_storage_nodes(&self) -> Result<Vec<StorageNode>> {
        self.storage_nodes.list(Some(&self.namespace)).await
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.volumes.list(Some(&self.namespace)).await
    }

    pub async fn list_engines(&self) -> Result<Vec<Engine>> {
        self.engines.list(Some(&self.namespace)).await
    }

    pub async fn list_instance_managers(&self) -> Result<Vec<InstanceManager>> {
        self.instance_managers.list(Some(&self.namespace)).await
    }

    /// Instance managers running the given image, keyed by name
    pub async fn list_instance_managers_for_image(
        &self,
        image: &str,
    ) -> Result<BTreeMap<String, InstanceManager>> {
        Ok(self
            .list_instance_managers()
            .await?
            .into_iter()
            .filter(|im| im.spec.image == image)
            .map(|im| (im.metadata.name.clone().unwrap_or_default(), im))
            .collect())
    }

    /// Replicas placed on a node, in any lifecycle state
    pub async fn list_replicas_on_node(&self, node: &str) -> Result<Vec<Replica>> {
        Ok(self
            .replicas
            .list(Some(&self.namespace))
            .await?
            .into_iter()
            .filter(|r| r.spec.node_id == node)
            .collect())
    }

    /// Whether a storage node should be considered unable to do housekeeping:
    /// its object is missing, or its Ready condition is False for a
    /// node-level reason.
    pub async fn is_node_down_or_deleted(&self, node: &str) -> Result<bool> {
        if node.is_empty() {
            return Ok(true);
        }
        let sn = match self.storage_nodes.get(&self.key(node)).await {
            Ok(sn) => sn,
            Err(Error::NotFound { .. }) => return Ok(true),
            Err(e) => return Err(e),
        };
        let ready = sn.ready_condition();
        Ok(ready.status == ConditionStatus::False
            && matches!(
                ready.reason.as_str(),
                reason::MANAGER_POD_DOWN
                    | reason::KUBERNETES_NODE_DOWN
                    | reason::KUBERNETES_NODE_NOT_READY
            ))
    }

    /// Whether a node is confirmed down at the cluster level
    pub async fn is_node_confirmed_down(&self, node: &str) -> Result<bool> {
        let sn = match self.storage_nodes.get(&self.key(node)).await {
            Ok(sn) => sn,
            Err(Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let ready = sn.ready_condition();
        Ok(ready.status == ConditionStatus::False
            && matches!(
                ready.reason.as_str(),
                reason::KUBERNETES_NODE_DOWN | reason::KUBERNETES_NODE_NOT_READY
            ))
    }

    // -------------------------------------------------------------------------
    // Platform objects
    // -------------------------------------------------------------------------

    /// Pods in the manager namespace whose labels include every selector pair
    pub async fn list_pods_by_labels(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .list(Some(&self.namespace))
            .await?
            .into_iter()
            .filter(|pod| {
                let labels = pod.metadata.labels.as_ref();
                selector
                    .iter()
                    .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
            })
            .collect())
    }

    /// Pods in `namespace` that mount the given claim, terminating ones included
    pub async fn list_pods_mounting_claim(&self, namespace: &str, claim: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .list(Some(namespace))
            .await?
            .into_iter()
            .filter(|pod| pod_mounts_claim(pod, claim))
            .collect())
    }

    /// VolumeAttachments whose source is the given persistent volume
    pub async fn list_attachments_for_pv(&self, pv_name: &str) -> Result<Vec<VolumeAttachment>> {
        Ok(self
            .volume_attachments
            .list(None)
            .await?
            .into_iter()
            .filter(|va| va.spec.source.persistent_volume_name.as_deref() == Some(pv_name))
            .collect())
    }
}

/// Whether any pod volume references the claim
pub fn pod_mounts_claim(pod: &Pod, claim: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .map(|pvc| pvc.claim_name == claim)
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}
