//! Cluster Repository
//!
//! Repository backed by the Kubernetes API. Reads come from a reflector
//! store kept current by a watch stream; writes go straight to the API
//! server and carry the object's `resourceVersion` so a stale write is
//! rejected with 409.

use super::{ObjectKey, Repository};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "blockstore-manager";

type ApiFactory<K> = fn(Client, Option<&str>) -> Api<K>;

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn cluster_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = ClusterResourceScope>,
    K::DynamicType: Default,
{
    Api::all(client)
}

fn write_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Start a reflector for `api`.
///
/// Returns the cache reader and the stream of touched objects (applied and
/// deleted). The stream must be polled for the cache to fill, and the
/// reader reports ready after the first complete listing.
pub fn reflect<K>(
    api: Api<K>,
    config: watcher::Config,
) -> (Store<K>, impl Stream<Item = std::result::Result<K, watcher::Error>>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, config))
        .default_backoff()
        .touched_objects();
    (reader, stream)
}

/// Repository for one kind, backed by the API server and a reflector cache
pub struct KubeRepository<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    kind: &'static str,
    client: Client,
    store: Store<K>,
    api_for: ApiFactory<K>,
}

impl<K> KubeRepository<K>
where
    K: Resource<Scope = NamespaceResourceScope> + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Repository for a namespaced kind
    pub fn namespaced(kind: &'static str, client: Client, store: Store<K>) -> Self {
        Self {
            kind,
            client,
            store,
            api_for: namespaced_api::<K>,
        }
    }
}

impl<K> KubeRepository<K>
where
    K: Resource<Scope = ClusterResourceScope> + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Repository for a cluster-scoped kind
    pub fn cluster(kind: &'static str, client: Client, store: Store<K>) -> Self {
        Self {
            kind,
            client,
            store,
            api_for: cluster_api::<K>,
        }
    }
}

impl<K> KubeRepository<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> Repository<K> for KubeRepository<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    async fn get(&self, key: &ObjectKey) -> Result<K> {
        let mut reference = ObjectRef::<K>::new(&key.name);
        if let Some(ns) = &key.namespace {
            reference = reference.within(ns);
        }
        self.store
            .get(&reference)
            .map(|obj| (*obj).clone())
            .ok_or_else(|| Error::NotFound {
                kind: self.kind.to_string(),
                name: key.to_string(),
            })
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|obj| match namespace {
                Some(ns) => obj.meta().namespace.as_deref() == Some(ns),
                None => true,
            })
            .map(|obj| (*obj).clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.api(key.namespace.as_deref())
            .create(&write_params(), obj)
            .await
            .map_err(|e| Error::from_kube(self.kind, &key.to_string(), e))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        // PUT replaces the whole status (so pruned map entries disappear) and
        // the server rejects it if the carried resourceVersion is stale
        let body = serde_json::to_vec(obj)?;
        self.api(key.namespace.as_deref())
            .replace_status(&key.name, &write_params(), body)
            .await
            .map_err(|e| Error::from_kube(self.kind, &key.to_string(), e))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.api(key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(self.kind, &key.to_string(), e))
    }

    async fn wait_until_ready(&self) -> Result<()> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|e| Error::Transient(format!("{} cache: {}", self.kind, e)))
    }
}
