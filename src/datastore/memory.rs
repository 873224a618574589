//! In-Memory Repository
//!
//! DashMap-backed store with the same compare-and-write semantics as the API
//! server. Used by the test suite and by benchmarks.

use super::{ObjectKey, Repository};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// In-memory repository for one resource kind
pub struct MemoryRepository<K> {
    kind: &'static str,
    /// The actual storage map
    objects: DashMap<ObjectKey, K>,
    /// Monotonic resource version shared by every write
    version: AtomicU64,
    synced: watch::Sender<bool>,
}

impl<K> MemoryRepository<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            objects: DashMap::new(),
            version: AtomicU64::new(0),
            synced: watch::Sender::new(true),
        }
    }

    /// Repository whose cache reports ready only after [`Self::mark_synced`]
    pub fn unsynced(kind: &'static str) -> Self {
        let repo = Self::new(kind);
        repo.synced.send_replace(false);
        repo
    }

    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn not_found(&self, key: &ObjectKey) -> Error {
        Error::NotFound {
            kind: self.kind.to_string(),
            name: key.to_string(),
        }
    }
}

#[async_trait]
impl<K> Repository<K> for MemoryRepository<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<K> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| self.not_found(key))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let mut objects: Vec<(ObjectKey, K)> = self
            .objects
            .iter()
            .filter(|entry| match namespace {
                Some(ns) => entry.key().namespace.as_deref() == Some(ns),
                None => true,
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(objects.into_iter().map(|(_, obj)| obj).collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        if key.name.is_empty() {
            return Err(Error::Validation {
                kind: self.kind.to_string(),
                name: String::new(),
                reason: "metadata.name is required".into(),
            });
        }

        match self.objects.entry(key.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyExists {
                kind: self.kind.to_string(),
                name: key.to_string(),
            }),
            Entry::Vacant(slot) => {
                let mut stored = obj.clone();
                let meta = stored.meta_mut();
                let version = self.next_version();
                if meta.uid.is_none() {
                    meta.uid = Some(format!("{}-{}", self.kind.to_lowercase(), version));
                }
                meta.resource_version = Some(version);
                if meta.creation_timestamp.is_none() {
                    meta.creation_timestamp = Some(Time(chrono::Utc::now()));
                }
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut entry = self.objects.get_mut(&key).ok_or_else(|| self.not_found(&key))?;

        let current = entry.meta().resource_version.clone();
        if obj.meta().resource_version != current {
            return Err(Error::Conflict {
                kind: self.kind.to_string(),
                name: key.to_string(),
            });
        }

        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(self.next_version());
        *entry = stored.clone();
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| self.not_found(key))
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let mut synced = self.synced.subscribe();
        synced
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|e| Error::Transient(format!("{} cache: {}", self.kind, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EngineImage, EngineImageSpec, EngineImageStatus};
    use assert_matches::assert_matches;

    fn image(name: &str) -> EngineImage {
        let mut ei = EngineImage::new(
            name,
            EngineImageSpec {
                image: "registry.local/engine:v1".into(),
            },
        );
        ei.metadata.namespace = Some("blockstore-system".into());
        ei
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let repo = MemoryRepository::<EngineImage>::new("EngineImage");
        let created = repo.create(&image("ei-1")).await.unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let key = ObjectKey::namespaced("blockstore-system", "ei-1");
        let fetched = repo.get(&key).await.unwrap();
        assert_eq!(fetched.spec.image, "registry.local/engine:v1");

        assert_matches!(
            repo.create(&image("ei-1")).await,
            Err(Error::AlreadyExists { .. })
        );

        repo.delete(&key).await.unwrap();
        assert_matches!(repo.get(&key).await, Err(Error::NotFound { .. }));
        assert_matches!(repo.delete(&key).await, Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let repo = MemoryRepository::<EngineImage>::new("EngineImage");
        let created = repo.create(&image("ei-1")).await.unwrap();

        let mut first = created.clone();
        first.status = Some(EngineImageStatus {
            ref_count: 1,
            ..Default::default()
        });
        let written = repo.update_status(&first).await.unwrap();
        assert_ne!(written.metadata.resource_version, created.metadata.resource_version);

        // A writer still holding the original version loses
        let mut stale = created;
        stale.status = Some(EngineImageStatus::default());
        assert_matches!(repo.update_status(&stale).await, Err(Error::Conflict { .. }));

        let key = ObjectKey::of(&written);
        let current = repo.get(&key).await.unwrap();
        assert_eq!(current.status.unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn test_list_filters_namespace() {
        let repo = MemoryRepository::<EngineImage>::new("EngineImage");
        repo.create(&image("ei-b")).await.unwrap();
        repo.create(&image("ei-a")).await.unwrap();
        let mut other = image("ei-c");
        other.metadata.namespace = Some("other".into());
        repo.create(&other).await.unwrap();

        let names: Vec<String> = repo
            .list(Some("blockstore-system"))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|ei| ei.metadata.name)
            .collect();
        assert_eq!(names, vec!["ei-a", "ei-b"]);
        assert_eq!(repo.list(None).await.unwrap().len(), 3);
        assert_eq!(repo.len(), 3);
    }
}
