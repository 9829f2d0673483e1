//! In-process cluster store for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::resources::{ClusterObject, ResourceKind};

use super::{ClientError, ClusterClient};

type Key = (ResourceKind, String, String);

/// An in-memory [`ClusterClient`] with real API-server semantics: distinct
/// not-found and already-exists outcomes and optimistic-concurrency
/// resource versions that bump on every write.
#[derive(Default)]
pub struct MemoryClient {
    objects: RwLock<BTreeMap<Key, ClusterObject>>,
    revision: AtomicU64,
}

impl MemoryClient {
    /// An empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object directly, bypassing create semantics. Test setup
    /// only.
    pub async fn seed(&self, object: impl Into<ClusterObject>) {
        let mut object = object.into();
        self.stamp(&mut object);
        let key = Self::key(&object);
        self.objects.write().await.insert(key, object);
    }

    /// Every stored object, in deterministic order. Used by tests to
    /// compare whole-cluster state before and after a mutate/revert pair.
    pub async fn snapshot(&self) -> Vec<ClusterObject> {
        self.objects.read().await.values().cloned().collect()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether the cluster holds no objects.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn key(object: &ClusterObject) -> Key {
        (
            object.kind(),
            object.namespace().to_string(),
            object.name().to_string(),
        )
    }

    fn stamp(&self, object: &mut ClusterObject) {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        object.metadata_mut().resource_version = Some(revision.to_string());
    }

    fn require_namespace(object: &ClusterObject) -> Result<(), ClientError> {
        if object.namespace().is_empty() {
            return Err(ClientError::MissingNamespace {
                kind: object.kind(),
                name: object.name().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for MemoryClient {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<ClusterObject, ClientError> {
        self.objects
            .read()
            .await
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClientError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<ClusterObject>, ClientError> {
        Ok(self
            .objects
            .read()
            .await
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, object: &ClusterObject) -> Result<(), ClientError> {
        Self::require_namespace(object)?;
        let mut objects = self.objects.write().await;
        let key = Self::key(object);
        if objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists {
                kind: object.kind(),
                namespace: object.namespace().to_string(),
                name: object.name().to_string(),
            });
        }
        let mut stored = object.clone();
        self.stamp(&mut stored);
        objects.insert(key, stored);
        Ok(())
    }

    async fn update(&self, object: &ClusterObject) -> Result<(), ClientError> {
        Self::require_namespace(object)?;
        let mut objects = self.objects.write().await;
        let key = Self::key(object);
        let Some(stored) = objects.get(&key) else {
            return Err(ClientError::NotFound {
                kind: object.kind(),
                namespace: object.namespace().to_string(),
                name: object.name().to_string(),
            });
        };
        let incoming = object.metadata().resource_version.as_deref();
        let current = stored.metadata().resource_version.as_deref();
        if let Some(incoming) = incoming {
            if current != Some(incoming) {
                return Err(ClientError::Conflict {
                    kind: object.kind(),
                    namespace: object.namespace().to_string(),
                    name: object.name().to_string(),
                });
            }
        }
        let mut stored = object.clone();
        self.stamp(&mut stored);
        objects.insert(key, stored);
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.objects
            .write()
            .await
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}
