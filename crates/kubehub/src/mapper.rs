//! Discovery Mapper: resolves a group/version/kind to its collection endpoint.
//!
//! The discovery snapshot is taken once, on first use, and cached for the
//! lifetime of the mapper. It is never refreshed implicitly; call
//! [`DiscoveryMapper::reload`] if the target API's served kinds change.

use std::collections::HashMap;
use std::sync::Arc;

use colony_core::{gvk_key, GroupVersionKind, ResourceEndpoint, StoreError};
use tokio::sync::RwLock;
use tracing::info;

use crate::ResourceStore;

/// Read-only `(group, version, kind) -> endpoint` index built from one discovery snapshot.
#[derive(Debug, Clone, Default)]
pub struct ResourceTypeMapping {
    by_gvk: HashMap<GroupVersionKind, ResourceEndpoint>,
}

impl ResourceTypeMapping {
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = ResourceEndpoint>) -> Self {
        let by_gvk = endpoints.into_iter().map(|ep| (ep.gvk(), ep)).collect();
        Self { by_gvk }
    }

    pub fn get(&self, gvk: &GroupVersionKind) -> Option<&ResourceEndpoint> {
        self.by_gvk.get(gvk)
    }

    pub fn len(&self) -> usize { self.by_gvk.len() }
    pub fn is_empty(&self) -> bool { self.by_gvk.is_empty() }
}

pub struct DiscoveryMapper {
    store: Arc<dyn ResourceStore>,
    mapping: RwLock<Option<Arc<ResourceTypeMapping>>>,
}

impl DiscoveryMapper {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store, mapping: RwLock::new(None) }
    }

    /// Mapper pre-seeded with a snapshot; no discovery call is made.
    pub fn with_mapping(store: Arc<dyn ResourceStore>, mapping: ResourceTypeMapping) -> Self {
        Self { store, mapping: RwLock::new(Some(Arc::new(mapping))) }
    }

    /// Cached mapping, loading it on first use.
    pub async fn mapping(&self) -> Result<Arc<ResourceTypeMapping>, StoreError> {
        if let Some(m) = self.mapping.read().await.as_ref() {
            return Ok(Arc::clone(m));
        }
        let mut slot = self.mapping.write().await;
        // Another caller may have loaded it while we waited for the write lock.
        if let Some(m) = slot.as_ref() {
            return Ok(Arc::clone(m));
        }
        let loaded = Arc::new(self.load().await?);
        *slot = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Rebuild the mapping from a fresh discovery snapshot.
    pub async fn reload(&self) -> Result<Arc<ResourceTypeMapping>, StoreError> {
        let loaded = Arc::new(self.load().await?);
        *self.mapping.write().await = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResourceEndpoint, StoreError> {
        self.mapping()
            .await?
            .get(gvk)
            .cloned()
            .ok_or_else(|| StoreError::UnknownKind(gvk_key(gvk)))
    }

    async fn load(&self) -> Result<ResourceTypeMapping, StoreError> {
        let endpoints = self.store.discover().await?;
        let mapping = ResourceTypeMapping::from_endpoints(endpoints);
        info!(kinds = mapping.len(), "loaded resource mappings");
        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, Op};
    use colony_core::kinds;

    #[tokio::test]
    async fn resolves_known_kinds_and_caches_snapshot() {
        let store = Arc::new(MemoryStore::fleet());
        let mapper = DiscoveryMapper::new(store.clone());

        let ep = mapper.resolve(&kinds::power_job()).await.unwrap();
        assert_eq!(ep.plural, "jobs");
        assert!(ep.namespaced);
        let ep = mapper.resolve(&kinds::hardware()).await.unwrap();
        assert_eq!(ep.plural, "hardware");
        assert_eq!(store.calls(Op::Discover), 1);
    }

    #[tokio::test]
    async fn unknown_kind_is_reported_with_gvk_key() {
        let store = Arc::new(MemoryStore::fleet());
        let mapper = DiscoveryMapper::new(store);
        let err = mapper.resolve(&GroupVersionKind::gvk("example.io", "v1", "Widget")).await.unwrap_err();
        assert_eq!(err, StoreError::UnknownKind("example.io/v1/Widget".into()));
    }

    #[tokio::test]
    async fn version_must_match_exactly() {
        let store = Arc::new(MemoryStore::fleet());
        let mapper = DiscoveryMapper::new(store);
        let err = mapper.resolve(&GroupVersionKind::gvk("tinkerbell.org", "v1beta1", "Hardware")).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownKind(_)));
    }

    #[tokio::test]
    async fn failed_discovery_is_not_cached() {
        let store = Arc::new(MemoryStore::fleet());
        store.fail_next(Op::Discover, StoreError::Transient("connection refused".into()));
        let mapper = DiscoveryMapper::new(store.clone());
        assert!(mapper.resolve(&kinds::secret()).await.unwrap_err().is_transient());
        assert!(mapper.resolve(&kinds::secret()).await.is_ok());
        assert_eq!(store.calls(Op::Discover), 2);
    }

    #[tokio::test]
    async fn reload_takes_a_new_snapshot() {
        let store = Arc::new(MemoryStore::fleet());
        let mapper = DiscoveryMapper::with_mapping(store.clone(), ResourceTypeMapping::default());
        assert!(mapper.resolve(&kinds::secret()).await.is_err());
        mapper.reload().await.unwrap();
        assert!(mapper.resolve(&kinds::secret()).await.is_ok());
        assert_eq!(store.calls(Op::Discover), 1);
    }
}
