//! Colony kubehub: the resource-store seam, discovery mapping and watch wiring.
//!
//! Every component above this crate talks to the cluster through [`ResourceStore`].
//! [`KubeStore`] implements it with kube-rs dynamic objects; [`MemoryStore`] is an
//! in-process implementation used by tests and local dry runs.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use colony_core::{ResourceEndpoint, StoreError};
use futures::stream::BoxStream;
use kube::core::DynamicObject;

pub mod classify;
pub mod kube_store;
pub mod mapper;
pub mod memory;
pub mod watch;

pub use kube_store::KubeStore;
pub use mapper::{DiscoveryMapper, ResourceTypeMapping};
pub use memory::{MemoryStore, Op};
pub use watch::{creations, CreationTracker};

/// Raw watch event, mirroring the list+watch protocol.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Object created or modified.
    Applied(DynamicObject),
    Deleted(DynamicObject),
    /// Full relist; emitted first and after every watch desync.
    Restarted(Vec<DynamicObject>),
}

pub type EventStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Typed-resource store operations the orchestrator consumes.
///
/// `namespace` is ignored for cluster-scoped endpoints. For namespaced endpoints
/// `list` and `watch` span all namespaces when it is `None`.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Snapshot of every served group/version/kind.
    async fn discover(&self) -> Result<Vec<ResourceEndpoint>, StoreError>;

    async fn server_version(&self) -> Result<String, StoreError>;

    async fn create(&self, ep: &ResourceEndpoint, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn get(&self, ep: &ResourceEndpoint, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError>;

    /// Full update; `obj.metadata.resource_version` is the concurrency token.
    async fn replace(&self, ep: &ResourceEndpoint, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn list(&self, ep: &ResourceEndpoint, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<DynamicObject>, StoreError>;

    /// Start a list+watch. The first event is always `Restarted` with the initial list;
    /// consumers that must not miss creations wait for it before triggering them.
    async fn watch(&self, ep: &ResourceEndpoint, namespace: Option<&str>) -> Result<EventStream, StoreError>;
}

/// Human-readable `kind namespace/name` used in logs and error messages.
pub fn describe(ep: &ResourceEndpoint, namespace: Option<&str>, name: &str) -> String {
    match namespace.filter(|_| ep.namespaced) {
        Some(ns) => format!("{} {}/{}", ep.kind, ns, name),
        None => format!("{} {}", ep.kind, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_core::kinds;

    #[test]
    fn describe_includes_namespace_only_when_scoped() {
        let ep = ResourceEndpoint::new(&kinds::hardware(), "hardware", true);
        assert_eq!(describe(&ep, Some("tink-system"), "hw-1"), "Hardware tink-system/hw-1");
        let cluster = ResourceEndpoint { namespaced: false, ..ep };
        assert_eq!(describe(&cluster, Some("tink-system"), "hw-1"), "Hardware hw-1");
    }
}
