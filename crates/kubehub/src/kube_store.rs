//! `ResourceStore` over a live API server using kube-rs dynamic objects.

use async_trait::async_trait;
use colony_core::{ResourceEndpoint, StoreError};
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use tracing::{debug, info};

use crate::classify::{classify, classify_dyn};
use crate::{describe, EventStream, ResourceStore, WatchEvent};

/// Store handle bound to one connection profile. Cheap to clone.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    pub fn client(&self) -> &Client { &self.client }

    fn api(&self, ep: &ResourceEndpoint, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(ep);
        match namespace.filter(|_| ep.namespaced) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn scoped_api(&self, ep: &ResourceEndpoint, namespace: Option<&str>, what: &str) -> Result<Api<DynamicObject>, StoreError> {
        if ep.namespaced && namespace.is_none() {
            return Err(StoreError::Invalid(format!("namespace required for namespaced kind ({})", what)));
        }
        Ok(self.api(ep, namespace))
    }
}

pub fn api_resource(ep: &ResourceEndpoint) -> ApiResource {
    ApiResource {
        group: ep.group.clone(),
        version: ep.version.clone(),
        api_version: ep.api_version(),
        kind: ep.kind.clone(),
        plural: ep.plural.clone(),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn discover(&self) -> Result<Vec<ResourceEndpoint>, StoreError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| classify(&e, "discovery"))?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    out.push(ResourceEndpoint {
                        group: ar.group.clone(),
                        version: ar.version.clone(),
                        kind: ar.kind.clone(),
                        plural: ar.plural.clone(),
                        namespaced: matches!(caps.scope, Scope::Namespaced),
                    });
                }
            }
        }
        // Stable-ish order
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        debug!(count = out.len(), "discovery snapshot loaded");
        Ok(out)
    }

    async fn server_version(&self) -> Result<String, StoreError> {
        let info = self.client.apiserver_version().await.map_err(|e| classify(&e, "server version"))?;
        Ok(info.git_version)
    }

    async fn create(&self, ep: &ResourceEndpoint, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let what = describe(ep, namespace, &obj.name_any());
        let api = self.scoped_api(ep, namespace, &what)?;
        api.create(&PostParams::default(), obj).await.map_err(|e| classify(&e, &what))
    }

    async fn get(&self, ep: &ResourceEndpoint, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        let what = describe(ep, namespace, name);
        let api = self.scoped_api(ep, namespace, &what)?;
        api.get(name).await.map_err(|e| classify(&e, &what))
    }

    async fn replace(&self, ep: &ResourceEndpoint, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let name = obj.name_any();
        let what = describe(ep, namespace, &name);
        let api = self.scoped_api(ep, namespace, &what)?;
        api.replace(&name, &PostParams::default(), obj).await.map_err(|e| classify(&e, &what))
    }

    async fn list(&self, ep: &ResourceEndpoint, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let mut lp = ListParams::default();
        if let Some(sel) = selector {
            lp = lp.labels(sel);
        }
        let what = format!("{} list ({})", ep.kind, selector.unwrap_or("*"));
        let list = self.api(ep, namespace).list(&lp).await.map_err(|e| classify(&e, &what))?;
        Ok(list.items)
    }

    async fn watch(&self, ep: &ResourceEndpoint, namespace: Option<&str>) -> Result<EventStream, StoreError> {
        let api = self.api(ep, namespace);
        let what = format!("{} watch", ep.kind);
        info!(gvk = %ep.gvk_key(), ns = ?namespace, "watcher started");
        let stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map_ok(|ev| match ev {
                watcher::Event::Applied(o) => WatchEvent::Applied(o),
                watcher::Event::Deleted(o) => WatchEvent::Deleted(o),
                watcher::Event::Restarted(list) => WatchEvent::Restarted(list),
            })
            .map_err(move |e| classify_dyn(&e, &what));
        Ok(stream.boxed())
    }
}
