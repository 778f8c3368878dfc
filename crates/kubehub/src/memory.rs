//! In-memory `ResourceStore`.
//!
//! Keeps objects in a map, assigns UIDs and resource versions, enforces
//! create/replace semantics and broadcasts watch events. Tests drive it as a
//! fake API server: `fail_next` queues errors per operation and `mutate`
//! plays the role of an upstream controller writing status.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use colony_core::{kinds, ResourceEndpoint, StoreError};
use futures::{stream, StreamExt};
use kube::core::{DynamicObject, TypeMeta};
use kube::ResourceExt;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::{describe, EventStream, ResourceStore, WatchEvent};

/// Store operation, used to target failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Discover,
    Version,
    Create,
    Get,
    Replace,
    List,
    Watch,
}

// group, plural, namespace ("" when cluster-scoped), name
type Key = (String, String, String, String);

#[derive(Debug, Clone)]
struct Change {
    group: String,
    plural: String,
    namespace: String,
    event: WatchEvent,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    next_rv: u64,
    failures: HashMap<Op, VecDeque<StoreError>>,
    calls: HashMap<Op, usize>,
    stalled_watches: bool,
}

pub struct MemoryStore {
    endpoints: Vec<ResourceEndpoint>,
    state: Mutex<State>,
    events: broadcast::Sender<Change>,
}

impl MemoryStore {
    pub fn new(endpoints: Vec<ResourceEndpoint>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { endpoints, state: Mutex::new(State::default()), events }
    }

    /// Store serving the kinds the orchestrator drives.
    pub fn fleet() -> Self { Self::new(kinds::fleet_endpoints()) }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue `err` to be returned by the next call of `op`. Errors queue FIFO, one per call.
    pub fn fail_next(&self, op: Op, err: StoreError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Accept new watches but never send their initial list, like an API
    /// server that hangs after the upgrade.
    pub fn stall_watches(&self) {
        self.lock().stalled_watches = true;
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn objects(&self, ep: &ResourceEndpoint, namespace: Option<&str>) -> Vec<DynamicObject> {
        let st = self.lock();
        collect(&st, ep, namespace, None)
    }

    /// Change a stored object in place as a controller would, bumping its resource version.
    pub fn mutate<F>(&self, ep: &ResourceEndpoint, namespace: Option<&str>, name: &str, f: F) -> Result<DynamicObject, StoreError>
    where
        F: FnOnce(&mut DynamicObject),
    {
        let mut st = self.lock();
        let ns = scope(ep, namespace, None)?;
        let key = key(ep, &ns, name);
        let what = describe(ep, Some(&ns), name);
        st.next_rv += 1;
        let rv = st.next_rv.to_string();
        let obj = st.objects.get_mut(&key).ok_or(StoreError::NotFound(what))?;
        f(obj);
        obj.metadata.resource_version = Some(rv);
        let updated = obj.clone();
        self.publish(ep, &ns, WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }

    fn enter(st: &mut State, op: Op) -> Result<(), StoreError> {
        *st.calls.entry(op).or_insert(0) += 1;
        match st.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn publish(&self, ep: &ResourceEndpoint, namespace: &str, event: WatchEvent) {
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(Change {
            group: ep.group.clone(),
            plural: ep.plural.clone(),
            namespace: namespace.to_string(),
            event,
        });
    }

    fn stamp(&self, st: &mut State, ep: &ResourceEndpoint, ns: &str, obj: &mut DynamicObject) {
        st.next_rv += 1;
        obj.metadata.resource_version = Some(st.next_rv.to_string());
        obj.metadata.namespace = if ep.namespaced { Some(ns.to_string()) } else { None };
        obj.types = Some(TypeMeta { api_version: ep.api_version(), kind: ep.kind.clone() });
    }
}

fn key(ep: &ResourceEndpoint, ns: &str, name: &str) -> Key {
    (ep.group.clone(), ep.plural.clone(), ns.to_string(), name.to_string())
}

/// Effective namespace for an object of `ep`; empty for cluster-scoped kinds.
fn scope(ep: &ResourceEndpoint, namespace: Option<&str>, obj: Option<&DynamicObject>) -> Result<String, StoreError> {
    if !ep.namespaced {
        return Ok(String::new());
    }
    namespace
        .or_else(|| obj.and_then(|o| o.metadata.namespace.as_deref()))
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .ok_or_else(|| StoreError::Invalid(format!("namespace required for namespaced kind {}", ep.kind)))
}

fn object_name(obj: &DynamicObject) -> Result<String, StoreError> {
    obj.metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| StoreError::Invalid("metadata.name is required".into()))
}

fn collect(st: &State, ep: &ResourceEndpoint, namespace: Option<&str>, selector: Option<&str>) -> Vec<DynamicObject> {
    let ns_filter = namespace.filter(|_| ep.namespaced);
    st.objects
        .iter()
        .filter(|((g, p, ns, _), _)| *g == ep.group && *p == ep.plural && ns_filter.map_or(true, |f| f == ns.as_str()))
        .filter(|(_, o)| selector.map_or(true, |s| selector_matches(s, o.labels())))
        .map(|(_, o)| o.clone())
        .collect()
}

/// Equality-based label selector: `k=v`, `k==v`, `k!=v`, `k`, `!k`, comma separated.
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            labels.get(k.trim()).map(String::as_str) != Some(v.trim())
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            labels.get(k.trim()).map(String::as_str) == Some(v.trim())
        } else if let Some(k) = term.strip_prefix('!') {
            !labels.contains_key(k.trim())
        } else {
            labels.contains_key(term)
        }
    })
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn discover(&self) -> Result<Vec<ResourceEndpoint>, StoreError> {
        Self::enter(&mut self.lock(), Op::Discover)?;
        Ok(self.endpoints.clone())
    }

    async fn server_version(&self) -> Result<String, StoreError> {
        Self::enter(&mut self.lock(), Op::Version)?;
        Ok("v1.30.0-memory".to_string())
    }

    async fn create(&self, ep: &ResourceEndpoint, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut st = self.lock();
        Self::enter(&mut st, Op::Create)?;
        let name = object_name(obj)?;
        let ns = scope(ep, namespace, Some(obj))?;
        let key = key(ep, &ns, &name);
        if st.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(describe(ep, Some(&ns), &name)));
        }
        let mut stored = obj.clone();
        stored.metadata.uid = Some(Uuid::new_v4().to_string());
        self.stamp(&mut st, ep, &ns, &mut stored);
        st.objects.insert(key, stored.clone());
        self.publish(ep, &ns, WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn get(&self, ep: &ResourceEndpoint, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        let mut st = self.lock();
        Self::enter(&mut st, Op::Get)?;
        let ns = scope(ep, namespace, None)?;
        st.objects
            .get(&key(ep, &ns, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(describe(ep, Some(&ns), name)))
    }

    async fn replace(&self, ep: &ResourceEndpoint, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut st = self.lock();
        Self::enter(&mut st, Op::Replace)?;
        let name = object_name(obj)?;
        let ns = scope(ep, namespace, Some(obj))?;
        let key = key(ep, &ns, &name);
        let what = describe(ep, Some(&ns), &name);
        let current = st.objects.get(&key).ok_or_else(|| StoreError::NotFound(what.clone()))?;
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict(what));
            }
        }
        let mut stored = obj.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        self.stamp(&mut st, ep, &ns, &mut stored);
        st.objects.insert(key, stored.clone());
        self.publish(ep, &ns, WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn list(&self, ep: &ResourceEndpoint, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let mut st = self.lock();
        Self::enter(&mut st, Op::List)?;
        Ok(collect(&st, ep, namespace, selector))
    }

    async fn watch(&self, ep: &ResourceEndpoint, namespace: Option<&str>) -> Result<EventStream, StoreError> {
        // Subscribe and snapshot under one lock so no change falls between them.
        let (rx, snapshot) = {
            let mut st = self.lock();
            Self::enter(&mut st, Op::Watch)?;
            if st.stalled_watches {
                return Ok(stream::pending::<Result<WatchEvent, StoreError>>().boxed());
            }
            (self.events.subscribe(), collect(&st, ep, namespace, None))
        };
        let group = ep.group.clone();
        let plural = ep.plural.clone();
        let ns_filter = namespace.filter(|_| ep.namespaced).map(str::to_string);

        let initial = stream::once(async move { Ok(WatchEvent::Restarted(snapshot)) });
        let changes = stream::unfold(rx, move |mut rx| {
            let group = group.clone();
            let plural = plural.clone();
            let ns_filter = ns_filter.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(c) if c.group == group && c.plural == plural && ns_filter.as_ref().map_or(true, |f| *f == c.namespace) => {
                            return Some((Ok(c.event), rx));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "memory watch lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(initial.chain(changes).boxed())
    }
}
