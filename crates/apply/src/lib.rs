//! Colony apply: decode manifests and create-or-update them against the store.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use colony_core::{api_version, GroupVersionKind, ResourceEndpoint, StoreError};
use colony_kubehub::{describe, DiscoveryMapper, ResourceStore};
use kube::core::DynamicObject;
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub mod manifest;
pub mod retry;

pub use manifest::{decode_documents, decode_value, documents, DecodeError, DecodedManifest};
pub use retry::{retry_on_conflict, retry_while, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    Created,
    Updated,
}

/// Result of applying one document.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedObject {
    pub kind: String,
    pub api_version: String,
    pub name: String,
    pub namespace: Option<String>,
    pub outcome: ApplyOutcome,
    pub resource_version: Option<String>,
    pub uid: Option<String>,
    #[serde(skip)]
    pub object: DynamicObject,
}

/// Failure of one document. `index` counts decoded documents across the whole call, from 0.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("manifest {index}: {error}")]
    Decode { index: usize, error: DecodeError },
    #[error("manifest {index} ({target}): {error}")]
    Store { index: usize, target: String, error: StoreError },
    #[error("manifest {index} ({target}): update still conflicting after {attempts} attempts")]
    ConflictsExhausted { index: usize, target: String, attempts: u32 },
}

impl ApplyError {
    pub fn index(&self) -> usize {
        match self {
            ApplyError::Decode { index, .. }
            | ApplyError::Store { index, .. }
            | ApplyError::ConflictsExhausted { index, .. } => *index,
        }
    }

    /// Underlying store error, if the failure came from the store.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            ApplyError::Store { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Create-or-update engine. Kinds are never hard-coded; every document is
/// resolved through the discovery mapper.
#[derive(Clone)]
pub struct Applier {
    store: Arc<dyn ResourceStore>,
    mapper: Arc<DiscoveryMapper>,
    retry: RetryPolicy,
    default_namespace: Option<String>,
}

impl Applier {
    pub fn new(store: Arc<dyn ResourceStore>, mapper: Arc<DiscoveryMapper>) -> Self {
        Self { store, mapper, retry: RetryPolicy::default(), default_namespace: None }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Namespace for namespaced documents that don't name one.
    pub fn with_default_namespace(mut self, ns: impl Into<String>) -> Self {
        self.default_namespace = Some(ns.into());
        self
    }

    pub fn mapper(&self) -> &Arc<DiscoveryMapper> { &self.mapper }

    /// Decode and apply every document of every text, in order. Stops at the
    /// first failure; documents applied before it stay applied.
    pub async fn apply_all<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<AppliedObject>, ApplyError> {
        let mut index = 0usize;
        let mut out = Vec::new();
        for text in texts {
            for doc in documents(text.as_ref()) {
                let doc = doc.map_err(|error| ApplyError::Decode { index, error })?;
                out.push(self.apply_indexed(index, &doc).await?);
                index += 1;
            }
        }
        Ok(out)
    }

    pub async fn apply_manifest(&self, doc: &DecodedManifest) -> Result<AppliedObject, ApplyError> {
        self.apply_indexed(0, doc).await
    }

    async fn apply_indexed(&self, index: usize, doc: &DecodedManifest) -> Result<AppliedObject, ApplyError> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);
        let res = self.apply_one(index, doc).await;
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(a) if a.outcome == ApplyOutcome::Created => counter!("apply_created", 1u64),
            Ok(_) => counter!("apply_updated", 1u64),
            Err(_) => counter!("apply_err", 1u64),
        }
        res
    }

    async fn apply_one(&self, index: usize, doc: &DecodedManifest) -> Result<AppliedObject, ApplyError> {
        let store_err = |target: &str, error: StoreError| ApplyError::Store { index, target: target.to_string(), error };

        let ep = self.mapper.resolve(&doc.gvk).await.map_err(|e| store_err(&doc.target(), e))?;
        let namespace = if ep.namespaced {
            match doc.namespace.clone().or_else(|| self.default_namespace.clone()) {
                Some(ns) => Some(ns),
                None => {
                    let e = StoreError::Invalid("namespace required for namespaced kind".into());
                    return Err(store_err(&doc.target(), e));
                }
            }
        } else {
            None
        };
        let target = describe(&ep, namespace.as_deref(), &doc.name);
        let mut desired = doc.to_object().map_err(|error| ApplyError::Decode { index, error })?;
        desired.metadata.namespace = namespace.clone();

        match self.store.create(&ep, namespace.as_deref(), &desired).await {
            Ok(obj) => {
                info!(resource = %target, "created");
                Ok(applied(&doc.gvk, ApplyOutcome::Created, obj))
            }
            Err(e) if e.is_already_exists() => {
                debug!(resource = %target, "exists; updating");
                match self.update(&ep, namespace.as_deref(), &desired).await {
                    Ok(obj) => {
                        info!(resource = %target, "updated");
                        Ok(applied(&doc.gvk, ApplyOutcome::Updated, obj))
                    }
                    Err(e) if e.is_conflict() => Err(ApplyError::ConflictsExhausted { index, target, attempts: self.retry.attempts }),
                    Err(e) => Err(store_err(&target, e)),
                }
            }
            Err(e) => Err(store_err(&target, e)),
        }
    }

    /// Read the live object, stamp its resourceVersion onto `desired`, replace.
    async fn update(&self, ep: &ResourceEndpoint, namespace: Option<&str>, desired: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let store = &self.store;
        let name = desired.metadata.name.clone().unwrap_or_default();
        let name = name.as_str();
        retry_on_conflict(&self.retry, || async move {
            let live = store.get(ep, namespace, name).await?;
            let mut next = desired.clone();
            next.metadata.resource_version = live.metadata.resource_version;
            store.replace(ep, namespace, &next).await
        })
        .await
    }
}

fn applied(gvk: &GroupVersionKind, outcome: ApplyOutcome, obj: DynamicObject) -> AppliedObject {
    AppliedObject {
        kind: gvk.kind.clone(),
        api_version: api_version(gvk),
        name: obj.metadata.name.clone().unwrap_or_default(),
        namespace: obj.metadata.namespace.clone(),
        outcome,
        resource_version: obj.metadata.resource_version.clone(),
        uid: obj.metadata.uid.clone(),
        object: obj,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_core::kinds;
    use colony_kubehub::{MemoryStore, Op};
    use std::time::Duration;

    const SECRET: &str = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: 10-0-10-5\n  namespace: tink-system\nstringData:\n  username: admin\n";

    fn setup() -> (Arc<MemoryStore>, Applier) {
        let store = Arc::new(MemoryStore::fleet());
        let mapper = Arc::new(DiscoveryMapper::new(store.clone()));
        let applier = Applier::new(store.clone(), mapper).with_default_namespace("tink-system");
        (store, applier)
    }

    fn secret_ep() -> ResourceEndpoint {
        ResourceEndpoint::new(&kinds::secret(), "secrets", true)
    }

    #[tokio::test]
    async fn applying_twice_updates_the_single_object() {
        let (store, applier) = setup();
        let first = applier.apply_all(&[SECRET]).await.unwrap();
        assert_eq!(first[0].outcome, ApplyOutcome::Created);

        let changed = SECRET.replace("admin", "root");
        let second = applier.apply_all(&[changed]).await.unwrap();
        assert_eq!(second[0].outcome, ApplyOutcome::Updated);
        assert_eq!(second[0].uid, first[0].uid);
        assert_ne!(second[0].resource_version, first[0].resource_version);

        let objs = store.objects(&secret_ep(), Some("tink-system"));
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].data["stringData"]["username"], "root");
        assert_eq!(store.calls(Op::Replace), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_on_first_update_is_retried() {
        let (store, applier) = setup();
        applier.apply_all(&[SECRET]).await.unwrap();
        store.fail_next(Op::Replace, StoreError::Conflict("object has been modified".into()));

        let out = applier.apply_all(&[SECRET]).await.unwrap();
        assert_eq!(out[0].outcome, ApplyOutcome::Updated);
        assert_eq!(store.calls(Op::Replace), 2);
        // the object is re-read on every attempt
        assert_eq!(store.calls(Op::Get), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_conflicts_exhaust_the_budget() {
        let (store, applier) = setup();
        let applier = applier.with_retry(RetryPolicy::new(3, Duration::from_millis(10)));
        applier.apply_all(&[SECRET]).await.unwrap();
        for _ in 0..3 {
            store.fail_next(Op::Replace, StoreError::Conflict("object has been modified".into()));
        }
        let err = applier.apply_all(&[SECRET]).await.unwrap_err();
        assert!(matches!(err, ApplyError::ConflictsExhausted { attempts: 3, .. }), "{err}");
        assert!(err.to_string().contains("Secret tink-system/10-0-10-5"));
        assert_eq!(store.calls(Op::Replace), 3);
    }

    #[tokio::test]
    async fn unknown_kind_is_fatal_and_not_retried() {
        let (store, applier) = setup();
        let doc = "apiVersion: example.io/v1\nkind: Widget\nmetadata:\n  name: w\n";
        let err = applier.apply_all(&[doc]).await.unwrap_err();
        assert_eq!(err.store_error(), Some(&StoreError::UnknownKind("example.io/v1/Widget".into())));
        assert_eq!(store.calls(Op::Create), 0);
    }

    #[tokio::test]
    async fn other_create_failures_are_not_retried() {
        let (store, applier) = setup();
        store.fail_next(Op::Create, StoreError::Forbidden("secrets is forbidden".into()));
        let err = applier.apply_all(&[SECRET]).await.unwrap_err();
        assert!(matches!(err.store_error(), Some(StoreError::Forbidden(_))));
        assert_eq!(store.calls(Op::Create), 1);
        assert_eq!(store.calls(Op::Get), 0);
    }

    #[tokio::test]
    async fn failure_reports_document_index_and_keeps_prior_effects() {
        let (store, applier) = setup();
        let ok = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: first\n";
        let bad = "apiVersion: v1\nkind: Secret\nmetadata:\n  labels: {}\n";
        let err = applier.apply_all(&[ok, bad]).await.unwrap_err();
        assert_eq!(err.index(), 1);
        assert!(err.to_string().contains("missing metadata.name"), "{err}");
        let objs = store.objects(&secret_ep(), Some("tink-system"));
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].metadata.name.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn multi_document_text_is_indexed_per_document() {
        let (_store, applier) = setup();
        let text = format!("{SECRET}---\napiVersion: example.io/v1\nkind: Widget\nmetadata:\n  name: w\n");
        let err = applier.apply_all(&[text]).await.unwrap_err();
        assert_eq!(err.index(), 1);
        assert!(err.to_string().contains("Widget"));
    }

    #[tokio::test]
    async fn bad_document_inside_one_text_keeps_the_ones_before_it() {
        let (store, applier) = setup();
        let text = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: first\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  labels: {}\n";
        let err = applier.apply_all(&[text]).await.unwrap_err();
        assert!(matches!(err, ApplyError::Decode { index: 1, .. }), "{err}");
        let objs = store.objects(&secret_ep(), Some("tink-system"));
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].metadata.name.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn namespaced_kind_without_namespace_is_rejected() {
        let store = Arc::new(MemoryStore::fleet());
        let mapper = Arc::new(DiscoveryMapper::new(store.clone()));
        let applier = Applier::new(store.clone(), mapper);
        let doc = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: lonely\n";
        let err = applier.apply_all(&[doc]).await.unwrap_err();
        assert!(matches!(err.store_error(), Some(StoreError::Invalid(_))));
        assert_eq!(store.calls(Op::Create), 0);
    }
}
