//! Colony wait: the two-phase Readiness Poller.
//!
//! Phase one lists by label selector until a matching object exists and passes
//! the predicate's `found` check; phase two re-reads that object by name until
//! it is `ready`. Each phase has its own interval and timeout. Transient store
//! errors count as "not yet"; anything else ends the wait immediately.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use colony_core::{GroupVersionKind, ResourceEndpoint, StoreError};
use colony_kubehub::{describe, DiscoveryMapper, ResourceStore};
use kube::core::DynamicObject;
use kube::ResourceExt;
use metrics::counter;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod poll;
pub mod readiness;

pub use poll::{poll_until, PollError};
pub use readiness::{last_condition, DeploymentReady, LastCondition, Readiness, ReadinessError, WorkflowFinished, WorkflowState};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("{what} did not appear within {timeout:?}")]
    AppearTimeout { what: String, timeout: Duration },
    #[error("{what} was not ready within {timeout:?}")]
    ReadyTimeout { what: String, timeout: Duration },
    #[error("wait for {what} cancelled")]
    Cancelled { what: String },
    #[error("{what} failed: {reason}")]
    Failed { what: String, reason: String },
    #[error("{what}: {reason}")]
    Invalid { what: String, reason: String },
    #[error("{what}: {error}")]
    Store { what: String, error: StoreError },
}

impl WaitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::AppearTimeout { .. } | WaitError::ReadyTimeout { .. })
    }
}

/// What to wait for: a kind, a scope and a label selector, plus the phase timeouts.
#[derive(Debug, Clone)]
pub struct WaitTarget {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub selector: String,
    pub appear_timeout: Duration,
    pub ready_timeout: Duration,
}

impl WaitTarget {
    /// Both phases default to 120s.
    pub fn new(gvk: GroupVersionKind, namespace: Option<&str>, selector: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: namespace.map(str::to_string),
            selector: selector.into(),
            appear_timeout: Duration::from_secs(120),
            ready_timeout: Duration::from_secs(120),
        }
    }

    /// Same timeout for both phases.
    pub fn timeout(self, t: Duration) -> Self {
        self.timeouts(t, t)
    }

    pub fn timeouts(mut self, appear: Duration, ready: Duration) -> Self {
        self.appear_timeout = appear;
        self.ready_timeout = ready;
        self
    }

    fn describe_selector(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} in {} matching {}", self.gvk.kind, ns, self.selector),
            None => format!("{} matching {}", self.gvk.kind, self.selector),
        }
    }
}

// Poll-step error: either "stop now" with a store error or a predicate verdict.
enum Abort {
    Store(StoreError),
    Readiness(ReadinessError),
}

#[derive(Clone)]
pub struct Poller {
    store: Arc<dyn ResourceStore>,
    mapper: Arc<DiscoveryMapper>,
    appear_interval: Duration,
    ready_interval: Duration,
}

impl Poller {
    /// Appearance is polled every 15s, readiness every 5s.
    pub fn new(store: Arc<dyn ResourceStore>, mapper: Arc<DiscoveryMapper>) -> Self {
        Self { store, mapper, appear_interval: Duration::from_secs(15), ready_interval: Duration::from_secs(5) }
    }

    pub fn with_intervals(mut self, appear: Duration, ready: Duration) -> Self {
        self.appear_interval = appear;
        self.ready_interval = ready;
        self
    }

    /// Wait until an object matching `target` is found and then ready.
    /// Returns the object as last observed.
    pub async fn wait_for(
        &self,
        target: &WaitTarget,
        predicate: &dyn Readiness,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject, WaitError> {
        let listing = target.describe_selector();
        let ep = self.mapper.resolve(&target.gvk).await.map_err(|error| WaitError::Store { what: listing.clone(), error })?;
        let ns = target.namespace.as_deref();

        info!(resource = %listing, timeout_s = target.appear_timeout.as_secs(), "waiting for resource to appear");
        let found = self.wait_found(&ep, target, predicate, cancel).await.map_err(|e| match e {
            PollError::Timeout => {
                counter!("wait_timeouts", 1u64);
                WaitError::AppearTimeout { what: listing.clone(), timeout: target.appear_timeout }
            }
            PollError::Cancelled => WaitError::Cancelled { what: listing.clone() },
            PollError::Aborted(a) => abort_error(listing.clone(), a),
        })?;

        let name = found.name_any();
        let what = describe(&ep, ns, &name);
        info!(resource = %what, timeout_s = target.ready_timeout.as_secs(), "waiting for resource to be ready");
        self.wait_ready(&ep, ns, &name, predicate, target.ready_timeout, cancel).await.map_err(|e| match e {
            PollError::Timeout => {
                counter!("wait_timeouts", 1u64);
                WaitError::ReadyTimeout { what: what.clone(), timeout: target.ready_timeout }
            }
            PollError::Cancelled => WaitError::Cancelled { what: what.clone() },
            PollError::Aborted(a) => abort_error(what.clone(), a),
        })
    }

    async fn wait_found(
        &self,
        ep: &ResourceEndpoint,
        target: &WaitTarget,
        predicate: &dyn Readiness,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject, PollError<Abort>> {
        let store = &self.store;
        let ns = target.namespace.as_deref();
        let selector = target.selector.as_str();
        poll_until(self.appear_interval, target.appear_timeout, cancel, || async move {
            let items = match store.list(ep, ns, Some(selector)).await {
                Ok(items) => items,
                Err(e) if e.is_transient() || e.is_not_found() => {
                    not_yet(&e);
                    return Ok(None);
                }
                Err(e) => return Err(Abort::Store(e)),
            };
            for obj in items {
                if predicate.found(&obj).map_err(Abort::Readiness)? {
                    return Ok(Some(obj));
                }
            }
            debug!(selector, "no matching resource yet");
            Ok(None)
        })
        .await
    }

    async fn wait_ready(
        &self,
        ep: &ResourceEndpoint,
        ns: Option<&str>,
        name: &str,
        predicate: &dyn Readiness,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject, PollError<Abort>> {
        let store = &self.store;
        poll_until(self.ready_interval, timeout, cancel, || async move {
            let obj = match store.get(ep, ns, name).await {
                Ok(obj) => obj,
                Err(e) if e.is_transient() => {
                    not_yet(&e);
                    return Ok(None);
                }
                Err(e) => return Err(Abort::Store(e)),
            };
            if predicate.ready(&obj).map_err(Abort::Readiness)? {
                Ok(Some(obj))
            } else {
                debug!(name, "not ready yet");
                Ok(None)
            }
        })
        .await
    }

    pub async fn wait_for_deployment(&self, namespace: &str, selector: &str, timeout: Duration, cancel: &CancellationToken) -> Result<DynamicObject, WaitError> {
        let target = WaitTarget::new(colony_core::kinds::deployment(), Some(namespace), selector).timeout(timeout);
        self.wait_for(&target, &DeploymentReady, cancel).await
    }

    pub async fn wait_for_machine(&self, namespace: &str, selector: &str, timeout: Duration, cancel: &CancellationToken) -> Result<DynamicObject, WaitError> {
        let target = WaitTarget::new(colony_core::kinds::machine(), Some(namespace), selector).timeout(timeout);
        self.wait_for(&target, &LastCondition::CONTACTABLE, cancel).await
    }

    pub async fn wait_for_job(&self, namespace: &str, selector: &str, timeout: Duration, cancel: &CancellationToken) -> Result<DynamicObject, WaitError> {
        let target = WaitTarget::new(colony_core::kinds::power_job(), Some(namespace), selector).timeout(timeout);
        self.wait_for(&target, &LastCondition::COMPLETED, cancel).await
    }

    pub async fn wait_for_workflow(&self, namespace: &str, selector: &str, timeout: Duration, cancel: &CancellationToken) -> Result<DynamicObject, WaitError> {
        let target = WaitTarget::new(colony_core::kinds::workflow(), Some(namespace), selector).timeout(timeout);
        self.wait_for(&target, &WorkflowFinished, cancel).await
    }

    /// Wait until the API answers a version request. Returns the server version.
    pub async fn wait_for_api(&self, timeout: Duration, cancel: &CancellationToken) -> Result<String, WaitError> {
        const WHAT: &str = "API server";
        let store = &self.store;
        info!(timeout_s = timeout.as_secs(), "waiting for API server");
        poll_until(self.ready_interval, timeout, cancel, || async move {
            match store.server_version().await {
                Ok(v) => Ok(Some(v)),
                Err(e) if e.is_transient() => {
                    not_yet(&e);
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| match e {
            PollError::Timeout => {
                counter!("wait_timeouts", 1u64);
                WaitError::ReadyTimeout { what: WHAT.into(), timeout }
            }
            PollError::Cancelled => WaitError::Cancelled { what: WHAT.into() },
            PollError::Aborted(error) => WaitError::Store { what: WHAT.into(), error },
        })
    }
}

fn not_yet(e: &StoreError) {
    counter!("wait_transient_errors", 1u64);
    warn!(error = %e, "transient error while polling; retrying");
}

fn abort_error(what: String, a: Abort) -> WaitError {
    match a {
        Abort::Store(error) => WaitError::Store { what, error },
        Abort::Readiness(ReadinessError::Failed(reason)) => WaitError::Failed { what, reason },
        Abort::Readiness(ReadinessError::Invalid(reason)) => WaitError::Invalid { what, reason },
    }
}
