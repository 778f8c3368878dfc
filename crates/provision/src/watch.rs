//! Hardware discovery watch.
//!
//! A background task follows hardware creations in one namespace. For every
//! creation that correlates with the watched host it labels the host's
//! credential record with the hardware id, then offers the record on a
//! single-slot channel. The slot holds at most one undelivered record; later
//! creations are dropped while it is full. Watch failures go to a separate
//! single-slot error channel. The task runs until the watch is stopped,
//! dropped, or its parent token is cancelled.

use std::sync::Arc;

use colony_apply::{retry_while, RetryPolicy};
use colony_core::{host_token, kinds, labels, ResourceEndpoint, StoreError};
use colony_kubehub::{creations, DiscoveryMapper, ResourceStore, WatchEvent};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::core::DynamicObject;
use kube::ResourceExt;
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchFailure {
    #[error("watch failed: {0}")]
    Watch(StoreError),
    #[error("watch stream ended")]
    Closed,
    #[error("labelling credential record: {0}")]
    Label(StoreError),
    #[error("cancelled before the initial list arrived")]
    Cancelled,
}

/// Where to look and whom to label.
#[derive(Debug, Clone)]
pub struct WatchScope {
    pub host: String,
    pub namespace: String,
    pub retry: RetryPolicy,
}

impl WatchScope {
    pub fn new(host: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { host: host.into(), namespace: namespace.into(), retry: RetryPolicy::default() }
    }
}

pub struct HardwareWatch {
    delivered: mpsc::Receiver<DynamicObject>,
    failures: mpsc::Receiver<WatchFailure>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HardwareWatch {
    /// Subscribe and return once the initial list has been received, so any
    /// hardware created after this returns is seen as a creation. Cancelling
    /// `parent` while subscribing yields [`WatchFailure::Cancelled`].
    pub async fn start(
        store: Arc<dyn ResourceStore>,
        mapper: &DiscoveryMapper,
        scope: WatchScope,
        parent: &CancellationToken,
    ) -> Result<Self, WatchFailure> {
        let (secret_ep, created) = tokio::select! {
            biased;
            _ = parent.cancelled() => {
                debug!(host = %scope.host, "hardware watch cancelled while subscribing");
                return Err(WatchFailure::Cancelled);
            }
            subscribed = subscribe(store.as_ref(), mapper, &scope.namespace) => subscribed?,
        };

        let (deliver_tx, delivered) = mpsc::channel(1);
        let (fail_tx, failures) = mpsc::channel(1);
        let cancel = parent.child_token();
        let worker = Worker { store, secret_ep, token: host_token(&scope.host), scope, deliver_tx, fail_tx };
        info!(host = %worker.scope.host, namespace = %worker.scope.namespace, "hardware watch started");
        let task = tokio::spawn(worker.run(created, cancel.clone()));
        Ok(Self { delivered, failures, cancel, task: Some(task) })
    }

    /// Next delivered hardware record; `None` once the watch task has exited.
    pub async fn discovered(&mut self) -> Option<DynamicObject> {
        self.delivered.recv().await
    }

    /// Next watch failure; `None` once the watch task has exited.
    pub async fn failed(&mut self) -> Option<WatchFailure> {
        self.failures.recv().await
    }

    /// Both channels at once, for racing them in one `select!`.
    pub fn receivers(&mut self) -> (&mut mpsc::Receiver<DynamicObject>, &mut mpsc::Receiver<WatchFailure>) {
        (&mut self.delivered, &mut self.failures)
    }

    /// Cancel the background task and wait for it to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn subscribe(
    store: &dyn ResourceStore,
    mapper: &DiscoveryMapper,
    namespace: &str,
) -> Result<(ResourceEndpoint, BoxStream<'static, Result<DynamicObject, StoreError>>), WatchFailure> {
    let hw_ep = mapper.resolve(&kinds::hardware()).await.map_err(WatchFailure::Watch)?;
    let secret_ep = mapper.resolve(&kinds::secret()).await.map_err(WatchFailure::Watch)?;
    let mut events = store.watch(&hw_ep, Some(namespace)).await.map_err(WatchFailure::Watch)?;
    let first = match events.next().await {
        Some(Ok(ev @ WatchEvent::Restarted(_))) => ev,
        Some(Ok(_)) => return Err(WatchFailure::Watch(StoreError::Client("watch did not start with an initial list".into()))),
        Some(Err(e)) => return Err(WatchFailure::Watch(e)),
        None => return Err(WatchFailure::Closed),
    };
    Ok((secret_ep, creations(stream::iter([Ok(first)]).chain(events).boxed())))
}

impl Drop for HardwareWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    store: Arc<dyn ResourceStore>,
    secret_ep: ResourceEndpoint,
    scope: WatchScope,
    token: String,
    deliver_tx: mpsc::Sender<DynamicObject>,
    fail_tx: mpsc::Sender<WatchFailure>,
}

impl Worker {
    async fn run(self, mut created: BoxStream<'static, Result<DynamicObject, StoreError>>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(host = %self.scope.host, "hardware watch cancelled");
                    break;
                }
                next = created.next() => match next {
                    Some(Ok(hw)) => self.on_created(hw).await,
                    Some(Err(e)) if e.is_transient() => {
                        warn!(error = %e, "hardware watch interrupted; resuming");
                    }
                    Some(Err(e)) => self.fail(WatchFailure::Watch(e)),
                    None => {
                        self.fail(WatchFailure::Closed);
                        break;
                    }
                },
            }
        }
    }

    fn correlates(&self, hw: &DynamicObject) -> bool {
        // Untagged records can't be told apart; accept them.
        hw.labels().get(labels::HOST).map_or(true, |t| *t == self.token)
    }

    async fn on_created(&self, hw: DynamicObject) {
        let name = hw.name_any();
        if !self.correlates(&hw) {
            debug!(hardware = %name, host = %self.scope.host, "hardware belongs to another host; ignoring");
            return;
        }
        counter!("hardware_discovered", 1u64);
        info!(hardware = %name, uid = ?hw.uid(), host = %self.scope.host, "hardware created");
        if let Err(e) = self.label_credentials(&name).await {
            warn!(hardware = %name, error = %e, "failed to label credential record");
            self.fail(WatchFailure::Label(e));
            return;
        }
        match self.deliver_tx.try_send(hw) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => debug!(hardware = %name, "delivery slot occupied; dropping"),
            Err(mpsc::error::TrySendError::Closed(_)) => debug!(hardware = %name, "no receiver; dropping"),
        }
    }

    /// Add the hardware-id label to the credential record. Other labels are left alone.
    /// Conflicts and dropped connections are retried within the scope's policy.
    async fn label_credentials(&self, hardware: &str) -> Result<(), StoreError> {
        let store = &self.store;
        let ep = &self.secret_ep;
        let ns = Some(self.scope.namespace.as_str());
        let secret = self.token.as_str();
        let retryable = |e: &StoreError| e.is_conflict() || e.is_transient();
        retry_while(&self.scope.retry, retryable, || async move {
            let mut rec = store.get(ep, ns, secret).await?;
            if rec.labels().get(labels::HARDWARE_ID).map(String::as_str) == Some(hardware) {
                return Ok(());
            }
            if let Some(prev) = rec.labels().get(labels::HARDWARE_ID) {
                warn!(secret, previous = %prev, hardware, "replacing hardware id on credential record");
            }
            rec.labels_mut().insert(labels::HARDWARE_ID.to_string(), hardware.to_string());
            store.replace(ep, ns, &rec).await.map(|_| ())
        })
        .await?;
        info!(secret, hardware, "credential record labelled");
        Ok(())
    }

    fn fail(&self, failure: WatchFailure) {
        if self.fail_tx.try_send(failure).is_err() {
            debug!("failure slot occupied; dropping");
        }
    }
}
