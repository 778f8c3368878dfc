use std::sync::Arc;
use std::time::Duration;

use colony_core::{kinds, ResourceEndpoint};
use colony_kubehub::{DiscoveryMapper, MemoryStore, ResourceStore};
use colony_wait::{Poller, WaitError};
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const NS: &str = "tink-system";

fn deployments() -> ResourceEndpoint {
    ResourceEndpoint::new(&kinds::deployment(), "deployments", true)
}

fn poller(store: Arc<MemoryStore>) -> Poller {
    let mapper = Arc::new(DiscoveryMapper::new(store.clone()));
    Poller::new(store, mapper).with_intervals(Duration::from_millis(50), Duration::from_millis(20))
}

async fn create_scaled_down(store: &MemoryStore, replicas: i32) {
    let obj: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": "tink-server", "labels": {"app": "tink-server"}},
        "spec": {"replicas": replicas, "selector": {"matchLabels": {"app": "tink-server"}}, "template": {}},
        "status": {}
    }))
    .unwrap();
    store.create(&deployments(), Some(NS), &obj).await.unwrap();
}

fn set_status(store: &MemoryStore, status: serde_json::Value) {
    store.mutate(&deployments(), Some(NS), "tink-server", |o| o.data["status"] = status).unwrap();
}

#[tokio::test(start_paused = true)]
async fn deployment_is_found_once_replicas_exist_then_ready_when_all_are() {
    let store = Arc::new(MemoryStore::fleet());
    create_scaled_down(&store, 2).await;

    let controller = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        set_status(&controller, json!({"replicas": 2, "readyReplicas": 1}));
        tokio::time::sleep(Duration::from_millis(200)).await;
        set_status(&controller, json!({"replicas": 2, "readyReplicas": 2}));
    });

    let t0 = tokio::time::Instant::now();
    let obj = poller(store)
        .wait_for_deployment(NS, "app=tink-server", Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(obj.name_any(), "tink-server");
    assert!(t0.elapsed() >= Duration::from_millis(400));
}

#[tokio::test(start_paused = true)]
async fn deployment_without_replicas_never_appears() {
    let store = Arc::new(MemoryStore::fleet());
    create_scaled_down(&store, 1).await;

    let err = poller(store)
        .wait_for_deployment(NS, "app=tink-server", Duration::from_secs(1), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WaitError::AppearTimeout { .. }), "{err}");
}
