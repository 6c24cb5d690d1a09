//! A device engine running over a spool directory

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use udmi_core::engine::endpoint::endpoint_blob;
use udmi_core::model::IOT_ENDPOINT_CONFIG;
use udmi_core::{
    Collaborators, DeviceConfig, DeviceEngine, EndpointConfiguration, EngineEvent, ExitReason,
    ProviderRegistry,
};
use udmi_transport_spool::{SPOOL_PROTOCOL, SpoolDirectory, SpoolTransportFactory};

fn spool_endpoint(root: &Path) -> EndpointConfiguration {
    EndpointConfiguration::new(SPOOL_PROTOCOL, root.to_string_lossy())
}

fn registry() -> Arc<ProviderRegistry> {
    let registry = Arc::new(ProviderRegistry::new());
    registry.register_transport(
        SPOOL_PROTOCOL,
        Box::new(SpoolTransportFactory::with_interval(Duration::from_millis(10))),
    );
    registry
}

async fn wait_for<F>(events: &mut mpsc::Receiver<EngineEvent>, mut predicate: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}

fn config_document(timestamp: &str) -> serde_json::Value {
    json!({
        "version": "1.5.2",
        "timestamp": timestamp,
        "system": { "operation": { "mode": "active" } }
    })
}

#[tokio::test]
async fn test_config_answered_through_spool() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SpoolDirectory::new(dir.path());
    let config = DeviceConfig::new("AHU-1", spool_endpoint(dir.path()));
    let (engine, mut events) = DeviceEngine::new(config, Collaborators::new(registry())).unwrap();
    let engine = Arc::new(engine);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run_with_shutdown(shutdown_rx).await }
    });
    wait_for(&mut events, |e| matches!(e, EngineEvent::Started { .. })).await;

    let document = config_document("2026-01-01T00:00:00Z");
    spool
        .deliver("AHU-1", "config", &serde_json::to_vec(&document).unwrap())
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, EngineEvent::StatePublished { .. })).await;

    let states = spool.outbox_messages("AHU-1", "state").await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].payload["system"]["last_config"], "2026-01-01T00:00:00Z");
    assert_eq!(states[0].payload["system"]["operation"]["mode"], "active");

    let _ = shutdown_tx.send(());
    assert_eq!(handle.await.unwrap().unwrap(), ExitReason::Shutdown);
}

#[tokio::test]
async fn test_redirect_between_spools() {
    let home = tempfile::tempdir().unwrap();
    let away = tempfile::tempdir().unwrap();
    let config = DeviceConfig::new("GAT-1", spool_endpoint(home.path())).with_proxies(["AHU-1"]);
    let (engine, mut events) = DeviceEngine::new(config, Collaborators::new(registry())).unwrap();
    let engine = Arc::new(engine);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run_with_shutdown(shutdown_rx).await }
    });
    wait_for(&mut events, |e| matches!(e, EngineEvent::Started { .. })).await;

    let blob = endpoint_blob(&spool_endpoint(away.path()), Some("g1")).unwrap();
    let mut document = config_document("2026-01-01T00:00:00Z");
    document["blobset"] = json!({ "blobs": { IOT_ENDPOINT_CONFIG: blob } });
    SpoolDirectory::new(home.path())
        .deliver("GAT-1", "config", &serde_json::to_vec(&document).unwrap())
        .await
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::EndpointRedirected { .. })
    })
    .await;

    // The proxy now listens on the new spool
    let away_spool = SpoolDirectory::new(away.path());
    let proxy_config = config_document("2026-01-02T00:00:00Z");
    away_spool
        .deliver("AHU-1", "config", &serde_json::to_vec(&proxy_config).unwrap())
        .await
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::StatePublished { device_id } if device_id == "AHU-1")
    })
    .await;

    let states = away_spool.outbox_messages("AHU-1", "state").await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].payload["system"]["last_config"], "2026-01-02T00:00:00Z");

    let _ = shutdown_tx.send(());
    assert_eq!(handle.await.unwrap().unwrap(), ExitReason::Shutdown);
}
