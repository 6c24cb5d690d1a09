//! Minimal embedding example for udmi-core
//!
//! This example drives a gateway and two proxy devices against the
//! in-process broker, playing the controller's side by hand. The engine
//! lifecycle is fully managed by the application.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use udmi_core::engine::endpoint::endpoint_blob;
use udmi_core::model::IOT_ENDPOINT_CONFIG;
use udmi_core::record::MemoryRecorder;
use udmi_core::scan::StaticScanProvider;
use udmi_core::traits::DiscoveredDevice;
use udmi_core::transport::{MemoryBroker, MemoryTransportFactory};
use udmi_core::{
    Collaborators, DeviceConfig, DeviceEngine, EndpointConfiguration, ProviderRegistry, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== Embedded udmi-core Gateway ===\n");

    // Broker and collaborators
    let broker = MemoryBroker::new();
    let registry = Arc::new(ProviderRegistry::new());
    registry.register_transport("memory", Box::new(MemoryTransportFactory::new(broker.clone())));
    registry.register_scan_provider(
        "vendor",
        Arc::new(StaticScanProvider::new(vec![
            DiscoveredDevice::new("0x65").with_ref("temp", json!(21.5)),
            DiscoveredDevice::new("0x66").with_network("lab"),
        ])),
    );
    let recorder = Arc::new(MemoryRecorder::new());
    let collaborators = Collaborators::new(Arc::clone(&registry)).with_recorder(recorder.clone());

    // Gateway for two proxies
    let mut config = DeviceConfig::new("GAT-123", EndpointConfiguration::new("memory", "broker-a"))
        .with_proxies(["AHU-1", "AHU-22"])
        .with_point("filter_alarm", json!(false));
    config.engine.state_throttle_ms = 200;

    println!("1. Creating engine...");
    let (engine, mut event_rx) = DeviceEngine::new(config, collaborators)?;
    let engine = Arc::new(engine);

    let event_listener = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("[Event] {:?}", event);
        }
    });

    println!("2. Starting engine in background...");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let engine_handle = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run_with_shutdown(shutdown_rx).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n3. Controller sends the gateway config (with a discovery scan)...");
    let scan_at = Utc::now() + ChronoDuration::seconds(1);
    broker.send_json(
        "GAT-123",
        "config",
        &json!({
            "version": "1.5.2",
            "timestamp": Utc::now(),
            "system": { "operation": { "mode": "active" }, "min_loglevel": 300 },
            "discovery": { "families": { "vendor": { "generation": scan_at } } },
            "pointset": { "points": { "filter_alarm": { "set_value": true } } }
        }),
    );
    println!("   ...and a config for proxy AHU-1");
    broker.send_json(
        "AHU-1",
        "config",
        &json!({ "version": "1.5.2", "timestamp": Utc::now() }),
    );
    tokio::time::sleep(Duration::from_secs(3)).await;

    println!("\n4. Controller redirects the gateway to broker-b...");
    let blob = endpoint_blob(&EndpointConfiguration::new("memory", "broker-b"), Some("move-1"))?;
    broker.send_json(
        "GAT-123",
        "config",
        &json!({
            "version": "1.5.2",
            "timestamp": Utc::now(),
            "system": { "operation": { "mode": "active" } },
            "blobset": { "blobs": { IOT_ENDPOINT_CONFIG: blob } }
        }),
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("   Connected hosts: {:?}", broker.connected_hosts());

    println!("\n5. Published so far:");
    for message in broker.published() {
        println!(
            "   {:>8} {:>7} {:<16} {}",
            message.hostname, message.device_id, message.topic, message.payload
        );
    }
    println!("   ({} documents recorded)", recorder.records().len());

    println!("\n6. Stopping engine...");
    let _ = shutdown_tx.send(());
    match engine_handle.await {
        Ok(result) => println!("   Engine exited: {:?}", result?),
        Err(e) => println!("   Engine task failed: {}", e),
    }
    let _ = tokio::time::timeout(Duration::from_millis(100), event_listener).await;

    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- Engine lifecycle is fully controlled by application");
    println!("- Proxies share the gateway's connection, including across a redirect");
    println!("- All collaborators are in-process (no daemon, no network)");

    Ok(())
}
