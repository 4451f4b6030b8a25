use anyhow::Context;
use solar_telemetry::{
    BridgeConfig, DerivedStateEngine, IngestionLoop, Snapshot, SnapshotPublisher,
    SourceCoordinator, StatusRegisterServer, SystemState,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Messages buffered between the source and the ingestion loop
const MESSAGE_QUEUE_DEPTH: usize = 128;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Starting solar telemetry bridge");
    let config = BridgeConfig::from_env().context("Invalid bridge configuration")?;

    let capacity = config.history_capacity;
    let (publisher, snapshots) =
        SnapshotPublisher::new(Snapshot::capture(&SystemState::new(capacity)));
    let engine = DerivedStateEngine::new(config.thresholds, capacity);

    let (update_sender, update_receiver) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
    let mut ingestion =
        IngestionLoop::new(engine, publisher, config.subscription.clone()).spawn(update_receiver);
    let source = SourceCoordinator::start(&config, update_sender);

    if let Some(socket_addr) = config.modbus_listen {
        let register_server = StatusRegisterServer::new(snapshots.clone());
        tokio::spawn(async move {
            if let Err(e) = register_server.serve(socket_addr).await {
                error!("Status register server stopped: {e:#}");
            }
        });
    } else {
        info!("Modbus status export disabled");
    }

    let source_name = source.source_name().to_string();
    let ended = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            None
        }
        result = &mut ingestion => Some(result),
    };

    let result = match ended {
        Some(result) => {
            warn!("{source_name} source ended, shutting down");
            result
        }
        None => {
            info!("Shutdown requested");
            source.shutdown();
            // Drain whatever the source already queued
            ingestion.await
        }
    };
    match result {
        Ok(stats) => info!(
            "Processed {} readings ({} rejected, {} unsubscribed)",
            stats.applied, stats.rejected, stats.unsubscribed
        ),
        Err(e) => error!("Ingestion task failed: {e}"),
    }

    let last = snapshots.current();
    info!(
        "Final state: emergency {:?}, impact {}, maintenance {:?}",
        last.emergency, last.impact, last.maintenance
    );
    Ok(())
}
