//! Edge bridge daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

mod bridge;
mod broker;
mod cluster;
mod config;
mod error;
mod router;
mod state;
#[cfg(test)]
mod testing;
mod types;

use bridge::{Bridge, BridgeSettings};
use broker::MqttBroker;
use cluster::BlueChiClient;
use config::Config;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    let device_id = cfg.resolve_device_id();
    info!(
        "Starting edge bridge for device {} (broker {}:{}, topic base {}, min update interval {:?})",
        device_id,
        cfg.broker_host,
        cfg.broker_port,
        cfg.topic_base,
        cfg.min_update_interval()
    );

    let shutdown = CancellationToken::new();

    // Broker
    let (broker, mut mqtt_handle) = MqttBroker::connect(
        &device_id,
        &cfg.broker_host,
        cfg.broker_port,
        &cfg.broker_user,
        &cfg.broker_password,
        shutdown.child_token(),
    );
    let broker = Arc::new(broker);

    // Cluster manager
    let cluster = match BlueChiClient::connect().await {
        Ok(cluster) => cluster,
        Err(e) => {
            shutdown.cancel();
            return Err(e.into());
        }
    };

    let bridge = Bridge::new(
        Arc::new(cluster),
        broker.clone(),
        BridgeSettings {
            device_id,
            device_type: cfg.device_type.clone(),
            topic_base: cfg.topic_base.clone(),
            min_update_interval: cfg.min_update_interval(),
        },
    );
    info!("Publishing updates to {}", bridge.topics().update);

    // Sync failures
    let mut failures = bridge.failures();
    tokio::spawn(async move {
        let mut count: u64 = 0;
        loop {
            match failures.recv().await {
                Ok(failure) => {
                    count += 1;
                    warn!("Sync failure #{}: {}", count, failure);
                }
                Err(RecvError::Lagged(missed)) => {
                    count += missed;
                    warn!("Missed {} sync failures ({} so far)", missed, count);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Graceful Shutdown
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                on_signal.cancel();
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    });

    let result = bridge.start(shutdown.clone()).await;

    // Let the event loop flush the DISCONNECT before stopping it.
    let flushed = match broker.disconnect().await {
        Ok(()) => timeout(DISCONNECT_TIMEOUT, &mut mqtt_handle).await.ok(),
        Err(e) => {
            warn!("Failed to disconnect from MQTT broker: {}", e);
            None
        }
    };
    shutdown.cancel();
    let joined = match flushed {
        Some(joined) => joined,
        None => mqtt_handle.await,
    };
    if let Err(e) = joined {
        error!("MQTT event loop task failed: {}", e);
    }

    info!("Shutdown complete.");
    result.map_err(Into::into)
}
