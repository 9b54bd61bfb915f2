mod config;
mod influx;
mod mapper;
mod mqtt;
mod pipeline;
mod state;
mod telemetry;

use crate::config::Config;
use crate::influx::InfluxWriter;
use crate::pipeline::MessagePipeline;
use crate::state::{BridgeStats, ConnectionState};
use anyhow::{Context, Result};
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_bridge=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let stats = Arc::new(BridgeStats::new());
    let writer = Arc::new(InfluxWriter::new(
        &config.influx_url,
        &config.influx_token,
        &config.influx_org,
        &config.influx_bucket,
        config.write_timeout(),
        stats.clone(),
    )?);
    // Setup failures are fatal: the serving loop never starts half-initialized.
    writer
        .connect()
        .await
        .context("initial InfluxDB health check failed")?;
    tracing::info!(url = %config.influx_url, bucket = %config.influx_bucket, "connected to InfluxDB");

    let pipeline = MessagePipeline::new(writer.clone(), stats.clone(), config.device_id.clone());
    let mut mqtt_handle = tokio::spawn(mqtt::run_listener(config, pipeline, stats.clone()));

    tokio::select! {
        res = &mut mqtt_handle => {
            teardown(&stats);
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err),
                Err(err) => Err(err).context("MQTT listener task failed"),
            };
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Stop accepting messages first, then release both sessions. Each step
    // runs even if an earlier one failed.
    mqtt_handle.abort();
    teardown(&stats);
    Ok(())
}

fn teardown(stats: &BridgeStats) {
    stats.broker.set(ConnectionState::Disconnected);
    tracing::info!("closed MQTT session");
    stats.database.set(ConnectionState::Disconnected);
    tracing::info!("closed InfluxDB session");
    tracing::info!("shutdown complete");
}
