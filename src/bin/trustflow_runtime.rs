//! Trustflow Runtime
//!
//! Backfills the configured ledger topics from the mirror, keeps them live
//! (push stream when `MIRROR_WS_URL` is set, polling otherwise) and serves
//! the materialized views until CTRL+C.
//!
//! Usage:
//!   cargo run --release --bin trustflow_runtime
//!
//! Environment variables:
//!   TOPIC_CONTACTS / TOPIC_TRUST / TOPIC_RECOGNITION - required topic ids
//!   TOPIC_PROFILE / TOPIC_SIGNAL / TOPIC_SYSTEM - optional topic ids
//!   MIRROR_REST_URL - REST base (default: testnet mirror)
//!   MIRROR_WS_URL - push stream base (default: unset, poll only)
//!   POLL_INTERVAL_MS - inter-poll delay (default: 5000)
//!   RUST_LOG - log filter (default: info)

use dotenv::dotenv;
use log::{error, info, warn};
use std::env;
use tokio::time::{interval, Duration, MissedTickBehavior};
use trustflow::pipeline::{IngestionOrchestrator, PipelineConfig};

const STATUS_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&rust_log))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Trustflow Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env()?;
    info!("✅ Configuration loaded");
    info!("   ├─ Mirror: {}", config.mirror.rest_url);
    info!(
        "   ├─ Stream: {}",
        config.mirror.ws_url.as_deref().unwrap_or("disabled (poll only)")
    );
    info!("   ├─ Backfill limit: {} per topic", config.backfill_limit);
    info!("   └─ Channel buffer: {}", config.channel_buffer);

    let orchestrator = IngestionOrchestrator::from_config(config)?;
    orchestrator.register_cleanup(|| info!("🔌 Releasing mirror connections"));

    if let Err(e) = orchestrator.start().await {
        error!("❌ Failed to start ingestion: {}", e);
        orchestrator.shutdown().await;
        return Err(e.into());
    }

    info!("🔄 Press CTRL+C to shutdown gracefully");

    let mut status_timer = interval(Duration::from_secs(STATUS_INTERVAL_SECS));
    status_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    status_timer.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => {
                        info!("");
                        warn!("⚠️  Received CTRL+C, shutting down...");
                    }
                    Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
                }
                break;
            }
            _ = status_timer.tick() => {
                let health = orchestrator.health().await;
                let summary = orchestrator.summary().await;
                info!(
                    "📊 {:?} | {} events | {} quarantined | {} pending recognitions | last sync {}",
                    health.state,
                    summary.total,
                    summary.quarantined,
                    summary.pending_recognitions,
                    health.last_sync
                );
                for issue in &health.issues {
                    warn!("   ⚠️  {}", issue);
                }
            }
        }
    }

    orchestrator.shutdown().await;
    info!("✅ Trustflow runtime stopped");
    Ok(())
}
