// =============================================================================
// Candle Live: Main Entry Point
// =============================================================================
//
// Starts the chart pipeline on the configured default pair, then serves the
// REST/WebSocket adapter until Ctrl-C.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod error;
mod market_data;
mod pipeline;
mod runtime_config;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::error::ErrorLog;
use crate::market_data::BinanceKlineFeed;
use crate::pipeline::ChartHandle;
use crate::runtime_config::ChartConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candle Live — Starting Up                         ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = ChartConfig::load("chart_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        ChartConfig::default()
    });
    config.apply_env_overrides();
    config.validate().context("invalid chart configuration")?;

    info!(
        selection = %config.default_selection,
        symbols = config.catalog.len(),
        history_limit = config.history_limit,
        max_bars = config.max_bars,
        "Configuration loaded"
    );

    // ── 2. Providers ─────────────────────────────────────────────────────
    let client = BinanceClient::new(
        config.rest_base_url.clone(),
        config.history_limit,
        Duration::from_secs(config.request_timeout_secs),
    )
    .context("failed to build REST client")?;
    let request_weight = client.weight_tracker();
    let feed = BinanceKlineFeed::new(config.ws_base_url.clone());

    // ── 3. Chart pipeline ────────────────────────────────────────────────
    let error_log = Arc::new(ErrorLog::new());
    let (chart, pipeline_task) =
        ChartHandle::spawn(Arc::new(client), Arc::new(feed), &config, error_log.clone());

    let state = Arc::new(AppState::new(
        chart,
        error_log,
        request_weight,
        Duration::from_millis(config.push_interval_ms),
    ));

    // ── 4. API server ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    axum::serve(listener, api::rest::router(state.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("API server failed")?;

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    // Dropping the last handle closes the command channel and stops the
    // pipeline task, which tears down any open subscription. Upgraded
    // WebSocket tasks may still hold a handle, so don't wait forever.
    drop(state);
    match tokio::time::timeout(Duration::from_secs(5), pipeline_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Chart pipeline task panicked"),
        Err(_) => warn!("Chart pipeline still running at exit"),
    }

    info!("Candle Live stopped");
    Ok(())
}
