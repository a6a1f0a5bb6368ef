// =============================================================================
// Application State: what the HTTP/WS adapter shares across requests
// =============================================================================
//
// The chart pipeline is owned by its own task; handlers only hold a
// `ChartHandle` to read snapshots and queue selection changes. Everything
// here is either immutable after startup or internally synchronised.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::binance::RequestWeightTracker;
use crate::error::ErrorLog;
use crate::pipeline::ChartHandle;

/// Shared state handed to every axum handler via `Arc<AppState>`.
pub struct AppState {
    pub chart: ChartHandle,
    pub error_log: Arc<ErrorLog>,
    pub request_weight: Arc<RequestWeightTracker>,

    /// How often each WebSocket client is checked for a newer snapshot.
    pub push_interval: Duration,

    /// Number of WebSocket clients currently connected.
    pub ws_clients: AtomicUsize,

    /// Instant when the server was started. Used for uptime calculations.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        chart: ChartHandle,
        error_log: Arc<ErrorLog>,
        request_weight: Arc<RequestWeightTracker>,
        push_interval: Duration,
    ) -> Self {
        Self {
            chart,
            error_log,
            request_weight,
            push_interval,
            ws_clients: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn ws_client_connected(&self) -> usize {
        self.ws_clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn ws_client_disconnected(&self) -> usize {
        self.ws_clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    pub fn ws_client_count(&self) -> usize {
        self.ws_clients.load(Ordering::Relaxed)
    }
}
