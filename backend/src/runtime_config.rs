// =============================================================================
// Runtime Configuration: chart pipeline settings
// =============================================================================
//
// Loaded once at startup from JSON. All fields carry `#[serde(default)]` so a
// partial (or empty) file is valid, and a handful of values can be overridden
// from the environment (`.env` is honoured via dotenv in main).
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{default_catalog, Selection, SymbolInfo, Timeframe};

/// Binance caps `/api/v3/klines` at 1000 rows per request.
const MAX_HISTORY_LIMIT: u32 = 1000;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_history_limit() -> u32 {
    500
}

fn default_max_bars() -> usize {
    2000
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_push_interval_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    10
}

// =============================================================================
// ChartConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartConfig {
    /// Pair shown on first mount.
    #[serde(default)]
    pub default_selection: Selection,

    /// Number of bars requested from the history endpoint.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Upper bound on bars kept in memory per series.
    #[serde(default = "default_max_bars")]
    pub max_bars: usize,

    // --- Provider endpoints -------------------------------------------------

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // --- Presentation adapter -----------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// How often WebSocket clients are checked for a newer snapshot.
    #[serde(default = "default_push_interval_ms")]
    pub push_interval_ms: u64,

    /// Selectable instruments (name + icon).
    #[serde(default = "default_catalog")]
    pub catalog: Vec<SymbolInfo>,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            default_selection: Selection::default(),
            history_limit: default_history_limit(),
            max_bars: default_max_bars(),
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            bind_addr: default_bind_addr(),
            push_interval_ms: default_push_interval_ms(),
            catalog: default_catalog(),
        }
    }
}

impl ChartConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read chart config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse chart config from {}", path.display()))?;

        info!(
            path = %path.display(),
            default_selection = %config.default_selection,
            symbols = config.catalog.len(),
            "chart config loaded"
        );

        Ok(config)
    }

    /// Apply `CANDLE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("CANDLE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(url) = var("CANDLE_REST_URL") {
            self.rest_base_url = url;
        }
        if let Some(url) = var("CANDLE_WS_URL") {
            self.ws_base_url = url;
        }
        if let Some(symbol) = var("CANDLE_DEFAULT_SYMBOL") {
            self.default_selection = Selection::new(symbol, self.default_selection.timeframe);
        }
        if let Some(tf) = var("CANDLE_DEFAULT_TIMEFRAME") {
            match tf.parse::<Timeframe>() {
                Ok(tf) => self.default_selection.timeframe = tf,
                Err(e) => warn!(value = %tf, error = %e, "ignoring CANDLE_DEFAULT_TIMEFRAME"),
            }
        }
    }

    /// Check cross-field constraints and clamp `history_limit` into range.
    pub fn validate(&mut self) -> Result<()> {
        // Stream events carry upper-case symbols; hand-written config may not.
        self.default_selection = Selection::new(&self.default_selection.symbol, self.default_selection.timeframe);
        for info in &mut self.catalog {
            info.name = info.name.trim().to_uppercase();
        }
        if self.catalog.is_empty() {
            anyhow::bail!("chart config has an empty symbol catalog");
        }
        let symbol = &self.default_selection.symbol;
        if !self.catalog.iter().any(|s| &s.name == symbol) {
            anyhow::bail!("default symbol {symbol} is not in the catalog");
        }
        let clamped = self.history_limit.clamp(1, MAX_HISTORY_LIMIT);
        if clamped != self.history_limit {
            warn!(requested = self.history_limit, clamped, "history_limit out of range");
            self.history_limit = clamped;
        }
        Ok(())
    }
}
