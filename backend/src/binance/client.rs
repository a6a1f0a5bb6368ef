// =============================================================================
// Binance REST Client: historical klines for the chart seed
// =============================================================================
//
// Only public market-data endpoints are used, so requests are unsigned. Every
// response feeds the shared request-weight tracker, and a request that would
// exceed the weight budget is refused locally instead of being sent.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::binance::rate_limit::RequestWeightTracker;
use crate::error::PipelineError;
use crate::market_data::Bar;
use crate::pipeline::HistoryProvider;
use crate::types::Timeframe;

/// Request weight Binance charges for `/api/v3/klines`.
const KLINES_WEIGHT: u32 = 2;

/// Binance REST API client for public market data.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    history_limit: u32,
    client: reqwest::Client,
    weight: Arc<RequestWeightTracker>,
}

impl BinanceClient {
    /// Create a client against `base_url` (e.g. `https://api.binance.com`)
    /// that seeds charts with `history_limit` bars.
    pub fn new(base_url: impl Into<String>, history_limit: u32, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, history_limit, "BinanceClient initialised");

        Ok(Self {
            base_url,
            history_limit,
            client,
            weight: Arc::new(RequestWeightTracker::new()),
        })
    }

    pub fn weight_tracker(&self) -> Arc<RequestWeightTracker> {
        Arc::clone(&self.weight)
    }

    /// GET /api/v3/klines (public: no signature required).
    ///
    /// Returns the bars sorted ascending by open time, one per bucket.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: Timeframe, limit: u32) -> Result<Vec<Bar>> {
        if !self
            .weight
            .can_send_request(KLINES_WEIGHT, Utc::now().timestamp_millis())
        {
            anyhow::bail!("request weight budget exhausted, klines request not sent");
        }

        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        self.weight
            .update_from_headers(resp.headers(), Utc::now().timestamp_millis());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let bars = parse_klines(&body)?;
        debug!(symbol, %interval, count = bars.len(), "klines fetched");
        Ok(bars)
    }
}

#[async_trait]
impl HistoryProvider for BinanceClient {
    async fn fetch_history(&self, timeframe: Timeframe, symbol: &str) -> Result<Vec<Bar>, PipelineError> {
        self.get_klines(symbol, timeframe, self.history_limit)
            .await
            .map_err(|e| PipelineError::DataUnavailable(format!("{e:#}")))
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("history_limit", &self.history_limit)
            .field("weight", &self.weight)
            .finish()
    }
}

// -------------------------------------------------------------------------
// Response parsing
// -------------------------------------------------------------------------

/// Parse Binance's array-of-arrays klines payload.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ... (ignored)
///
/// Any malformed entry fails the whole batch. The result is sorted by open
/// time; a repeated bucket keeps its last occurrence.
pub fn parse_klines(body: &serde_json::Value) -> Result<Vec<Bar>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut bars = Vec::with_capacity(raw.len());
    for (i, entry) in raw.iter().enumerate() {
        let arr = entry
            .as_array()
            .with_context(|| format!("kline entry {i} is not an array"))?;

        if arr.len() < 6 {
            anyhow::bail!("kline entry {i} has only {} elements", arr.len());
        }

        let open_time = arr[0]
            .as_i64()
            .with_context(|| format!("kline entry {i} has no integer open time"))?;

        bars.push(Bar::new(
            open_time,
            parse_str_f64(&arr[1])?,
            parse_str_f64(&arr[2])?,
            parse_str_f64(&arr[3])?,
            parse_str_f64(&arr[4])?,
            parse_str_f64(&arr[5])?,
        ));
    }

    bars.sort_by_key(|b| b.open_time);
    bars.reverse();
    bars.dedup_by_key(|b| b.open_time);
    bars.reverse();
    Ok(bars)
}

/// Parse a JSON value that may be either a string or a number into a finite
/// `f64`.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    let n = if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))?
    } else if let Some(n) = val.as_f64() {
        n
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    };
    if !n.is_finite() {
        anyhow::bail!("non-finite number: {val}");
    }
    Ok(n)
}
