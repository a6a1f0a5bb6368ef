// =============================================================================
// Live Feed Subscriber: Binance kline WebSocket, one pair per connection
// =============================================================================
//
// Each subscription is a spawned task reading
// `{ws_base_url}/ws/{symbol}@kline_{interval}` and pushing every bucket
// snapshot into its `FeedSink`. Unsubscribing aborts the task, which drops
// the socket. The task never reconnects: when the socket fails or ends it
// reports `interrupted` once and exits.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::binance::client::parse_str_f64;
use crate::market_data::Bar;
use crate::pipeline::{FeedSink, LiveFeed, SubscriptionHandle};
use crate::types::{Selection, Timeframe};

/// Opens one Binance kline stream per subscription.
#[derive(Debug, Clone)]
pub struct BinanceKlineFeed {
    ws_base_url: String,
}

impl BinanceKlineFeed {
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl LiveFeed for BinanceKlineFeed {
    fn subscribe(&self, timeframe: Timeframe, symbol: &str, sink: FeedSink) -> SubscriptionHandle {
        let selection = Selection::new(symbol, timeframe);
        let url = kline_stream_url(&self.ws_base_url, &selection);
        let generation = sink.generation();

        let task = tokio::spawn(run_kline_stream(url, selection.clone(), sink));
        SubscriptionHandle::new(selection, generation, move || task.abort())
    }
}

/// Stream address for a pair, e.g.
/// `wss://stream.binance.com:9443/ws/btcusdt@kline_1m`.
pub fn kline_stream_url(ws_base_url: &str, selection: &Selection) -> String {
    format!(
        "{}/ws/{}@kline_{}",
        ws_base_url,
        selection.symbol.to_lowercase(),
        selection.timeframe
    )
}

async fn run_kline_stream(url: String, selection: Selection, sink: FeedSink) {
    let outcome = pump_kline_stream(&url, &selection, &sink).await;
    if sink.is_closed() {
        debug!(selection = %selection, "pipeline gone, kline stream exits quietly");
        return;
    }
    let reason = match outcome {
        Ok(()) => {
            warn!(selection = %selection, "kline WebSocket stream ended");
            "kline stream ended".to_string()
        }
        Err(e) => {
            error!(selection = %selection, error = %e, "kline WebSocket error");
            format!("{e:#}")
        }
    };
    sink.interrupted(reason);
}

/// Connect and forward bucket snapshots until the socket closes or errors.
async fn pump_kline_stream(url: &str, selection: &Selection, sink: &FeedSink) -> Result<()> {
    info!(url = %url, selection = %selection, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(selection = %selection, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        match msg.context("kline WebSocket read error")? {
            Message::Text(text) => match parse_kline_event(&text) {
                Ok(Some((symbol, bar))) if symbol == selection.symbol => {
                    debug!(selection = %selection, open_time = bar.open_time, close = bar.close, "kline update");
                    if !sink.bar(bar) {
                        // Pipeline gone; nobody is listening any more.
                        return Ok(());
                    }
                }
                Ok(Some((symbol, _))) => {
                    debug!(expected = %selection.symbol, got = %symbol, "kline for another symbol ignored");
                }
                Ok(None) => debug!("non-kline message ignored"),
                Err(e) => warn!(error = %e, "failed to parse kline message"),
            },
            Message::Close(frame) => {
                info!(selection = %selection, frame = ?frame, "kline WebSocket closed by server");
                return Ok(());
            }
            // Ping/Pong/Binary/Frame: tungstenite queues pong replies itself.
            _ => {}
        }
    }
    Ok(())
}

/// Parse a kline event into `(symbol, bar)`.
///
/// Accepts both the single-stream payload and the combined-stream envelope:
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": 1700000000000, "o": "37000.00", ... } }
/// { "stream": "btcusdt@kline_1m", "data": { "e": "kline", "s": "BTCUSDT", "k": { ... } } }
/// ```
/// Returns `Ok(None)` for messages that carry no candle.
pub fn parse_kline_event(text: &str) -> Result<Option<(String, Bar)>> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = root.get("data").unwrap_or(&root);
    let Some(k) = data.get("k") else {
        return Ok(None);
    };

    let symbol = data["s"]
        .as_str()
        .or_else(|| k["s"].as_str())
        .context("missing field s")?
        .to_uppercase();

    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let bar = Bar::new(
        open_time,
        parse_str_f64(&k["o"]).context("field k.o")?,
        parse_str_f64(&k["h"]).context("field k.h")?,
        parse_str_f64(&k["l"]).context("field k.l")?,
        parse_str_f64(&k["c"]).context("field k.c")?,
        parse_str_f64(&k["v"]).context("field k.v")?,
    );

    Ok(Some((symbol, bar)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
