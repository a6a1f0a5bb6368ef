use serde::{Deserialize, Serialize};

/// A single OHLCV bar for one fixed-width time bucket.
///
/// `open_time` is the bucket start in milliseconds since the UNIX epoch and is
/// the bar's identity within a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Bucket start in whole seconds, the unit chart surfaces plot against.
    pub fn time_secs(&self) -> i64 {
        self.open_time.div_euclid(1000)
    }
}
