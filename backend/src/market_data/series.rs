// =============================================================================
// Series Reconciler: history seed + live revisions, one bar per bucket
// =============================================================================
//
// Owns the in-memory series for exactly one (symbol, timeframe) pair. The
// history fetch replaces the series wholesale; every live update then goes
// through `apply`, which revises the last bucket, appends a new one, or drops
// the update if it is older than the last bucket. The series therefore never
// regresses and never holds two bars with the same `open_time`.
//
// The series is bounded: rollovers past `max_bars` evict the oldest bar.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::bar::Bar;

/// Lifecycle of the series for the current pipeline generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesState {
    /// No data yet (fresh pipeline, or the history fetch failed).
    #[default]
    Empty,
    /// History loaded, no live update applied yet.
    Seeded,
    /// At least one live update applied.
    Live,
}

/// What `apply` did with an incoming update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Same bucket as the last bar: replaced it.
    Revised,
    /// Newer bucket: appended (bucket rollover).
    Appended,
    /// Older than the last bar: dropped.
    Discarded,
    /// The series has not been seeded; nothing to merge into.
    NotSeeded,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Revised | Self::Appended)
    }
}

/// Last and previous close, as shown in the chart's price readout. Missing
/// values read as `0.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PriceSnapshot {
    pub current_price: f64,
    pub prev_price: f64,
}

/// One candlestick as a chart surface plots it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CandlePoint {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// One volume histogram column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumePoint {
    pub time: i64,
    pub value: f64,
}

/// Candles and volume projected onto second-resolution chart time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartFrame {
    pub candles: Vec<CandlePoint>,
    pub volumes: Vec<VolumePoint>,
}

/// State machine owning one pair's bar series.
#[derive(Debug)]
pub struct SeriesReconciler {
    bars: VecDeque<Bar>,
    state: SeriesState,
    max_bars: usize,
}

impl SeriesReconciler {
    /// Create an empty reconciler that retains at most `max_bars` bars.
    pub fn new(max_bars: usize) -> Self {
        let max_bars = max_bars.max(1);
        Self {
            bars: VecDeque::with_capacity(max_bars + 1),
            state: SeriesState::Empty,
            max_bars,
        }
    }

    pub fn state(&self) -> SeriesState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    /// Copy of the series, oldest first.
    pub fn bars(&self) -> Vec<Bar> {
        self.bars.iter().copied().collect()
    }

    /// Replace the series wholesale with a history batch and move to
    /// [`SeriesState::Seeded`].
    ///
    /// `history` must already be sorted ascending by `open_time` without
    /// duplicates; only the newest `max_bars` are kept.
    pub fn seed(&mut self, history: Vec<Bar>) {
        let skip = history.len().saturating_sub(self.max_bars);
        self.bars.clear();
        self.bars.extend(history.into_iter().skip(skip));
        self.state = SeriesState::Seeded;
    }

    /// Merge one live update (a full snapshot of its bucket).
    pub fn apply(&mut self, update: Bar) -> MergeOutcome {
        if self.state == SeriesState::Empty {
            return MergeOutcome::NotSeeded;
        }

        let outcome = match self.bars.back_mut() {
            Some(last) if update.open_time == last.open_time => {
                *last = update;
                MergeOutcome::Revised
            }
            Some(last) if update.open_time < last.open_time => return MergeOutcome::Discarded,
            _ => {
                self.bars.push_back(update);
                while self.bars.len() > self.max_bars {
                    self.bars.pop_front();
                }
                MergeOutcome::Appended
            }
        };

        self.state = SeriesState::Live;
        outcome
    }

    /// Drop all data and return to [`SeriesState::Empty`].
    pub fn reset(&mut self) {
        self.bars.clear();
        self.state = SeriesState::Empty;
    }

    pub fn price(&self) -> PriceSnapshot {
        price_of(self.bars.iter().rev())
    }

    pub fn chart_frame(&self) -> ChartFrame {
        chart_frame_of(self.bars.iter())
    }
}

/// Price readout for bars iterated newest first.
pub fn price_of<'a>(mut newest_first: impl Iterator<Item = &'a Bar>) -> PriceSnapshot {
    let current_price = newest_first.next().map_or(0.0, |b| b.close);
    let prev_price = newest_first.next().map_or(0.0, |b| b.close);
    PriceSnapshot {
        current_price,
        prev_price,
    }
}

/// Chart projection for bars iterated oldest first.
pub fn chart_frame_of<'a>(bars: impl Iterator<Item = &'a Bar>) -> ChartFrame {
    let (candles, volumes) = bars
        .map(|b| {
            let time = b.time_secs();
            (
                CandlePoint {
                    time,
                    open: b.open,
                    high: b.high,
                    low: b.low,
                    close: b.close,
                },
                VolumePoint {
                    time,
                    value: b.volume,
                },
            )
        })
        .unzip();
    ChartFrame { candles, volumes }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
