//! Scripted providers for exercising the pipeline without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::PipelineError;
use crate::market_data::Bar;
use crate::pipeline::provider::{FeedSink, HistoryProvider, LiveFeed, SubscriptionHandle};
use crate::types::{Selection, Timeframe};

pub fn bar(open_time: i64, close: f64) -> Bar {
    Bar::new(open_time, close, close + 1.0, close - 1.0, close, 10.0)
}

pub fn history(open_times: &[i64], close: f64) -> Vec<Bar> {
    open_times.iter().map(|&t| bar(t, close)).collect()
}

/// History provider answering from a fixed table. Individual pairs can be
/// made to fail once or to block until released.
#[derive(Default)]
pub struct ScriptedHistory {
    bars: Mutex<HashMap<Selection, Vec<Bar>>>,
    failures: Mutex<HashMap<Selection, usize>>,
    gates: Mutex<HashMap<Selection, oneshot::Receiver<()>>>,
    calls: AtomicUsize,
}

impl ScriptedHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, selection: Selection, bars: Vec<Bar>) -> Self {
        self.bars.lock().insert(selection, bars);
        self
    }

    /// Make the next fetch for `selection` fail with `DataUnavailable`.
    pub fn fail_next(&self, selection: &Selection) {
        *self.failures.lock().entry(selection.clone()).or_default() += 1;
    }

    /// Hold the next fetch for `selection` until the returned sender fires.
    pub fn gate(&self, selection: &Selection) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().insert(selection.clone(), rx);
        tx
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self, selection: &Selection) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(selection) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl HistoryProvider for ScriptedHistory {
    async fn fetch_history(&self, timeframe: Timeframe, symbol: &str) -> Result<Vec<Bar>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let selection = Selection::new(symbol, timeframe);

        let gate = self.gates.lock().remove(&selection);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if self.take_failure(&selection) {
            return Err(PipelineError::DataUnavailable("scripted failure".into()));
        }
        self.bars
            .lock()
            .get(&selection)
            .cloned()
            .ok_or_else(|| PipelineError::DataUnavailable(format!("no history for {selection}")))
    }
}

/// Live feed that hands every sink back to the test instead of opening a
/// socket.
#[derive(Default)]
pub struct ScriptedFeed {
    sinks: Mutex<Vec<(Selection, FeedSink)>>,
    teardowns: Arc<AtomicUsize>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn sink(&self, index: usize) -> FeedSink {
        self.sinks.lock()[index].1.clone()
    }

    pub fn selection(&self, index: usize) -> Selection {
        self.sinks.lock()[index].0.clone()
    }
}

impl LiveFeed for ScriptedFeed {
    fn subscribe(&self, timeframe: Timeframe, symbol: &str, sink: FeedSink) -> SubscriptionHandle {
        let selection = Selection::new(symbol, timeframe);
        let generation = sink.generation();
        self.sinks.lock().push((selection.clone(), sink));
        let teardowns = Arc::clone(&self.teardowns);
        SubscriptionHandle::new(selection, generation, move || {
            teardowns.fetch_add(1, Ordering::SeqCst);
        })
    }
}
