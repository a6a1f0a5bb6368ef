// =============================================================================
// Subscription Lifecycle Manager: one pipeline per selection
// =============================================================================
//
// A single task owns the reconciler and the live subscription handle. Every
// input reaches it over a channel and is handled to completion before the
// next one, so merges never interleave:
//
//   Command::Select ──► teardown ──► spawn history fetch ─┐
//                                                         ▼
//   PipelineMessage::History ──► seed ──► LiveFeed::subscribe(sink)
//                                                         │
//   PipelineMessage::Feed  ◄──────────────────────────────┘
//
// Each selection bumps `generation`. History results and feed events carry the
// generation they were issued under; anything older than the current one is
// dropped as `StaleResultDiscarded`. That covers a fetch for the previous pair
// resolving after the switch, and late events from a torn-down socket.
// =============================================================================

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorLog, ErrorRecord, PipelineError};
use crate::market_data::series::{chart_frame_of, price_of, ChartFrame, MergeOutcome, PriceSnapshot, SeriesState};
use crate::market_data::{Bar, SeriesReconciler};
use crate::pipeline::provider::{FeedSink, HistoryProvider, LiveFeed, SubscriptionHandle};
use crate::types::Selection;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// What a live subscription can report.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Full snapshot of the in-progress bucket.
    Update(Bar),
    /// The connection is gone; no further events follow.
    Interrupted(String),
}

/// Asynchronous results flowing back into the manager.
#[derive(Debug)]
pub enum PipelineMessage {
    History {
        generation: u64,
        selection: Selection,
        result: Result<Vec<Bar>, PipelineError>,
    },
    Feed {
        generation: u64,
        event: FeedEvent,
    },
}

/// Requests from the presentation side.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Replace the selection and rebuild the pipeline, even if unchanged.
    Select(Selection),
    /// Rebuild the pipeline for the current selection.
    Refresh,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read-only view of the pipeline published after every mutation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChartSnapshot {
    /// Increases by one on every publish.
    pub version: u64,
    pub generation: u64,
    pub selection: Option<Selection>,
    pub state: SeriesState,
    pub subscribed: bool,
    pub bars: Vec<Bar>,
    pub last_error: Option<ErrorRecord>,
}

impl ChartSnapshot {
    pub fn price(&self) -> PriceSnapshot {
        price_of(self.bars.iter().rev())
    }

    pub fn chart_frame(&self) -> ChartFrame {
        chart_frame_of(self.bars.iter())
    }
}

// ---------------------------------------------------------------------------
// LifecycleManager
// ---------------------------------------------------------------------------

pub struct LifecycleManager {
    history: Arc<dyn HistoryProvider>,
    feed: Arc<dyn LiveFeed>,
    reconciler: SeriesReconciler,
    selection: Option<Selection>,
    generation: u64,
    subscription: Option<SubscriptionHandle>,
    last_error: Option<ErrorRecord>,
    version: u64,
    error_log: Arc<ErrorLog>,
    inbox_tx: mpsc::UnboundedSender<PipelineMessage>,
    inbox_rx: mpsc::UnboundedReceiver<PipelineMessage>,
    snapshots: watch::Sender<ChartSnapshot>,
}

impl LifecycleManager {
    /// Build an idle manager (no selection yet) and the receiver its
    /// snapshots are published on.
    pub fn new(
        history: Arc<dyn HistoryProvider>,
        feed: Arc<dyn LiveFeed>,
        max_bars: usize,
        error_log: Arc<ErrorLog>,
    ) -> (Self, watch::Receiver<ChartSnapshot>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(ChartSnapshot::default());
        let manager = Self {
            history,
            feed,
            reconciler: SeriesReconciler::new(max_bars),
            selection: None,
            generation: 0,
            subscription: None,
            last_error: None,
            version: 0,
            error_log,
            inbox_tx,
            inbox_rx,
            snapshots,
        };
        (manager, snapshot_rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn reconciler(&self) -> &SeriesReconciler {
        &self.reconciler
    }

    pub fn subscription(&self) -> Option<&SubscriptionHandle> {
        self.subscription.as_ref()
    }

    // ── Selection ───────────────────────────────────────────────────────

    /// Tear the current pipeline down and start a new one for `selection`.
    ///
    /// The old subscription is closed and the series emptied before the new
    /// history request is issued.
    pub fn set_selection(&mut self, selection: Selection) {
        self.generation += 1;
        let generation = self.generation;

        self.close_subscription();
        self.reconciler.reset();
        self.last_error = None;
        self.selection = Some(selection.clone());

        info!(selection = %selection, generation, "rebuilding chart pipeline");
        self.publish();

        let history = Arc::clone(&self.history);
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            // A panicking provider must still answer, or the pair stays Empty
            // with nothing surfaced.
            let result = AssertUnwindSafe(history.fetch_history(selection.timeframe, &selection.symbol))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let cause = panic_message(panic.as_ref());
                    error!(selection = %selection, generation, cause = %cause, "history fetch panicked");
                    Err(PipelineError::DataUnavailable(format!("history fetch panicked: {cause}")))
                });
            // The manager keeps its own sender, so the inbox outlives this task.
            let _ = inbox.send(PipelineMessage::History {
                generation,
                selection,
                result,
            });
        });
    }

    /// Re-run the lifecycle for the current selection.
    pub fn refresh(&mut self) {
        match self.selection.clone() {
            Some(selection) => self.set_selection(selection),
            None => debug!("refresh requested before any selection"),
        }
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::Select(selection) => self.set_selection(selection),
            Command::Refresh => self.refresh(),
        }
    }

    // ── Async results ───────────────────────────────────────────────────

    /// Apply one history result or feed event.
    ///
    /// Returns the error the message surfaced, if any. Stale messages yield
    /// [`PipelineError::StaleResultDiscarded`] and change nothing.
    pub fn handle_message(&mut self, message: PipelineMessage) -> Result<(), PipelineError> {
        match message {
            PipelineMessage::History {
                generation,
                selection,
                result,
            } => {
                self.check_generation(generation)?;
                if self.selection.as_ref() != Some(&selection) {
                    return Err(self.stale(generation));
                }
                self.apply_history(selection, result)
            }
            PipelineMessage::Feed { generation, event } => {
                self.check_generation(generation)?;
                // Events that race an interruption of the same generation.
                if self.subscription.as_ref().map(SubscriptionHandle::generation) != Some(generation) {
                    return Err(self.stale(generation));
                }
                self.apply_feed(event)
            }
        }
    }

    /// Wait for the next asynchronous result and apply it.
    pub async fn step(&mut self) -> Option<Result<(), PipelineError>> {
        let message = self.inbox_rx.recv().await?;
        Some(self.handle_message(message))
    }

    /// Drive the pipeline until every command sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("chart pipeline started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = self.inbox_rx.recv() => {
                    // Errors are already logged and published as state.
                    let _ = self.handle_message(message);
                }
            }
        }
        self.close_subscription();
        info!("chart pipeline stopped");
    }

    fn apply_history(
        &mut self,
        selection: Selection,
        result: Result<Vec<Bar>, PipelineError>,
    ) -> Result<(), PipelineError> {
        let bars = match result {
            Ok(bars) => bars,
            Err(e) => {
                let err = match e {
                    PipelineError::DataUnavailable(_) => e,
                    other => PipelineError::DataUnavailable(other.to_string()),
                };
                warn!(selection = %selection, generation = self.generation, error = %err, "history fetch failed");
                self.reconciler.reset();
                self.record_error(&err);
                self.publish();
                return Err(err);
            }
        };

        let count = bars.len();
        self.reconciler.seed(bars);

        let sink = FeedSink::new(self.generation, self.inbox_tx.clone());
        let handle = self
            .feed
            .subscribe(selection.timeframe, &selection.symbol, sink);
        info!(
            selection = %selection,
            generation = self.generation,
            bars = count,
            subscription = %handle.id(),
            "series seeded, live feed subscribed"
        );
        self.subscription = Some(handle);
        self.publish();
        Ok(())
    }

    fn apply_feed(&mut self, event: FeedEvent) -> Result<(), PipelineError> {
        match event {
            FeedEvent::Update(bar) => {
                let outcome = self.reconciler.apply(bar);
                if outcome.changed() {
                    debug!(?outcome, open_time = bar.open_time, close = bar.close, "bar merged");
                    self.publish();
                } else if outcome == MergeOutcome::NotSeeded {
                    debug!(open_time = bar.open_time, "update before seed dropped");
                } else {
                    debug!(
                        open_time = bar.open_time,
                        last_open_time = ?self.reconciler.last().map(|b| b.open_time),
                        "out-of-order update dropped"
                    );
                }
                Ok(())
            }
            FeedEvent::Interrupted(reason) => {
                self.close_subscription();
                let err = PipelineError::FeedInterrupted(reason);
                warn!(selection = ?self.selection, generation = self.generation, error = %err, "live feed lost");
                self.record_error(&err);
                self.publish();
                Err(err)
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn check_generation(&self, generation: u64) -> Result<(), PipelineError> {
        if generation == self.generation {
            Ok(())
        } else {
            Err(self.stale(generation))
        }
    }

    fn stale(&self, generation: u64) -> PipelineError {
        let err = PipelineError::StaleResultDiscarded {
            generation,
            current: self.generation,
        };
        debug!(error = %err, "dropping message");
        err
    }

    fn close_subscription(&mut self) {
        if let Some(mut handle) = self.subscription.take() {
            handle.unsubscribe();
        }
    }

    fn record_error(&mut self, err: &PipelineError) {
        if err.is_user_visible() {
            self.last_error = Some(self.error_log.push(err));
        }
    }

    /// Build the current read-only view.
    pub fn snapshot(&self) -> ChartSnapshot {
        ChartSnapshot {
            version: self.version,
            generation: self.generation,
            selection: self.selection.clone(),
            state: self.reconciler.state(),
            subscribed: self.subscription.as_ref().is_some_and(SubscriptionHandle::is_active),
            bars: self.reconciler.bars(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&mut self) {
        self.version += 1;
        let snapshot = self.snapshot();
        self.snapshots.send_replace(snapshot);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::pipeline::testing::{bar, history, ScriptedFeed, ScriptedHistory};
    use crate::types::Timeframe;

    fn btc() -> Selection {
        Selection::new("BTCUSDT", Timeframe::M1)
    }

    fn eth() -> Selection {
        Selection::new("ETHUSDT", Timeframe::M1)
    }

    struct Fixture {
        manager: LifecycleManager,
        snapshots: watch::Receiver<ChartSnapshot>,
        history: Arc<ScriptedHistory>,
        feed: Arc<ScriptedFeed>,
        errors: Arc<ErrorLog>,
    }

    fn fixture() -> Fixture {
        let history = Arc::new(
            ScriptedHistory::new()
                .with(btc(), history(&[100, 160], 1.0))
                .with(eth(), history(&[1000, 1060], 2.0)),
        );
        let feed = Arc::new(ScriptedFeed::new());
        let errors = Arc::new(ErrorLog::new());
        let (manager, snapshots) =
            LifecycleManager::new(history.clone(), feed.clone(), 100, errors.clone());
        Fixture {
            manager,
            snapshots,
            history,
            feed,
            errors,
        }
    }

    async fn step(manager: &mut LifecycleManager) -> Result<(), PipelineError> {
        tokio::time::timeout(Duration::from_secs(1), manager.step())
            .await
            .expect("no pipeline message within 1s")
            .expect("inbox closed")
    }

    fn open_times(manager: &LifecycleManager) -> Vec<i64> {
        manager.reconciler().bars().iter().map(|b| b.open_time).collect()
    }

    #[tokio::test]
    async fn selection_seeds_then_subscribes() {
        let mut f = fixture();
        f.manager.set_selection(btc());

        assert_eq!(f.manager.reconciler().state(), SeriesState::Empty);
        assert_eq!(f.feed.subscriptions(), 0);

        step(&mut f.manager).await.unwrap();

        assert_eq!(f.manager.reconciler().state(), SeriesState::Seeded);
        assert_eq!(open_times(&f.manager), vec![100, 160]);
        assert_eq!(f.feed.subscriptions(), 1);
        assert_eq!(f.feed.selection(0), btc());

        let snap = f.snapshots.borrow().clone();
        assert_eq!(snap.state, SeriesState::Seeded);
        assert_eq!(snap.selection, Some(btc()));
        assert!(snap.subscribed);
        assert_eq!(snap.bars.len(), 2);
    }

    #[tokio::test]
    async fn live_updates_follow_merge_rule() {
        let mut f = fixture();
        f.manager.set_selection(btc());
        step(&mut f.manager).await.unwrap();
        let sink = f.feed.sink(0);

        sink.bar(bar(160, 5.0));
        step(&mut f.manager).await.unwrap();
        assert_eq!(open_times(&f.manager), vec![100, 160]);
        assert_eq!(f.manager.reconciler().last().unwrap().close, 5.0);
        assert_eq!(f.manager.reconciler().state(), SeriesState::Live);

        sink.bar(bar(220, 6.0));
        step(&mut f.manager).await.unwrap();
        assert_eq!(open_times(&f.manager), vec![100, 160, 220]);

        let before = f.manager.reconciler().bars();
        let version = f.snapshots.borrow().version;
        sink.bar(bar(40, 7.0));
        step(&mut f.manager).await.unwrap();
        assert_eq!(f.manager.reconciler().bars(), before);
        assert_eq!(f.snapshots.borrow().version, version);
    }

    #[tokio::test]
    async fn selection_change_discards_previous_pair() {
        let mut f = fixture();
        f.manager.set_selection(btc());
        step(&mut f.manager).await.unwrap();
        let btc_sink = f.feed.sink(0);
        btc_sink.bar(bar(220, 9.0));
        step(&mut f.manager).await.unwrap();

        f.manager.set_selection(eth());
        assert_eq!(f.feed.teardowns(), 1);
        assert_eq!(f.manager.reconciler().state(), SeriesState::Empty);
        {
            let snap = f.snapshots.borrow();
            assert_eq!(snap.selection, Some(eth()));
            assert!(snap.bars.is_empty());
            assert!(!snap.subscribed);
        }

        step(&mut f.manager).await.unwrap();
        assert_eq!(open_times(&f.manager), vec![1000, 1060]);
        assert_eq!(f.feed.subscriptions(), 2);
        assert_eq!(f.feed.sink(1).generation(), 2);

        // A late BTCUSDT event after the switch.
        btc_sink.bar(bar(280, 9.0));
        let err = step(&mut f.manager).await.unwrap_err();
        assert_eq!(
            err,
            PipelineError::StaleResultDiscarded {
                generation: 1,
                current: 2
            }
        );
        assert_eq!(open_times(&f.manager), vec![1000, 1060]);
        assert!(f.manager.reconciler().bars().iter().all(|b| b.close == 2.0));
    }

    #[tokio::test]
    async fn failed_fetch_leaves_series_empty_until_retried() {
        let mut f = fixture();
        f.history.fail_next(&btc());
        f.manager.set_selection(btc());

        let err = step(&mut f.manager).await.unwrap_err();
        assert!(matches!(err, PipelineError::DataUnavailable(_)));
        assert_eq!(f.manager.reconciler().state(), SeriesState::Empty);
        assert_eq!(f.feed.subscriptions(), 0);
        {
            let snap = f.snapshots.borrow();
            assert_eq!(snap.last_error.as_ref().map(|e| e.kind), Some(ErrorKind::DataUnavailable));
            assert!(snap.bars.is_empty());
        }
        assert_eq!(f.errors.recent().len(), 1);

        f.manager.set_selection(btc());
        step(&mut f.manager).await.unwrap();
        assert_eq!(f.manager.reconciler().state(), SeriesState::Seeded);
        assert!(f.snapshots.borrow().last_error.is_none());
        assert_eq!(f.feed.subscriptions(), 1);
    }

    struct PanickingHistory;

    #[async_trait::async_trait]
    impl HistoryProvider for PanickingHistory {
        async fn fetch_history(&self, _timeframe: Timeframe, _symbol: &str) -> Result<Vec<Bar>, PipelineError> {
            panic!("provider blew up");
        }
    }

    #[tokio::test]
    async fn panicking_fetch_surfaces_data_unavailable() {
        let feed = Arc::new(ScriptedFeed::new());
        let errors = Arc::new(ErrorLog::new());
        let (mut manager, snapshots) =
            LifecycleManager::new(Arc::new(PanickingHistory), feed.clone(), 100, errors.clone());
        manager.set_selection(btc());

        let err = step(&mut manager).await.unwrap_err();
        match err {
            PipelineError::DataUnavailable(msg) => assert!(msg.contains("provider blew up"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(manager.reconciler().state(), SeriesState::Empty);
        assert_eq!(feed.subscriptions(), 0);
        assert_eq!(snapshots.borrow().last_error.as_ref().map(|e| e.kind), Some(ErrorKind::DataUnavailable));
        assert_eq!(errors.recent().len(), 1);
    }

    #[tokio::test]
    async fn late_history_for_previous_pair_is_discarded() {
        let mut f = fixture();
        let release_btc = f.history.gate(&btc());
        f.manager.set_selection(btc());
        f.manager.set_selection(eth());

        step(&mut f.manager).await.unwrap();
        assert_eq!(open_times(&f.manager), vec![1000, 1060]);

        release_btc.send(()).unwrap();
        let err = step(&mut f.manager).await.unwrap_err();
        assert_eq!(
            err,
            PipelineError::StaleResultDiscarded {
                generation: 1,
                current: 2
            }
        );
        assert_eq!(open_times(&f.manager), vec![1000, 1060]);
        assert_eq!(f.feed.subscriptions(), 1);
        assert_eq!(f.feed.selection(0), eth());
    }

    #[tokio::test]
    async fn reselecting_same_pair_rebuilds_pipeline() {
        let mut f = fixture();
        f.manager.set_selection(btc());
        step(&mut f.manager).await.unwrap();

        f.manager.handle_command(Command::Refresh);
        assert_eq!(f.manager.generation(), 2);
        assert_eq!(f.feed.teardowns(), 1);
        step(&mut f.manager).await.unwrap();

        assert_eq!(f.history.calls(), 2);
        assert_eq!(f.feed.subscriptions(), 2);
        assert_eq!(f.manager.reconciler().state(), SeriesState::Seeded);
    }

    #[tokio::test]
    async fn refresh_without_selection_does_nothing() {
        let mut f = fixture();
        f.manager.refresh();
        assert_eq!(f.manager.generation(), 0);
        assert_eq!(f.history.calls(), 0);
    }

    #[tokio::test]
    async fn feed_interruption_keeps_last_good_series() {
        let mut f = fixture();
        f.manager.set_selection(btc());
        step(&mut f.manager).await.unwrap();
        let sink = f.feed.sink(0);
        sink.bar(bar(160, 5.0));
        step(&mut f.manager).await.unwrap();

        sink.interrupted("socket closed");
        let err = step(&mut f.manager).await.unwrap_err();
        assert_eq!(err, PipelineError::FeedInterrupted("socket closed".into()));
        assert_eq!(f.manager.reconciler().state(), SeriesState::Live);
        assert_eq!(open_times(&f.manager), vec![100, 160]);
        assert!(f.manager.subscription().is_none());
        assert_eq!(f.feed.teardowns(), 1);
        {
            let snap = f.snapshots.borrow();
            assert!(!snap.subscribed);
            assert_eq!(snap.last_error.as_ref().map(|e| e.kind), Some(ErrorKind::FeedInterrupted));
        }

        sink.bar(bar(220, 6.0));
        assert!(matches!(
            step(&mut f.manager).await,
            Err(PipelineError::StaleResultDiscarded { .. })
        ));
        assert_eq!(open_times(&f.manager), vec![100, 160]);

        // Selection changes keep working after the error.
        f.manager.set_selection(btc());
        step(&mut f.manager).await.unwrap();
        assert_eq!(f.feed.subscriptions(), 2);
        assert_eq!(f.feed.teardowns(), 1);
    }

    #[tokio::test]
    async fn snapshot_version_increases_on_every_publish() {
        let mut f = fixture();
        assert_eq!(f.snapshots.borrow().version, 0);
        f.manager.set_selection(btc());
        assert_eq!(f.snapshots.borrow().version, 1);
        step(&mut f.manager).await.unwrap();
        assert_eq!(f.snapshots.borrow().version, 2);
    }
}
