//! The live chart pipeline: lifecycle manager plus the handle the
//! presentation side talks to.

pub mod lifecycle;
pub mod provider;
#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{ErrorLog, PipelineError};
use crate::runtime_config::ChartConfig;
use crate::types::{Selection, SymbolInfo};

pub use lifecycle::{ChartSnapshot, Command, LifecycleManager};
pub use provider::{FeedSink, HistoryProvider, LiveFeed, SubscriptionHandle};

/// Cloneable front end of a running pipeline.
///
/// Reads come from the latest published [`ChartSnapshot`]; writes are
/// commands queued to the pipeline task.
#[derive(Clone)]
pub struct ChartHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<ChartSnapshot>,
    catalog: Arc<Vec<SymbolInfo>>,
}

impl ChartHandle {
    /// Start the pipeline task and issue the initial selection from
    /// `config`. The task stops once every handle is dropped.
    pub fn spawn(
        history: Arc<dyn HistoryProvider>,
        feed: Arc<dyn LiveFeed>,
        config: &ChartConfig,
        error_log: Arc<ErrorLog>,
    ) -> (Self, JoinHandle<()>) {
        let (manager, snapshots) = LifecycleManager::new(history, feed, config.max_bars, error_log);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let handle = Self {
            commands,
            snapshots,
            catalog: Arc::new(config.catalog.clone()),
        };
        let _ = handle
            .commands
            .send(Command::Select(config.default_selection.clone()));
        let task = tokio::spawn(manager.run(command_rx));
        (handle, task)
    }

    /// Latest published view of the series.
    pub fn series(&self) -> ChartSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn selection(&self) -> Option<Selection> {
        self.snapshots.borrow().selection.clone()
    }

    pub fn catalog(&self) -> &[SymbolInfo] {
        &self.catalog
    }

    /// Replace the selection. Unknown symbols are rejected before the
    /// pipeline is touched; the same pair again forces a rebuild.
    pub fn set_selection(&self, selection: Selection) -> Result<(), PipelineError> {
        if !self.catalog.iter().any(|s| s.name == selection.symbol) {
            return Err(PipelineError::InvalidSelection(format!(
                "unknown symbol '{}'",
                selection.symbol
            )));
        }
        self.send(Command::Select(selection))
    }

    /// Rebuild the pipeline for the current selection.
    pub fn refresh(&self) -> Result<(), PipelineError> {
        self.send(Command::Refresh)
    }

    /// A receiver that observes every published snapshot.
    pub fn updates(&self) -> watch::Receiver<ChartSnapshot> {
        self.snapshots.clone()
    }

    /// Invoke `callback` with each newly published snapshot until the
    /// pipeline stops or the returned task is aborted.
    pub fn on_update<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(&ChartSnapshot) + Send + 'static,
    {
        let mut rx = self.snapshots.clone();
        drop(rx.borrow_and_update());
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                callback(&rx.borrow_and_update());
            }
        })
    }

    fn send(&self, command: Command) -> Result<(), PipelineError> {
        self.commands
            .send(command)
            .map_err(|_| PipelineError::ServiceStopped)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::market_data::series::SeriesState;
    use crate::pipeline::testing::{bar, history, ScriptedFeed, ScriptedHistory};
    use crate::types::Timeframe;

    fn spawn_chart() -> (ChartHandle, Arc<ScriptedFeed>) {
        let history = Arc::new(
            ScriptedHistory::new()
                .with(Selection::new("BTCUSDT", Timeframe::M1), history(&[0, 60_000], 1.0))
                .with(Selection::new("ETHUSDT", Timeframe::M1), history(&[0, 60_000], 2.0)),
        );
        let feed = Arc::new(ScriptedFeed::new());
        let (handle, _task) = ChartHandle::spawn(
            history,
            feed.clone(),
            &ChartConfig::default(),
            Arc::new(ErrorLog::new()),
        );
        (handle, feed)
    }

    async fn wait_for(handle: &ChartHandle, pred: impl FnMut(&ChartSnapshot) -> bool) -> ChartSnapshot {
        let mut rx = handle.updates();
        let snap = tokio::time::timeout(Duration::from_secs(1), rx.wait_for(pred))
            .await
            .expect("condition not reached within 1s")
            .expect("pipeline stopped");
        snap.clone()
    }

    #[tokio::test]
    async fn spawn_seeds_default_selection() {
        let (handle, feed) = spawn_chart();
        let snap = wait_for(&handle, |s| s.state == SeriesState::Seeded).await;
        assert_eq!(snap.selection, Some(Selection::default()));
        assert_eq!(snap.bars.len(), 2);
        assert_eq!(feed.subscriptions(), 1);
    }

    #[tokio::test]
    async fn live_bars_reach_the_snapshot() {
        let (handle, feed) = spawn_chart();
        wait_for(&handle, |s| s.subscribed).await;

        feed.sink(0).bar(bar(120_000, 3.0));
        let snap = wait_for(&handle, |s| s.bars.len() == 3).await;
        assert_eq!(snap.state, SeriesState::Live);
        assert_eq!(snap.price().current_price, 3.0);
        assert_eq!(snap.price().prev_price, 1.0);
    }

    #[tokio::test]
    async fn set_selection_switches_pair() {
        let (handle, _feed) = spawn_chart();
        wait_for(&handle, |s| s.subscribed).await;

        handle
            .set_selection(Selection::new("ethusdt", Timeframe::M1))
            .unwrap();
        let snap = wait_for(&handle, |s| {
            s.selection.as_ref().is_some_and(|sel| sel.symbol == "ETHUSDT") && s.state == SeriesState::Seeded
        })
        .await;
        assert!(snap.bars.iter().all(|b| b.close == 2.0));
        assert_eq!(handle.selection().map(|s| s.symbol), Some("ETHUSDT".into()));
    }

    #[tokio::test]
    async fn unknown_symbol_is_rejected() {
        let (handle, _feed) = spawn_chart();
        let err = handle
            .set_selection(Selection::new("DOGEUSDT", Timeframe::M1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSelection(_)));
    }

    #[tokio::test]
    async fn on_update_sees_new_snapshots() {
        let (handle, feed) = spawn_chart();
        wait_for(&handle, |s| s.subscribed).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = handle.on_update(move |snap| {
            let _ = tx.send(snap.bars.len());
        });
        feed.sink(0).bar(bar(120_000, 3.0));

        let len = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 3);
        watcher.abort();
    }
}
