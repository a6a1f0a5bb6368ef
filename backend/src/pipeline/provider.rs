//! Seams between the lifecycle manager and the market-data provider.
//!
//! [`HistoryProvider`] is the one-shot historical fetch, [`LiveFeed`] opens a
//! streaming subscription. Both are object-safe so the manager can hold
//! `Arc<dyn ...>` and tests can substitute scripted doubles.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::market_data::Bar;
use crate::pipeline::lifecycle::{FeedEvent, PipelineMessage};
use crate::types::{Selection, Timeframe};

#[async_trait]
pub trait HistoryProvider: Send + Sync + 'static {
    /// The most recent bars for the pair, ascending by `open_time`, no
    /// duplicates. Any failure is reported as
    /// [`PipelineError::DataUnavailable`]; partial batches are never returned.
    async fn fetch_history(&self, timeframe: Timeframe, symbol: &str) -> Result<Vec<Bar>, PipelineError>;
}

pub trait LiveFeed: Send + Sync + 'static {
    /// Open a stream for the pair. Every bucket snapshot is pushed into
    /// `sink` until the returned handle is unsubscribed or the connection
    /// fails, in which case the feed reports it through
    /// [`FeedSink::interrupted`] and stops. The feed never retries on its own.
    fn subscribe(&self, timeframe: Timeframe, symbol: &str, sink: FeedSink) -> SubscriptionHandle;
}

/// Write end of a subscription's event stream, stamped with the pipeline
/// generation that opened it.
#[derive(Debug, Clone)]
pub struct FeedSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PipelineMessage>,
}

impl FeedSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<PipelineMessage>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Push a bucket snapshot. Returns `false` once the pipeline is gone.
    pub fn bar(&self, bar: Bar) -> bool {
        self.send(FeedEvent::Update(bar))
    }

    /// Report that the connection is lost.
    pub fn interrupted(&self, reason: impl Into<String>) -> bool {
        self.send(FeedEvent::Interrupted(reason.into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: FeedEvent) -> bool {
        self.tx
            .send(PipelineMessage::Feed {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

type Teardown = Box<dyn FnOnce() + Send>;

/// One live subscription, tagged with the pair and generation it was opened
/// for. Unsubscribing is idempotent, and dropping the handle unsubscribes.
pub struct SubscriptionHandle {
    id: Uuid,
    selection: Selection,
    generation: u64,
    teardown: Option<Teardown>,
}

impl SubscriptionHandle {
    /// `teardown` runs exactly once, on the first `unsubscribe` (or drop).
    pub fn new(selection: Selection, generation: u64, teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: Uuid::new_v4(),
            selection,
            generation,
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.teardown.is_some()
    }

    /// Terminate the subscription. Returns `true` if this call tore it down,
    /// `false` if it was already closed.
    pub fn unsubscribe(&mut self) -> bool {
        match self.teardown.take() {
            Some(teardown) => {
                teardown();
                debug!(id = %self.id, selection = %self.selection, generation = self.generation, "subscription closed");
                true
            }
            None => false,
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("selection", &self.selection)
            .field("generation", &self.generation)
            .field("active", &self.is_active())
            .finish()
    }
}
