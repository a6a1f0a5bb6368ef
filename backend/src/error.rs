// =============================================================================
// Pipeline errors and the bounded error log shown to the chart surface
// =============================================================================

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Everything that can go wrong between a selection change and a rendered
/// series. None of these are fatal to the process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// The historical fetch failed or returned unusable data.
    #[error("historical data unavailable: {0}")]
    DataUnavailable(String),

    /// The live stream dropped or could not be opened.
    #[error("live feed interrupted: {0}")]
    FeedInterrupted(String),

    /// A result belonging to a superseded pipeline generation was dropped.
    #[error("stale result discarded (generation {generation}, current {current})")]
    StaleResultDiscarded { generation: u64, current: u64 },

    /// The requested (symbol, timeframe) pair is not offered.
    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    /// The pipeline task is gone.
    #[error("chart pipeline stopped")]
    ServiceStopped,
}

/// Discriminant of [`PipelineError`], serialised into snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    DataUnavailable,
    FeedInterrupted,
    StaleResultDiscarded,
    InvalidSelection,
    ServiceStopped,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DataUnavailable(_) => ErrorKind::DataUnavailable,
            Self::FeedInterrupted(_) => ErrorKind::FeedInterrupted,
            Self::StaleResultDiscarded { .. } => ErrorKind::StaleResultDiscarded,
            Self::InvalidSelection(_) => ErrorKind::InvalidSelection,
            Self::ServiceStopped => ErrorKind::ServiceStopped,
        }
    }

    /// Whether the chart surface should show this error to the user.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::DataUnavailable(_) | Self::FeedInterrupted(_))
    }
}

/// A recorded error event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    /// Human-readable error message.
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

impl From<&PipelineError> for ErrorRecord {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now().to_rfc3339(),
        }
    }
}

/// Ring of the most recent user-visible errors, oldest first.
#[derive(Debug, Default)]
pub struct ErrorLog {
    records: RwLock<VecDeque<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` and return the stored entry. Evicts the oldest entry once
    /// [`MAX_RECENT_ERRORS`] is reached.
    pub fn push(&self, err: &PipelineError) -> ErrorRecord {
        let record = ErrorRecord::from(err);
        let mut records = self.records.write();
        if records.len() >= MAX_RECENT_ERRORS {
            records.pop_front();
        }
        records.push_back(record.clone());
        record
    }

    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.records.read().iter().cloned().collect()
    }
}
