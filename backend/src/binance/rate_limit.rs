// =============================================================================
// Request-Weight Tracker: keeps history fetches under Binance's 1m budget
// =============================================================================
//
// Binance allows 6000 request weight per minute per IP and reports the running
// total in the `X-MBX-USED-WEIGHT-1M` response header. The tracker records
// the latest reading and refuses requests that would cross our own hard cap.
// A reading older than one minute belongs to an expired window and counts as
// zero.
// =============================================================================

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 5000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 4000;
/// Length of Binance's weight window.
const WINDOW_MS: i64 = 60_000;

/// Lock-free tracker shared by every clone of the REST client.
pub struct RequestWeightTracker {
    used_weight_1m: AtomicU32,
    updated_at_ms: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WeightSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
}

impl RequestWeightTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            updated_at_ms: AtomicI64::new(0),
        }
    }

    /// Record the weight reported in a response's headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap, now_ms: i64) {
        let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let prev = self.used_weight_1m.swap(weight, Ordering::Relaxed);
        self.updated_at_ms.store(now_ms, Ordering::Relaxed);
        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = weight, "request weight updated from header");
    }

    /// Weight used in the current window, as of `now_ms`.
    pub fn used_weight(&self, now_ms: i64) -> u32 {
        let updated = self.updated_at_ms.load(Ordering::Relaxed);
        if now_ms - updated >= WINDOW_MS {
            0
        } else {
            self.used_weight_1m.load(Ordering::Relaxed)
        }
    }

    /// Return `true` if `weight` more fits under the hard limit.
    pub fn can_send_request(&self, weight: u32, now_ms: i64) -> bool {
        let current = self.used_weight(now_ms);
        let allowed = current.saturating_add(weight) <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked — would exceed rate-limit"
            );
        }
        allowed
    }

    pub fn snapshot(&self, now_ms: i64) -> WeightSnapshot {
        WeightSnapshot {
            used_weight_1m: self.used_weight(now_ms),
            hard_limit: WEIGHT_HARD_LIMIT,
        }
    }
}

impl Default for RequestWeightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestWeightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestWeightTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("updated_at_ms", &self.updated_at_ms.load(Ordering::Relaxed))
            .finish()
    }
}
