//! Lazy forward-projection of persisted timers.
//!
//! Nothing ticks in memory. A running timer is stored with the instant it
//! was last written (`updated_at`), and every read projects it forward by the
//! wall-clock time elapsed since then. The projection is never written back.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound for a stopwatch reading (10 hours).
pub const STOPWATCH_MAX_MS: i64 = 36_000_000;

/// Milliseconds between `since` and `now`, clamped to zero when the clock
/// went backwards or `since` lies in the future.
#[must_use]
pub fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_milliseconds().max(0)
}

/// Whole seconds between `since` and `now` (floored, never negative).
#[must_use]
pub fn elapsed_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    elapsed_ms(since, now) / 1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopwatchState {
    pub elapsed_ms: i64,
    pub running: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for StopwatchState {
    fn default() -> Self {
        Self {
            elapsed_ms: 0,
            running: false,
            updated_at: None,
        }
    }
}

impl StopwatchState {
    /// Advance a running stopwatch to `now`.
    ///
    /// Stopped stopwatches and running ones without an anchor are returned
    /// unchanged. The projected view is re-anchored at `now` so a client can
    /// keep counting from it without double-counting.
    #[must_use]
    pub fn project(self, now: DateTime<Utc>) -> Self {
        if !self.running {
            return self;
        }
        let Some(since) = self.updated_at else {
            return self;
        };
        let delta = elapsed_ms(since, now);
        if delta == 0 {
            return self;
        }
        Self {
            elapsed_ms: self.elapsed_ms.saturating_add(delta).min(STOPWATCH_MAX_MS),
            running: true,
            updated_at: Some(since + Duration::milliseconds(delta)),
        }
    }
}
