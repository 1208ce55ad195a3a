//! Round/rest interval timer (boxing timer).
//!
//! ## Phase transitions
//!
//! ```text
//! round (not last) --> rest (restLength)   --> round (roundLength, currentRound + 1)
//! round (last)     --> finished (running = false, timeLeft = 0)
//! ```
//!
//! A zero-length rest is passed through immediately. Reads replay every phase
//! completion that happened since `updated_at` in one go, so the cost is
//! proportional to the number of phases crossed, not to elapsed seconds.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock;

pub const DEFAULT_ROUND_LENGTH: i64 = 180;
pub const DEFAULT_REST_LENGTH: i64 = 60;
pub const DEFAULT_ROUNDS: i64 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Round,
    Rest,
}

impl Phase {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "round" => Some(Self::Round),
            "rest" => Some(Self::Rest),
            _ => None,
        }
    }
}

/// Persisted interval timer. Lengths and `time_left` are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxingState {
    pub round_length: i64,
    pub rest_length: i64,
    pub rounds: i64,
    pub current_round: i64,
    pub phase: Phase,
    pub time_left: i64,
    pub running: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for BoxingState {
    fn default() -> Self {
        Self {
            round_length: DEFAULT_ROUND_LENGTH,
            rest_length: DEFAULT_REST_LENGTH,
            rounds: DEFAULT_ROUNDS,
            current_round: 1,
            phase: Phase::Round,
            time_left: DEFAULT_ROUND_LENGTH,
            running: false,
            updated_at: None,
        }
    }
}

impl BoxingState {
    /// The machine stopped by itself after the last round.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !self.running && self.current_round == self.rounds && self.time_left == 0
    }

    /// Apply a single phase completion.
    pub fn complete_phase(&mut self) {
        match self.phase {
            Phase::Round if self.current_round >= self.rounds => self.finish(),
            Phase::Round => {
                self.phase = Phase::Rest;
                self.time_left = self.rest_length.max(0);
            }
            Phase::Rest if self.current_round < self.rounds => {
                self.phase = Phase::Round;
                self.time_left = self.round_length;
                self.current_round += 1;
            }
            Phase::Rest => self.finish(),
        }
    }

    fn finish(&mut self) {
        self.running = false;
        self.time_left = 0;
        self.current_round = self.rounds;
        self.updated_at = None;
    }

    /// Replay `elapsed_secs` of running time.
    ///
    /// A non-positive delta or a stopped timer leaves the state untouched.
    #[must_use]
    pub fn replay(mut self, elapsed_secs: i64) -> Self {
        if !self.running || elapsed_secs <= 0 {
            return self;
        }
        let mut remaining = elapsed_secs;
        while self.running {
            if remaining < self.time_left {
                self.time_left -= remaining;
                break;
            }
            remaining -= self.time_left;
            self.complete_phase();
            if self.running && self.time_left == 0 {
                self.complete_phase();
            }
        }
        self
    }

    /// Project a running timer to `now`.
    ///
    /// Only whole seconds are consumed; the anchor moves forward by exactly
    /// the consumed amount so the sub-second remainder carries into the next
    /// read.
    #[must_use]
    pub fn project(self, now: DateTime<Utc>) -> Self {
        if !self.running {
            return self;
        }
        let Some(since) = self.updated_at else {
            return self;
        };
        let secs = clock::elapsed_secs(since, now);
        if secs <= 0 {
            return self;
        }
        let mut next = self.replay(secs);
        if next.running {
            next.updated_at = Some(since + Duration::seconds(secs));
        }
        next
    }

    /// Total running seconds from a fresh start to the finished state.
    #[must_use]
    pub fn total_duration_secs(&self) -> i64 {
        self.rounds * self.round_length + (self.rounds - 1).max(0) * self.rest_length
    }
}
