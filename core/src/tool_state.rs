//! Per-user widget state: hydration tracker, stopwatch, interval timer.
//!
//! Writes replace the whole object. Whatever the client sends is sanitised
//! field by field; sub-objects it leaves out fall back to defaults, never to
//! the previously stored value. Reads never fail on bad stored data: a blob
//! that does not parse reads back as the defaults. Both directions are total
//! over their input, so the only errors surfaced are database errors.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::clock::{STOPWATCH_MAX_MS, StopwatchState};
use crate::db::Database;
use crate::interval::{BoxingState, DEFAULT_REST_LENGTH, DEFAULT_ROUND_LENGTH, DEFAULT_ROUNDS, Phase};

const HYDRATION_TARGET: (i64, i64) = (500, 5_000);
const HYDRATION_CONSUMED: (i64, i64) = (0, 10_000);
const ROUND_LENGTH: (i64, i64) = (10, 900);
const REST_LENGTH: (i64, i64) = (0, 600);
const ROUNDS: (i64, i64) = (1, 20);
const TIME_LEFT: (i64, i64) = (0, 1_800);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hydration {
    pub target_ml: i64,
    pub consumed_ml: i64,
}

impl Default for Hydration {
    fn default() -> Self {
        Self {
            target_ml: 2_000,
            consumed_ml: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolState {
    pub hydration: Hydration,
    pub stopwatch: StopwatchState,
    pub boxing: BoxingState,
}

/// Round to the nearest integer and clamp. Numeric strings count as numbers;
/// anything else (including NaN) takes `default`.
#[allow(clippy::cast_precision_loss)]
fn clamp_int(value: Option<&Value>, (min, max): (i64, i64), default: i64) -> i64 {
    let number = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(n) if n.is_finite() => {
            let rounded = n.round();
            if rounded <= min as f64 {
                min
            } else if rounded >= max as f64 {
                max
            } else {
                rounded as i64
            }
        }
        _ => default,
    }
}

fn flag(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

fn sanitize_hydration(raw: Option<&Value>) -> Hydration {
    let defaults = Hydration::default();
    let field = |name: &str| raw.and_then(|obj| obj.get(name));
    Hydration {
        target_ml: clamp_int(field("targetMl"), HYDRATION_TARGET, defaults.target_ml),
        consumed_ml: clamp_int(field("consumedMl"), HYDRATION_CONSUMED, defaults.consumed_ml),
    }
}

fn sanitize_stopwatch(raw: Option<&Value>) -> StopwatchState {
    let field = |name: &str| raw.and_then(|obj| obj.get(name));
    StopwatchState {
        elapsed_ms: clamp_int(field("elapsedMs"), (0, STOPWATCH_MAX_MS), 0),
        running: flag(field("running")),
        updated_at: timestamp(field("updatedAt")),
    }
}

fn sanitize_boxing(raw: Option<&Value>) -> BoxingState {
    let field = |name: &str| raw.and_then(|obj| obj.get(name));
    let round_length = clamp_int(field("roundLength"), ROUND_LENGTH, DEFAULT_ROUND_LENGTH);
    let rounds = clamp_int(field("rounds"), ROUNDS, DEFAULT_ROUNDS);
    BoxingState {
        round_length,
        rest_length: clamp_int(field("restLength"), REST_LENGTH, DEFAULT_REST_LENGTH),
        rounds,
        current_round: clamp_int(field("currentRound"), (1, rounds), 1),
        phase: field("phase")
            .and_then(Value::as_str)
            .and_then(Phase::parse)
            .unwrap_or_default(),
        time_left: clamp_int(field("timeLeft"), TIME_LEFT, round_length),
        running: flag(field("running")),
        updated_at: timestamp(field("updatedAt")),
    }
}

impl ToolState {
    /// Coerce arbitrary JSON into a valid state. Non-objects yield defaults.
    /// `updatedAt` values are carried through as parsed; callers decide how
    /// to anchor them.
    #[must_use]
    pub fn sanitize(raw: &Value) -> Self {
        let section = |name: &str| raw.get(name).filter(|v| v.is_object());
        Self {
            hydration: sanitize_hydration(section("hydration")),
            stopwatch: sanitize_stopwatch(section("stopwatch")),
            boxing: sanitize_boxing(section("boxing")),
        }
    }

    /// A client submission: timers that are running are anchored at `now`,
    /// stopped ones carry no anchor.
    #[must_use]
    pub fn from_submission(raw: &Value, now: DateTime<Utc>) -> Self {
        let mut state = Self::sanitize(raw);
        state.stopwatch.updated_at = state.stopwatch.running.then_some(now);
        state.boxing.updated_at = state.boxing.running.then_some(now);
        state
    }

    /// A stored blob: anchors are kept only on running timers.
    #[must_use]
    pub fn from_persisted(raw: &Value) -> Self {
        let mut state = Self::sanitize(raw);
        if !state.stopwatch.running {
            state.stopwatch.updated_at = None;
        }
        if !state.boxing.running {
            state.boxing.updated_at = None;
        }
        state
    }

    /// Fast-forward running timers to `now`. Hydration has no time component.
    #[must_use]
    pub fn project(self, now: DateTime<Utc>) -> Self {
        Self {
            hydration: self.hydration,
            stopwatch: self.stopwatch.project(now),
            boxing: self.boxing.project(now),
        }
    }
}

/// Projected view of the user's tool state. Never persists the projection.
pub fn read_tool_state(db: &Database, user_id: i64, now: DateTime<Utc>) -> Result<ToolState> {
    let Some(raw) = db
        .get_tool_state_json(user_id)
        .context("Failed to load tool state")?
    else {
        return Ok(ToolState::default());
    };
    let state = match serde_json::from_str::<Value>(&raw) {
        Ok(value) => ToolState::from_persisted(&value),
        Err(e) => {
            warn!(user_id, error = %e, "stored tool state is not valid JSON, using defaults");
            ToolState::default()
        }
    };
    Ok(state.project(now))
}

/// Sanitise `payload` and store it as the user's entire tool state.
pub fn write_tool_state(
    db: &Database,
    user_id: i64,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<ToolState> {
    let state = ToolState::from_submission(payload, now);
    let json = serde_json::to_string(&state).context("Failed to serialize tool state")?;
    db.upsert_tool_state(user_id, &json, now)
        .context("Failed to save tool state")?;
    Ok(state)
}
