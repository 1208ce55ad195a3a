//! Current-vs-previous week aggregation over the performance log and meal scans.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{MealScanRecord, PerformanceLogEntry};

/// The two comparison windows ending at `now`.
///
/// Current is `[now - 6d, now]`; previous is `[now - 13d, now - 7d)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyWindows {
    pub now: DateTime<Utc>,
    pub current_start: DateTime<Utc>,
    pub previous_start: DateTime<Utc>,
    pub previous_end: DateTime<Utc>,
}

impl WeeklyWindows {
    #[must_use]
    pub fn ending(now: DateTime<Utc>) -> Self {
        Self {
            now,
            current_start: now - Duration::days(6),
            previous_start: now - Duration::days(13),
            previous_end: now - Duration::days(7),
        }
    }

    #[must_use]
    pub fn in_current(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.current_start && ts <= self.now
    }

    #[must_use]
    pub fn in_previous(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.previous_start && ts < self.previous_end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyStats {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sessions: i64,
    pub previous_sessions: i64,
    /// Σ load × reps in kg.
    pub current_volume: f64,
    pub previous_volume: f64,
    pub volume_delta: f64,
    pub best_lift_exercise: Option<String>,
    pub best_lift_delta: f64,
    pub meal_scans: i64,
    pub avg_calories: f64,
    pub low_protein_scans: i64,
    pub protein_target_g: f64,
}

/// Stats plus the generated text, as returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct WeeklyReport {
    pub summary: String,
    pub stats: WeeklyStats,
}

fn exercise_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Default)]
struct LiftMax {
    current: Option<(f64, String)>,
    previous: Option<f64>,
}

/// Aggregate `logs` (either window, anything else ignored) and `scans`
/// (current window only, anything else ignored).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn aggregate(
    windows: &WeeklyWindows,
    logs: &[PerformanceLogEntry],
    scans: &[MealScanRecord],
    protein_target_g: f64,
) -> WeeklyStats {
    let mut sessions = 0;
    let mut previous_sessions = 0;
    let mut current_volume = 0.0;
    let mut previous_volume = 0.0;
    let mut lifts: BTreeMap<String, LiftMax> = BTreeMap::new();

    for entry in logs {
        let load = entry.load_kg();
        if windows.in_current(entry.performed_at) {
            sessions += 1;
            current_volume += entry.volume_kg();
            let slot = &mut lifts.entry(exercise_key(&entry.exercise)).or_default().current;
            if slot.as_ref().is_none_or(|(best, _)| load > *best) {
                *slot = Some((load, entry.exercise.trim().to_string()));
            }
        } else if windows.in_previous(entry.performed_at) {
            previous_sessions += 1;
            previous_volume += entry.volume_kg();
            let slot = &mut lifts.entry(exercise_key(&entry.exercise)).or_default().previous;
            if slot.is_none_or(|best| load > best) {
                *slot = Some(load);
            }
        }
    }

    let mut best_lift_exercise = None;
    let mut best_lift_delta = 0.0;
    for lift in lifts.values() {
        let (Some((current, name)), Some(previous)) = (&lift.current, lift.previous) else {
            continue;
        };
        let delta = current - previous;
        if delta > best_lift_delta {
            best_lift_delta = delta;
            best_lift_exercise = Some(name.clone());
        }
    }

    let current_scans: Vec<&MealScanRecord> = scans
        .iter()
        .filter(|s| windows.in_current(s.created_at))
        .collect();
    let avg_calories = if current_scans.is_empty() {
        0.0
    } else {
        current_scans
            .iter()
            .map(|s| s.result.total_calories)
            .sum::<f64>()
            / current_scans.len() as f64
    };
    let low_protein_scans = current_scans
        .iter()
        .filter(|s| s.result.macros.protein_grams < protein_target_g)
        .count();

    WeeklyStats {
        window_start: windows.current_start,
        window_end: windows.now,
        sessions,
        previous_sessions,
        current_volume,
        previous_volume,
        volume_delta: current_volume - previous_volume,
        best_lift_exercise,
        best_lift_delta,
        meal_scans: i64::try_from(current_scans.len()).unwrap_or(i64::MAX),
        avg_calories,
        low_protein_scans: i64::try_from(low_protein_scans).unwrap_or(i64::MAX),
        protein_target_g,
    }
}
