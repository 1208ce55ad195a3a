//! Streaks, XP, levels and badges.
//!
//! Everything here is derived on demand from raw activity. Nothing is
//! persisted, so a badge disappears again if the data behind it is deleted.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

pub const XP_PER_ANALYSIS: i64 = 10;
pub const XP_PER_PLAN: i64 = 15;
pub const XP_PER_GOAL: i64 = 5;
pub const XP_PER_LEVEL: i64 = 100;

/// UTC calendar day an activity falls on.
#[must_use]
pub fn day_key(ts: DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}

/// Length of the run of consecutive days ending at the most recent day.
///
/// Duplicates and ordering of the input do not matter. The run is counted
/// back from the latest day present, not from today.
pub fn calculate_streak<I>(days: I) -> i64
where
    I: IntoIterator<Item = NaiveDate>,
{
    let unique: BTreeSet<NaiveDate> = days.into_iter().collect();
    let mut descending = unique.into_iter().rev();
    let Some(mut previous) = descending.next() else {
        return 0;
    };
    let mut streak = 1;
    for day in descending {
        if previous - day != Duration::days(1) {
            break;
        }
        streak += 1;
        previous = day;
    }
    streak
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    TotalAnalyses,
    StreakDays,
    WeeklyAnalyses,
    PlansCreated,
    GoalsCompleted,
    Xp,
}

struct BadgeRule {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    metric: Metric,
    threshold: i64,
}

const BADGE_RULES: &[BadgeRule] = &[
    BadgeRule {
        id: "first-analysis",
        name: "First Analysis",
        description: "Analyse your first meal",
        metric: Metric::TotalAnalyses,
        threshold: 1,
    },
    BadgeRule {
        id: "form-apprentice",
        name: "Form Apprentice",
        description: "Complete 5 analyses",
        metric: Metric::TotalAnalyses,
        threshold: 5,
    },
    BadgeRule {
        id: "form-elite",
        name: "Form Elite",
        description: "Complete 20 analyses",
        metric: Metric::TotalAnalyses,
        threshold: 20,
    },
    BadgeRule {
        id: "consistency",
        name: "Consistency",
        description: "Stay active 3 days in a row",
        metric: Metric::StreakDays,
        threshold: 3,
    },
    BadgeRule {
        id: "streak-warrior",
        name: "Streak Warrior",
        description: "Stay active 7 days in a row",
        metric: Metric::StreakDays,
        threshold: 7,
    },
    BadgeRule {
        id: "weekly-warrior",
        name: "Weekly Warrior",
        description: "Complete 5 analyses in a week",
        metric: Metric::WeeklyAnalyses,
        threshold: 5,
    },
    BadgeRule {
        id: "weekly-legend",
        name: "Weekly Legend",
        description: "Complete 10 analyses in a week",
        metric: Metric::WeeklyAnalyses,
        threshold: 10,
    },
    BadgeRule {
        id: "planner",
        name: "Planner",
        description: "Create your first plan",
        metric: Metric::PlansCreated,
        threshold: 1,
    },
    BadgeRule {
        id: "program-architect",
        name: "Program Architect",
        description: "Create 5 plans",
        metric: Metric::PlansCreated,
        threshold: 5,
    },
    BadgeRule {
        id: "goal-crusher",
        name: "Goal Crusher",
        description: "Complete 3 goals",
        metric: Metric::GoalsCompleted,
        threshold: 3,
    },
    BadgeRule {
        id: "goal-champion",
        name: "Goal Champion",
        description: "Complete 10 goals",
        metric: Metric::GoalsCompleted,
        threshold: 10,
    },
    BadgeRule {
        id: "xp-hustler",
        name: "XP Hustler",
        description: "Earn 500 XP",
        metric: Metric::Xp,
        threshold: 500,
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Badge {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub earned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GamificationSnapshot {
    pub total_analyses: i64,
    pub weekly_analyses: i64,
    pub streak_days: i64,
    pub xp: i64,
    pub level: i64,
    pub next_level_xp: i64,
    pub plans_created: i64,
    pub goals_completed: i64,
    pub last_activity_date: Option<NaiveDate>,
    pub badges: Vec<Badge>,
}

impl GamificationSnapshot {
    /// Derive the snapshot from analysis timestamps and activity counts.
    /// `now` anchors the weekly window (the last 7 calendar days inclusive).
    #[must_use]
    pub fn derive(
        analyses: &[DateTime<Utc>],
        plans_created: i64,
        goals_completed: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let total_analyses = i64::try_from(analyses.len()).unwrap_or(i64::MAX);
        let week_start = now - Duration::days(6);
        let weekly_analyses = i64::try_from(analyses.iter().filter(|ts| **ts >= week_start).count())
            .unwrap_or(i64::MAX);
        let streak_days = calculate_streak(analyses.iter().copied().map(day_key));
        let last_activity_date = analyses.iter().copied().map(day_key).max();

        let xp = total_analyses * XP_PER_ANALYSIS
            + plans_created * XP_PER_PLAN
            + goals_completed * XP_PER_GOAL;
        let level = (xp / XP_PER_LEVEL + 1).max(1);

        let mut snapshot = Self {
            total_analyses,
            weekly_analyses,
            streak_days,
            xp,
            level,
            next_level_xp: level * XP_PER_LEVEL,
            plans_created,
            goals_completed,
            last_activity_date,
            badges: Vec::with_capacity(BADGE_RULES.len()),
        };
        snapshot.badges = BADGE_RULES
            .iter()
            .map(|rule| Badge {
                id: rule.id,
                name: rule.name,
                description: rule.description,
                earned: snapshot.metric(rule.metric) >= rule.threshold,
            })
            .collect();
        snapshot
    }

    fn metric(&self, metric: Metric) -> i64 {
        match metric {
            Metric::TotalAnalyses => self.total_analyses,
            Metric::StreakDays => self.streak_days,
            Metric::WeeklyAnalyses => self.weekly_analyses,
            Metric::PlansCreated => self.plans_created,
            Metric::GoalsCompleted => self.goals_completed,
            Metric::Xp => self.xp,
        }
    }

    pub fn earned_badges(&self) -> impl Iterator<Item = &Badge> {
        self.badges.iter().filter(|b| b.earned)
    }
}
