use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Canonical storage form for timestamps: RFC 3339, UTC, millisecond precision.
#[must_use]
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow::anyhow!("Invalid timestamp '{value}': {e}"))?
        .with_timezone(&Utc))
}

// --- Users ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            _ => bail!("Invalid tier '{value}'. Must be one of: free, pro"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    pub display_name: Option<String>,
    pub tier: Tier,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub display_name: Option<String>,
    pub is_admin: bool,
}

/// What a session resolves to. Holds no mutable user attributes; handlers
/// look those up again on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
}

pub fn validate_email(email: &str) -> Result<String> {
    let trimmed = email.trim().to_lowercase();
    let Some((local, domain)) = trimmed.split_once('@') else {
        bail!("Invalid email '{email}'");
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        bail!("Invalid email '{email}'");
    }
    Ok(trimmed)
}

// --- Plans ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    Workout,
    Meal,
}

impl PlanKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workout => "workout",
            Self::Meal => "meal",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "workout" => Ok(Self::Workout),
            "meal" => Ok(Self::Meal),
            _ => bail!("Invalid plan kind '{value}'. Must be one of: workout, meal"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: i64,
    pub kind: PlanKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlan {
    pub kind: PlanKind,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

impl NewPlan {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            bail!("Plan title must not be empty");
        }
        Ok(())
    }
}

// --- Goals ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: i64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_date: Option<NaiveDate>,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGoal {
    pub title: String,
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
}

impl NewGoal {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            bail!("Goal title must not be empty");
        }
        Ok(())
    }
}

// --- Performance log ---

pub const LB_TO_KG: f64 = 0.453_592_37;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    #[default]
    Kg,
    Lb,
}

impl WeightUnit {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kg => "kg",
            Self::Lb => "lb",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "kg" | "kgs" => Ok(Self::Kg),
            "lb" | "lbs" => Ok(Self::Lb),
            _ => bail!("Invalid unit '{value}'. Must be one of: kg, lb"),
        }
    }

    #[must_use]
    pub fn to_kg(self, load: f64) -> f64 {
        match self {
            Self::Kg => load,
            Self::Lb => load * LB_TO_KG,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceLogEntry {
    pub id: i64,
    pub exercise: String,
    pub load: f64,
    pub reps: i64,
    pub unit: WeightUnit,
    pub rpe: Option<f64>,
    pub notes: Option<String>,
    pub performed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PerformanceLogEntry {
    /// Load normalised to kilograms.
    #[must_use]
    pub fn load_kg(&self) -> f64 {
        self.unit.to_kg(self.load)
    }

    /// `load × reps`, in kilograms.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn volume_kg(&self) -> f64 {
        self.load_kg() * self.reps as f64
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPerformanceLogEntry {
    pub exercise: String,
    pub load: f64,
    pub reps: i64,
    #[serde(default)]
    pub unit: WeightUnit,
    #[serde(default)]
    pub rpe: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub performed_at: Option<DateTime<Utc>>,
}

impl NewPerformanceLogEntry {
    pub fn validate(&self) -> Result<()> {
        if self.exercise.trim().is_empty() {
            bail!("Exercise name must not be empty");
        }
        if !self.load.is_finite() || self.load < 0.0 {
            bail!("load must not be negative");
        }
        if self.reps < 0 {
            bail!("reps must not be negative");
        }
        if let Some(rpe) = self.rpe {
            if !(1.0..=10.0).contains(&rpe) {
                bail!("rpe must be between 1 and 10 (got {rpe})");
            }
        }
        Ok(())
    }
}

// --- Meal scans ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Macros {
    #[serde(default)]
    pub protein_grams: f64,
    #[serde(default)]
    pub carbs_grams: f64,
    #[serde(default)]
    pub fat_grams: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingredient {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_grams: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
}

/// Structured result of a meal-photo analysis. Stored verbatim as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealAnalysis {
    pub total_calories: f64,
    #[serde(default)]
    pub macros: Macros,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MealScanRecord {
    pub id: i64,
    pub result: MealAnalysis,
    pub image_ref: Option<String>,
    pub user_notes: Option<String>,
    pub language: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMealScan {
    pub result: MealAnalysis,
    pub image_ref: Option<String>,
    pub user_notes: Option<String>,
    pub language: String,
}

/// Monthly meal-scan allowance for a user. `limit` is `None` for unlimited tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanQuota {
    pub used: i64,
    pub limit: Option<i64>,
}

impl ScanQuota {
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.used >= limit)
    }

    #[must_use]
    pub fn remaining(&self) -> Option<i64> {
        self.limit.map(|limit| (limit - self.used).max(0))
    }
}

// --- Admin ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub users: i64,
    pub pro_users: i64,
    pub plans: i64,
    pub goals: i64,
    pub performance_entries: i64,
    pub meal_scans: i64,
    pub tool_states: i64,
}
