use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::coach::{CoachError, CoachModel, Language, MealImage};
use crate::db::Database;
use crate::gamification::GamificationSnapshot;
use crate::log_import::{self, WorkoutImportSummary, WorkoutRow};
use crate::models::{
    AdminStats, Goal, Identity, MealAnalysis, MealScanRecord, NewGoal, NewMealScan,
    NewPerformanceLogEntry, NewPlan, NewUser, PerformanceLogEntry, Plan, ScanQuota, Tier, User,
    validate_email,
};
use crate::tool_state::{self, ToolState};
use crate::weekly::{self, WeeklyReport, WeeklyStats, WeeklyWindows};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Per-scan protein below this counts as a low-protein meal.
    pub protein_target_g: f64,
    /// Monthly meal scans for free-tier users. Pro is unlimited.
    pub free_monthly_scans: i64,
    /// Where scan images are written. `None` keeps no images.
    pub scan_dir: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            protein_target_g: 25.0,
            free_monthly_scans: 30,
            scan_dir: None,
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .fold(String::with_capacity(64), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

/// Session tokens are never stored; only their SHA-256 hex digest is.
#[must_use]
pub fn hash_session_token(token: &str) -> String {
    sha256_hex(token.as_bytes())
}

fn month_start(now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let first = now
        .date_naive()
        .with_day(1)
        .context("Failed to compute start of month")?;
    Ok(first.and_time(NaiveTime::MIN).and_utc())
}

fn image_extension(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/heic" => "heic",
        _ => "jpg",
    }
}

/// Images are content-addressed per user, so re-uploading a photo reuses its file.
fn store_scan_image(dir: &Path, user_id: i64, image: &MealImage) -> Result<String> {
    let digest = sha256_hex(&image.bytes);
    let name = format!("{user_id}-{}.{}", &digest[..16], image_extension(&image.mime_type));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create scan directory: {}", dir.display()))?;
    let path = dir.join(&name);
    std::fs::write(&path, &image.bytes)
        .with_context(|| format!("Failed to write scan image: {}", path.display()))?;
    Ok(name)
}

pub struct CoachService {
    db: Database,
    settings: ServiceSettings,
}

impl CoachService {
    pub fn new(db_path: &Path, settings: ServiceSettings) -> Result<Self> {
        let db = Database::open(db_path)?;
        Ok(Self { db, settings })
    }

    pub fn new_in_memory(settings: ServiceSettings) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self { db, settings })
    }

    #[must_use]
    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    // --- Users & sessions ---

    pub fn create_user(
        &self,
        email: &str,
        display_name: Option<&str>,
        is_admin: bool,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let email = validate_email(email)?;
        if self.db.get_user_by_email(&email)?.is_some() {
            bail!("A user with email '{email}' already exists");
        }
        let user = self.db.insert_user(
            &NewUser {
                email,
                display_name: display_name
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string),
                is_admin,
            },
            now,
        )?;
        info!(user_id = user.id, is_admin, "created user");
        Ok(user)
    }

    pub fn user(&self, id: i64) -> Result<Option<User>> {
        self.db.get_user(id)
    }

    pub fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.db.get_user_by_email(&email.trim().to_lowercase())
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        self.db.list_users()
    }

    /// Returns the fresh user snapshot so callers never patch a cached copy.
    pub fn set_user_tier(&self, id: i64, tier: Tier) -> Result<Option<User>> {
        let user = self.db.set_user_tier(id, tier)?;
        if user.is_some() {
            info!(user_id = id, tier = tier.as_str(), "changed user tier");
        }
        Ok(user)
    }

    pub fn issue_session(&self, user_id: i64, token: &str, now: DateTime<Utc>) -> Result<()> {
        if self.db.get_user(user_id)?.is_none() {
            bail!("User {user_id} not found");
        }
        self.db
            .insert_session(&hash_session_token(token), user_id, now)
            .context("Failed to store session")
    }

    pub fn authenticate(&self, token: &str) -> Result<Option<Identity>> {
        Ok(self
            .db
            .session_user_id(&hash_session_token(token))?
            .map(|user_id| Identity { user_id }))
    }

    pub fn revoke_session(&self, token: &str) -> Result<bool> {
        self.db.delete_session(&hash_session_token(token))
    }

    pub fn revoke_all_sessions(&self, user_id: i64) -> Result<usize> {
        self.db.delete_sessions_for_user(user_id)
    }

    // --- Tool state ---

    pub fn tool_state(&self, user_id: i64, now: DateTime<Utc>) -> Result<ToolState> {
        tool_state::read_tool_state(&self.db, user_id, now)
    }

    pub fn save_tool_state(&self, user_id: i64, payload: &Value, now: DateTime<Utc>) -> Result<ToolState> {
        tool_state::write_tool_state(&self.db, user_id, payload, now)
    }

    pub fn reset_tool_state(&self, user_id: i64) -> Result<bool> {
        self.db.delete_tool_state(user_id)
    }

    pub fn reset_all_tool_states(&self) -> Result<usize> {
        let removed = self.db.delete_all_tool_states()?;
        info!(removed, "reset all tool states");
        Ok(removed)
    }

    // --- Derived metrics ---

    pub fn gamification(&self, user_id: i64, now: DateTime<Utc>) -> Result<GamificationSnapshot> {
        let analyses = self.db.meal_scan_timestamps(user_id)?;
        let plans = self.db.count_plans(user_id)?;
        let goals = self.db.count_completed_goals(user_id)?;
        Ok(GamificationSnapshot::derive(&analyses, plans, goals, now))
    }

    pub fn weekly_stats(&self, user_id: i64, now: DateTime<Utc>) -> Result<WeeklyStats> {
        let windows = WeeklyWindows::ending(now);
        let logs = self
            .db
            .performance_entries_between(user_id, windows.previous_start, now)?;
        let scans = self
            .db
            .meal_scans_between(user_id, windows.current_start, now)?;
        debug!(
            user_id,
            logs = logs.len(),
            scans = scans.len(),
            "aggregating weekly stats"
        );
        Ok(weekly::aggregate(
            &windows,
            &logs,
            &scans,
            self.settings.protein_target_g,
        ))
    }

    // --- Meal scans ---

    /// Scans used this calendar month (UTC) against the user's tier allowance.
    pub fn scan_quota(&self, user_id: i64, now: DateTime<Utc>) -> Result<ScanQuota> {
        let user = self
            .db
            .get_user(user_id)?
            .with_context(|| format!("User {user_id} not found"))?;
        let used = self.db.count_meal_scans_since(user_id, month_start(now)?)?;
        let limit = match user.tier {
            Tier::Free => Some(self.settings.free_monthly_scans),
            Tier::Pro => None,
        };
        Ok(ScanQuota { used, limit })
    }

    /// Persist a completed analysis, writing the image under the scan dir if
    /// one is configured.
    pub fn record_meal_scan(
        &self,
        user_id: i64,
        image: &MealImage,
        result: MealAnalysis,
        user_notes: Option<&str>,
        language: Language,
        now: DateTime<Utc>,
    ) -> Result<MealScanRecord> {
        let image_ref = match &self.settings.scan_dir {
            Some(dir) => Some(store_scan_image(dir, user_id, image)?),
            None => None,
        };
        let record = self.db.insert_meal_scan(
            user_id,
            &NewMealScan {
                result,
                image_ref,
                user_notes: user_notes
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string),
                language: language.code().to_string(),
            },
            now,
        )?;
        info!(user_id, scan_id = record.id, "recorded meal scan");
        Ok(record)
    }

    pub fn list_meal_scans(&self, user_id: i64) -> Result<Vec<MealScanRecord>> {
        self.db.list_meal_scans(user_id)
    }

    /// Delete a scan and its stored image. A missing image file is only logged.
    pub fn delete_meal_scan(&self, user_id: i64, id: i64) -> Result<bool> {
        let Some(scan) = self.db.get_meal_scan(user_id, id)? else {
            return Ok(false);
        };
        let deleted = self.db.delete_meal_scan(user_id, id)?;
        if let (Some(dir), Some(image_ref)) = (&self.settings.scan_dir, &scan.image_ref) {
            // Identical photos share a file; keep it while another scan refers to it.
            let still_used = self
                .db
                .list_meal_scans(user_id)?
                .iter()
                .any(|s| s.image_ref.as_deref() == Some(image_ref.as_str()));
            if !still_used {
                if let Err(e) = std::fs::remove_file(dir.join(image_ref)) {
                    warn!(scan_id = id, error = %e, "could not remove scan image");
                }
            }
        }
        Ok(deleted)
    }

    // --- Plans ---

    pub fn create_plan(&self, user_id: i64, plan: &NewPlan, now: DateTime<Utc>) -> Result<Plan> {
        plan.validate()?;
        self.db.insert_plan(user_id, plan, now)
    }

    pub fn get_plan(&self, user_id: i64, id: i64) -> Result<Option<Plan>> {
        self.db.get_plan(user_id, id)
    }

    pub fn list_plans(&self, user_id: i64) -> Result<Vec<Plan>> {
        self.db.list_plans(user_id)
    }

    pub fn delete_plan(&self, user_id: i64, id: i64) -> Result<bool> {
        self.db.delete_plan(user_id, id)
    }

    // --- Goals ---

    pub fn create_goal(&self, user_id: i64, goal: &NewGoal, now: DateTime<Utc>) -> Result<Goal> {
        goal.validate()?;
        self.db.insert_goal(user_id, goal, now)
    }

    pub fn list_goals(&self, user_id: i64) -> Result<Vec<Goal>> {
        self.db.list_goals(user_id)
    }

    pub fn set_goal_completed(
        &self,
        user_id: i64,
        id: i64,
        completed: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Goal>> {
        self.db.set_goal_completed(user_id, id, completed, now)
    }

    pub fn delete_goal(&self, user_id: i64, id: i64) -> Result<bool> {
        self.db.delete_goal(user_id, id)
    }

    // --- Performance log ---

    pub fn log_performance(
        &self,
        user_id: i64,
        entry: &NewPerformanceLogEntry,
        now: DateTime<Utc>,
    ) -> Result<PerformanceLogEntry> {
        entry.validate()?;
        self.db.insert_performance_entry(user_id, entry, now)
    }

    pub fn list_performance(
        &self,
        user_id: i64,
        since_days: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PerformanceLogEntry>> {
        let since = since_days.map(|days| now - Duration::days(days));
        self.db.list_performance_entries(user_id, since)
    }

    pub fn delete_performance(&self, user_id: i64, id: i64) -> Result<bool> {
        self.db.delete_performance_entry(user_id, id)
    }

    // --- Import ---

    pub fn import_workout_csv(
        &self,
        user_id: i64,
        csv_data: &str,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkoutImportSummary> {
        let rows = log_import::parse_workout_csv(csv_data.as_bytes())?;
        self.import_workout_rows(user_id, &rows, dry_run, now)
    }

    /// Import rows that were already parsed, e.g. by a caller that reports
    /// parse failures separately from storage failures.
    pub fn import_workout_rows(
        &self,
        user_id: i64,
        rows: &[WorkoutRow],
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkoutImportSummary> {
        let summary = log_import::import_workout_rows(&self.db, user_id, rows, dry_run, now)?;
        info!(
            user_id,
            imported = summary.entries_imported,
            rejected = summary.rows_rejected,
            dry_run,
            "imported workout log"
        );
        Ok(summary)
    }

    // --- Admin ---

    pub fn admin_stats(&self) -> Result<AdminStats> {
        self.db.admin_stats()
    }
}

/// Hand the stats to the coach for a written summary. Any collaborator
/// failure fails the whole report.
pub async fn weekly_report(
    coach: &dyn CoachModel,
    stats: WeeklyStats,
    language: Language,
) -> Result<WeeklyReport, CoachError> {
    let summary = coach.summarize_week(&stats, language).await?;
    Ok(WeeklyReport { summary, stats })
}
