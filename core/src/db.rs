use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{
    AdminStats, Goal, MealAnalysis, MealScanRecord, NewGoal, NewMealScan, NewPerformanceLogEntry,
    NewPlan, NewUser, PerformanceLogEntry, Plan, PlanKind, Tier, User, WeightUnit, format_ts,
};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    #[allow(clippy::too_many_lines)]
    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE,
                    display_name TEXT,
                    tier TEXT NOT NULL DEFAULT 'free',
                    is_admin INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token_hash TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tool_states (
                    user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                    state_json TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS plans (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS goals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    target_date TEXT,
                    completed INTEGER NOT NULL DEFAULT 0,
                    completed_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS performance_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    exercise TEXT NOT NULL,
                    load REAL NOT NULL,
                    reps INTEGER NOT NULL,
                    unit TEXT NOT NULL,
                    rpe REAL,
                    notes TEXT,
                    performed_at TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS meal_scans (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    result_json TEXT NOT NULL,
                    image_ref TEXT,
                    user_notes TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
                CREATE INDEX IF NOT EXISTS idx_plans_user ON plans(user_id);
                CREATE INDEX IF NOT EXISTS idx_goals_user ON goals(user_id);
                CREATE INDEX IF NOT EXISTS idx_performance_user_time ON performance_logs(user_id, performed_at);
                CREATE INDEX IF NOT EXISTS idx_meal_scans_user_time ON meal_scans(user_id, created_at);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            // Scans recorded before languages were tracked were English-only
            self.conn.execute_batch(
                "ALTER TABLE meal_scans ADD COLUMN language TEXT NOT NULL DEFAULT 'en';
                 PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn ts_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
        let raw: String = row.get(idx)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn opt_ts_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = row.get(idx)?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
        })
        .transpose()
    }

    fn text_enum<T>(
        row: &rusqlite::Row,
        idx: usize,
        parse: impl Fn(&str) -> Result<T>,
    ) -> rusqlite::Result<T> {
        let raw: String = row.get(idx)?;
        parse(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    }

    // 0: id, 1: email, 2: display_name, 3: tier, 4: is_admin, 5: created_at
    fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            display_name: row.get(2)?,
            tier: Self::text_enum(row, 3, Tier::parse)?,
            is_admin: row.get(4)?,
            created_at: Self::ts_at(row, 5)?,
        })
    }

    fn plan_from_row(row: &rusqlite::Row) -> rusqlite::Result<Plan> {
        Ok(Plan {
            id: row.get(0)?,
            kind: Self::text_enum(row, 1, PlanKind::parse)?,
            title: row.get(2)?,
            body: row.get(3)?,
            created_at: Self::ts_at(row, 4)?,
        })
    }

    fn goal_from_row(row: &rusqlite::Row) -> rusqlite::Result<Goal> {
        let target_date: Option<String> = row.get(2)?;
        let target_date = target_date
            .map(|d| {
                NaiveDate::parse_from_str(&d, "%Y-%m-%d").map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                })
            })
            .transpose()?;
        Ok(Goal {
            id: row.get(0)?,
            title: row.get(1)?,
            target_date,
            completed: row.get(3)?,
            completed_at: Self::opt_ts_at(row, 4)?,
            created_at: Self::ts_at(row, 5)?,
        })
    }

    fn performance_from_row(row: &rusqlite::Row) -> rusqlite::Result<PerformanceLogEntry> {
        Ok(PerformanceLogEntry {
            id: row.get(0)?,
            exercise: row.get(1)?,
            load: row.get(2)?,
            reps: row.get(3)?,
            unit: Self::text_enum(row, 4, WeightUnit::parse)?,
            rpe: row.get(5)?,
            notes: row.get(6)?,
            performed_at: Self::ts_at(row, 7)?,
            created_at: Self::ts_at(row, 8)?,
        })
    }

    fn meal_scan_from_row(row: &rusqlite::Row) -> rusqlite::Result<MealScanRecord> {
        let raw: String = row.get(1)?;
        let result: MealAnalysis = serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
        Ok(MealScanRecord {
            id: row.get(0)?,
            result,
            image_ref: row.get(2)?,
            user_notes: row.get(3)?,
            language: row.get(4)?,
            created_at: Self::ts_at(row, 5)?,
        })
    }

    // --- Users ---

    pub fn insert_user(&self, user: &NewUser, now: DateTime<Utc>) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (email, display_name, tier, is_admin, created_at)
                 VALUES (?1, ?2, 'free', ?3, ?4)",
                params![user.email, user.display_name, user.is_admin, format_ts(now)],
            )
            .with_context(|| format!("Failed to create user '{}'", user.email))?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, email, display_name, tier, is_admin, created_at FROM users WHERE id = ?1",
                params![id],
                Self::user_from_row,
            )
            .optional()?)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, email, display_name, tier, is_admin, created_at FROM users WHERE email = ?1",
                params![email],
                Self::user_from_row,
            )
            .optional()?)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, display_name, tier, is_admin, created_at FROM users ORDER BY id",
        )?;
        let users = stmt
            .query_map([], Self::user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Returns the updated user, or `None` if no such user exists.
    pub fn set_user_tier(&self, id: i64, tier: Tier) -> Result<Option<User>> {
        let rows = self.conn.execute(
            "UPDATE users SET tier = ?1 WHERE id = ?2",
            params![tier.as_str(), id],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        self.get_user(id)
    }

    // --- Sessions ---

    pub fn insert_session(&self, token_hash: &str, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![token_hash, user_id, format_ts(now)],
        )?;
        Ok(())
    }

    pub fn session_user_id(&self, token_hash: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT user_id FROM sessions WHERE token_hash = ?1",
                params![token_hash],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn delete_session(&self, token_hash: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            params![token_hash],
        )?;
        Ok(rows > 0)
    }

    pub fn delete_sessions_for_user(&self, user_id: i64) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])?)
    }

    // --- Tool state ---

    pub fn get_tool_state_json(&self, user_id: i64) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT state_json FROM tool_states WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Replace the stored blob. Concurrent writers race; the last one wins.
    pub fn upsert_tool_state(&self, user_id: i64, state_json: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tool_states (user_id, state_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
            params![user_id, state_json, format_ts(now)],
        )?;
        Ok(())
    }

    pub fn delete_tool_state(&self, user_id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM tool_states WHERE user_id = ?1", params![user_id])?;
        Ok(rows > 0)
    }

    pub fn delete_all_tool_states(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM tool_states", [])?)
    }

    // --- Plans ---

    pub fn insert_plan(&self, user_id: i64, plan: &NewPlan, now: DateTime<Utc>) -> Result<Plan> {
        self.conn.execute(
            "INSERT INTO plans (user_id, kind, title, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                plan.kind.as_str(),
                plan.title.trim(),
                plan.body,
                format_ts(now)
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_plan(user_id, id)?
            .context("Plan not found after insert")
    }

    pub fn get_plan(&self, user_id: i64, id: i64) -> Result<Option<Plan>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, kind, title, body, created_at FROM plans WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                Self::plan_from_row,
            )
            .optional()?)
    }

    pub fn list_plans(&self, user_id: i64) -> Result<Vec<Plan>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, title, body, created_at FROM plans
             WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let plans = stmt
            .query_map(params![user_id], Self::plan_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(plans)
    }

    pub fn delete_plan(&self, user_id: i64, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM plans WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(rows > 0)
    }

    pub fn count_plans(&self, user_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM plans WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?)
    }

    // --- Goals ---

    pub fn insert_goal(&self, user_id: i64, goal: &NewGoal, now: DateTime<Utc>) -> Result<Goal> {
        let target_date = goal.target_date.map(|d| d.format("%Y-%m-%d").to_string());
        self.conn.execute(
            "INSERT INTO goals (user_id, title, target_date, completed, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![user_id, goal.title.trim(), target_date, format_ts(now)],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_goal(user_id, id)?
            .context("Goal not found after insert")
    }

    pub fn get_goal(&self, user_id: i64, id: i64) -> Result<Option<Goal>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, title, target_date, completed, completed_at, created_at
                 FROM goals WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                Self::goal_from_row,
            )
            .optional()?)
    }

    pub fn list_goals(&self, user_id: i64) -> Result<Vec<Goal>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, target_date, completed, completed_at, created_at
             FROM goals WHERE user_id = ?1 ORDER BY completed, created_at DESC, id DESC",
        )?;
        let goals = stmt
            .query_map(params![user_id], Self::goal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    /// Mark a goal completed (stamping `completed_at`) or reopen it.
    pub fn set_goal_completed(
        &self,
        user_id: i64,
        id: i64,
        completed: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Goal>> {
        let completed_at = completed.then(|| format_ts(now));
        let rows = self.conn.execute(
            "UPDATE goals SET completed = ?1, completed_at = ?2 WHERE id = ?3 AND user_id = ?4",
            params![completed, completed_at, id, user_id],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        self.get_goal(user_id, id)
    }

    pub fn delete_goal(&self, user_id: i64, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM goals WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(rows > 0)
    }

    pub fn count_completed_goals(&self, user_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM goals WHERE user_id = ?1 AND completed = 1",
            params![user_id],
            |row| row.get(0),
        )?)
    }

    // --- Performance log ---

    pub fn insert_performance_entry(
        &self,
        user_id: i64,
        entry: &NewPerformanceLogEntry,
        now: DateTime<Utc>,
    ) -> Result<PerformanceLogEntry> {
        let performed_at = entry.performed_at.unwrap_or(now);
        self.conn.execute(
            "INSERT INTO performance_logs (user_id, exercise, load, reps, unit, rpe, notes, performed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user_id,
                entry.exercise.trim(),
                entry.load,
                entry.reps,
                entry.unit.as_str(),
                entry.rpe,
                entry.notes,
                format_ts(performed_at),
                format_ts(now),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_performance_entry(user_id, id)?
            .context("Performance entry not found after insert")
    }

    pub fn get_performance_entry(&self, user_id: i64, id: i64) -> Result<Option<PerformanceLogEntry>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, exercise, load, reps, unit, rpe, notes, performed_at, created_at
                 FROM performance_logs WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                Self::performance_from_row,
            )
            .optional()?)
    }

    /// Entries newest first, optionally only those performed at or after `since`.
    pub fn list_performance_entries(
        &self,
        user_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PerformanceLogEntry>> {
        let since = since.map_or_else(String::new, format_ts);
        let mut stmt = self.conn.prepare(
            "SELECT id, exercise, load, reps, unit, rpe, notes, performed_at, created_at
             FROM performance_logs
             WHERE user_id = ?1 AND performed_at >= ?2
             ORDER BY performed_at DESC, id DESC",
        )?;
        let entries = stmt
            .query_map(params![user_id, since], Self::performance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Entries with `from <= performed_at <= to`, oldest first.
    pub fn performance_entries_between(
        &self,
        user_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PerformanceLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, exercise, load, reps, unit, rpe, notes, performed_at, created_at
             FROM performance_logs
             WHERE user_id = ?1 AND performed_at >= ?2 AND performed_at <= ?3
             ORDER BY performed_at, id",
        )?;
        let entries = stmt
            .query_map(
                params![user_id, format_ts(from), format_ts(to)],
                Self::performance_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_performance_entry(&self, user_id: i64, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM performance_logs WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(rows > 0)
    }

    // --- Meal scans ---

    pub fn insert_meal_scan(
        &self,
        user_id: i64,
        scan: &NewMealScan,
        now: DateTime<Utc>,
    ) -> Result<MealScanRecord> {
        let result_json =
            serde_json::to_string(&scan.result).context("Failed to serialize meal analysis")?;
        self.conn.execute(
            "INSERT INTO meal_scans (user_id, result_json, image_ref, user_notes, language, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                result_json,
                scan.image_ref,
                scan.user_notes,
                scan.language,
                format_ts(now),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_meal_scan(user_id, id)?
            .context("Meal scan not found after insert")
    }

    pub fn get_meal_scan(&self, user_id: i64, id: i64) -> Result<Option<MealScanRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, result_json, image_ref, user_notes, language, created_at
                 FROM meal_scans WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                Self::meal_scan_from_row,
            )
            .optional()?)
    }

    pub fn list_meal_scans(&self, user_id: i64) -> Result<Vec<MealScanRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, result_json, image_ref, user_notes, language, created_at
             FROM meal_scans WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let scans = stmt
            .query_map(params![user_id], Self::meal_scan_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scans)
    }

    /// Scans with `from <= created_at <= to`, oldest first.
    pub fn meal_scans_between(
        &self,
        user_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MealScanRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, result_json, image_ref, user_notes, language, created_at
             FROM meal_scans
             WHERE user_id = ?1 AND created_at >= ?2 AND created_at <= ?3
             ORDER BY created_at, id",
        )?;
        let scans = stmt
            .query_map(
                params![user_id, format_ts(from), format_ts(to)],
                Self::meal_scan_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scans)
    }

    pub fn count_meal_scans_since(&self, user_id: i64, since: DateTime<Utc>) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM meal_scans WHERE user_id = ?1 AND created_at >= ?2",
            params![user_id, format_ts(since)],
            |row| row.get(0),
        )?)
    }

    /// Creation time of every scan the user has made, newest first.
    pub fn meal_scan_timestamps(&self, user_id: i64) -> Result<Vec<DateTime<Utc>>> {
        let mut stmt = self.conn.prepare(
            "SELECT created_at FROM meal_scans WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let stamps = stmt
            .query_map(params![user_id], |row| Self::ts_at(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stamps)
    }

    pub fn delete_meal_scan(&self, user_id: i64, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM meal_scans WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(rows > 0)
    }

    // --- Admin ---

    pub fn admin_stats(&self) -> Result<AdminStats> {
        Ok(self.conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM users),
                (SELECT COUNT(*) FROM users WHERE tier = 'pro'),
                (SELECT COUNT(*) FROM plans),
                (SELECT COUNT(*) FROM goals),
                (SELECT COUNT(*) FROM performance_logs),
                (SELECT COUNT(*) FROM meal_scans),
                (SELECT COUNT(*) FROM tool_states)",
            [],
            |row| {
                Ok(AdminStats {
                    users: row.get(0)?,
                    pro_users: row.get(1)?,
                    plans: row.get(2)?,
                    goals: row.get(3)?,
                    performance_entries: row.get(4)?,
                    meal_scans: row.get(5)?,
                    tool_states: row.get(6)?,
                })
            },
        )?)
    }
}
