use std::collections::HashSet;
use std::io::Read;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;

use crate::db::Database;
use crate::models::{NewPerformanceLogEntry, WeightUnit};

/// A single set parsed from a workout-log CSV export.
#[derive(Debug, Clone)]
pub struct WorkoutRow {
    pub line: usize,
    pub performed_at: DateTime<Utc>,
    pub exercise: String,
    pub load: f64,
    pub unit: WeightUnit,
    pub reps: i64,
    pub rpe: Option<f64>,
    pub notes: Option<String>,
}

/// Summary of what a workout import would do / did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkoutImportSummary {
    pub rows_parsed: usize,
    pub entries_imported: usize,
    pub rows_rejected: usize,
    pub exercises: usize,
    pub days_spanned: usize,
    pub errors: Vec<String>,
}

/// Parse a set-per-row workout export from any reader.
///
/// Expected header:
/// `Date,Exercise Name,Weight,Weight Unit,Reps,RPE,Notes`
///
/// Only `Date`, `Exercise Name`, `Weight` and `Reps` are required; header
/// matching ignores case and unknown columns are ignored. Rows whose date or
/// numbers do not parse fail the whole parse, with the line number.
pub fn parse_workout_csv<R: Read>(reader: R) -> Result<Vec<WorkoutRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();

    let required = ["Date", "Exercise Name", "Weight", "Reps"];
    for name in &required {
        if !headers.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            bail!("Missing required column: {name}");
        }
    }

    let col =
        |name: &str| -> Option<usize> { headers.iter().position(|h| h.eq_ignore_ascii_case(name)) };

    let idx_date = col("Date").context("Missing 'Date' column")?;
    let idx_exercise = col("Exercise Name").context("Missing 'Exercise Name' column")?;
    let idx_weight = col("Weight").context("Missing 'Weight' column")?;
    let idx_reps = col("Reps").context("Missing 'Reps' column")?;
    let idx_unit = col("Weight Unit");
    let idx_rpe = col("RPE");
    let idx_notes = col("Notes");

    let mut rows = Vec::new();

    for (line_num, result) in rdr.records().enumerate() {
        let line = line_num + 2;
        let record = result.with_context(|| format!("Failed to parse CSV row {line}"))?;

        let field = |idx: Option<usize>| field_at(&record, idx);

        let date = field(Some(idx_date));
        let exercise = field(Some(idx_exercise));
        if date.is_empty() || exercise.is_empty() {
            continue;
        }

        let performed_at =
            parse_performed_at(date).with_context(|| format!("Row {line}: bad date '{date}'"))?;
        let weight = field(Some(idx_weight));
        let load = weight
            .parse::<f64>()
            .with_context(|| format!("Row {line}: bad weight '{weight}'"))?;
        let reps_raw = field(Some(idx_reps));
        let reps = reps_raw
            .parse::<i64>()
            .with_context(|| format!("Row {line}: bad reps '{reps_raw}'"))?;
        let unit = match field(idx_unit) {
            "" => WeightUnit::Kg,
            other => WeightUnit::parse(other).with_context(|| format!("Row {line}"))?,
        };
        let rpe = match field(idx_rpe) {
            "" => None,
            other => Some(
                other
                    .parse::<f64>()
                    .with_context(|| format!("Row {line}: bad RPE '{other}'"))?,
            ),
        };
        let notes = Some(field(idx_notes))
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        rows.push(WorkoutRow {
            line,
            performed_at,
            exercise: exercise.to_string(),
            load,
            unit,
            reps,
            rpe,
            notes,
        });
    }

    Ok(rows)
}

fn field_at(record: &csv::StringRecord, idx: Option<usize>) -> &str {
    idx.and_then(|i| record.get(i)).unwrap_or("")
}

/// Accepts `YYYY-MM-DD HH:MM:SS`, plain `YYYY-MM-DD` (midnight UTC) or RFC 3339.
fn parse_performed_at(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(d.and_time(NaiveTime::MIN).and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    bail!("Cannot parse date: '{value}'")
}

/// Import parsed rows into a user's performance log.
///
/// Rows that fail entry validation are counted and reported, not imported.
/// When `dry_run` is true, no data is written.
pub fn import_workout_rows(
    db: &Database,
    user_id: i64,
    rows: &[WorkoutRow],
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<WorkoutImportSummary> {
    let mut summary = WorkoutImportSummary {
        rows_parsed: rows.len(),
        ..WorkoutImportSummary::default()
    };
    let mut exercises: HashSet<String> = HashSet::new();
    let mut days: HashSet<NaiveDate> = HashSet::new();

    for row in rows {
        let entry = NewPerformanceLogEntry {
            exercise: row.exercise.clone(),
            load: row.load,
            reps: row.reps,
            unit: row.unit,
            rpe: row.rpe,
            notes: row.notes.clone(),
            performed_at: Some(row.performed_at),
        };
        if let Err(e) = entry.validate() {
            summary.rows_rejected += 1;
            summary.errors.push(format!("Row {}: {e}", row.line));
            continue;
        }

        if !dry_run {
            db.insert_performance_entry(user_id, &entry, now)?;
        }
        exercises.insert(row.exercise.to_lowercase());
        days.insert(row.performed_at.date_naive());
        summary.entries_imported += 1;
    }

    summary.exercises = exercises.len();
    summary.days_spanned = days.len();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewUser;
    use chrono::TimeZone;

    const SAMPLE_CSV: &str = "\
Date,Workout Name,Exercise Name,Set Order,Weight,Weight Unit,Reps,RPE,Notes
2024-01-15 07:02:11,Push,Bench Press,1,60,kg,8,7,
2024-01-15 07:05:40,Push,Bench Press,2,62.5,kg,6,8,felt heavy
2024-01-15 07:20:03,Push,Overhead Press,1,95,lb,5,,
2024-01-17 18:45:00,Legs,Squat,1,100,KG,5,8.5,
2024-01-17 18:52:00,Legs,squat,2,105,kg,3,9,
";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 20, 9, 0, 0).unwrap()
    }

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = db
            .insert_user(
                &NewUser {
                    email: "lift@example.com".to_string(),
                    display_name: None,
                    is_admin: false,
                },
                now(),
            )
            .unwrap();
        (db, user.id)
    }

    #[test]
    fn test_parse_workout_csv_basic() {
        let rows = parse_workout_csv(SAMPLE_CSV.as_bytes()).unwrap();
        assert_eq!(rows.len(), 5);

        assert_eq!(rows[0].exercise, "Bench Press");
        assert_eq!(
            rows[0].performed_at,
            Utc.with_ymd_and_hms(2024, 1, 15, 7, 2, 11).unwrap()
        );
        assert!((rows[0].load - 60.0).abs() < f64::EPSILON);
        assert_eq!(rows[0].reps, 8);
        assert_eq!(rows[0].rpe, Some(7.0));
        assert!(rows[0].notes.is_none());

        assert_eq!(rows[1].notes.as_deref(), Some("felt heavy"));
        assert_eq!(rows[2].unit, WeightUnit::Lb);
        assert!(rows[2].rpe.is_none());
        assert_eq!(rows[3].unit, WeightUnit::Kg);
        assert_eq!(rows[4].line, 6);
    }

    #[test]
    fn test_parse_missing_required_column() {
        let bad = "Date,Exercise Name,Reps\n2024-01-15,Squat,5\n";
        let err = parse_workout_csv(bad.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Weight"));
    }

    #[test]
    fn test_parse_minimal_columns_and_blank_rows() {
        let csv = "\
date,exercise name,weight,reps
2024-02-01,Deadlift,140,5
,,,
2024-02-03T06:30:00+01:00,Deadlift,150,3
";
        let rows = parse_workout_csv(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].unit, WeightUnit::Kg);
        assert_eq!(
            rows[0].performed_at,
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            rows[1].performed_at,
            Utc.with_ymd_and_hms(2024, 2, 3, 5, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_reports_bad_row() {
        let csv = "Date,Exercise Name,Weight,Reps\n2024-02-01,Squat,heavy,5\n";
        let err = parse_workout_csv(csv.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("Row 2"));

        let csv = "Date,Exercise Name,Weight,Reps\nlast tuesday,Squat,100,5\n";
        assert!(parse_workout_csv(csv.as_bytes()).is_err());
    }

    #[test]
    fn test_import_dry_run_writes_nothing() {
        let (db, user_id) = setup();
        let rows = parse_workout_csv(SAMPLE_CSV.as_bytes()).unwrap();
        let summary = import_workout_rows(&db, user_id, &rows, true, now()).unwrap();
        assert_eq!(summary.rows_parsed, 5);
        assert_eq!(summary.entries_imported, 5);
        assert_eq!(summary.exercises, 3);
        assert_eq!(summary.days_spanned, 2);
        assert!(db.list_performance_entries(user_id, None).unwrap().is_empty());
    }

    #[test]
    fn test_import_actual() {
        let (db, user_id) = setup();
        let rows = parse_workout_csv(SAMPLE_CSV.as_bytes()).unwrap();
        let summary = import_workout_rows(&db, user_id, &rows, false, now()).unwrap();
        assert_eq!(summary.entries_imported, 5);

        let entries = db.list_performance_entries(user_id, None).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].exercise, "squat");
        assert_eq!(entries[0].created_at, now());
    }

    #[test]
    fn test_import_rejects_invalid_sets() {
        let (db, user_id) = setup();
        let csv = "\
Date,Exercise Name,Weight,Reps,RPE
2024-02-01,Squat,-20,5,
2024-02-01,Squat,100,5,14
2024-02-01,Squat,100,5,8
";
        let rows = parse_workout_csv(csv.as_bytes()).unwrap();
        let summary = import_workout_rows(&db, user_id, &rows, false, now()).unwrap();
        assert_eq!(summary.entries_imported, 1);
        assert_eq!(summary.rows_rejected, 2);
        assert!(summary.errors[0].starts_with("Row 2"));
        assert!(summary.errors[1].contains("rpe"));
    }
}
