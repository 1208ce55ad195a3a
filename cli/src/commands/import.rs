use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

use repcoach_core::log_import::parse_workout_csv;
use repcoach_core::service::CoachService;

use super::helpers::resolve_user;

pub(crate) fn cmd_import_log(
    service: &CoachService,
    path: &Path,
    email: &str,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let user = resolve_user(service, email)?;
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;

    let rows = parse_workout_csv(file)?;

    if rows.is_empty() {
        if json {
            println!(
                "{}",
                serde_json::json!({ "error": "No rows found in CSV file" })
            );
        } else {
            eprintln!("No rows found in CSV file.");
        }
        return Ok(());
    }

    let summary = service.import_workout_rows(user.id, &rows, dry_run, Utc::now())?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "dry_run": dry_run,
                "rows_parsed": summary.rows_parsed,
                "entries_imported": summary.entries_imported,
                "rows_rejected": summary.rows_rejected,
                "exercises": summary.exercises,
                "days_spanned": summary.days_spanned,
                "errors": summary.errors,
            })
        );
        return Ok(());
    }

    if dry_run {
        println!("Dry run, no changes made.\n");
        println!("  Rows parsed:     {}", summary.rows_parsed);
        println!("  Sets to import:  {}", summary.entries_imported);
    } else {
        println!("Import complete.\n");
        println!("  Rows parsed:     {}", summary.rows_parsed);
        println!("  Sets imported:   {}", summary.entries_imported);
    }
    println!("  Rows rejected:   {}", summary.rows_rejected);
    println!("  Exercises:       {}", summary.exercises);
    println!("  Days spanned:    {}", summary.days_spanned);
    for error in &summary.errors {
        eprintln!("  {error}");
    }

    Ok(())
}
