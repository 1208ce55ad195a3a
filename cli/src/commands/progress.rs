use anyhow::Result;
use chrono::Utc;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use repcoach_core::coach::{CoachModel, Language};
use repcoach_core::service::{CoachService, weekly_report};
use repcoach_core::weekly::WeeklyStats;

use super::helpers::{no_neg_zero, print_json, resolve_user};

pub(crate) fn cmd_stats(service: &CoachService, email: &str, json: bool) -> Result<()> {
    let user = resolve_user(service, email)?;
    let snapshot = service.gamification(user.id, Utc::now())?;

    if json {
        return print_json(&snapshot);
    }

    let level = snapshot.level;
    let xp = snapshot.xp;
    let next = snapshot.next_level_xp;
    println!("=== {} ===\n", user.email);
    println!("  Level {level} ({xp} / {next} XP)");
    println!("  Streak: {} day(s)", snapshot.streak_days);
    println!(
        "  Analyses: {} total, {} this week",
        snapshot.total_analyses, snapshot.weekly_analyses
    );
    println!(
        "  Plans created: {}   Goals completed: {}",
        snapshot.plans_created, snapshot.goals_completed
    );
    if let Some(last) = snapshot.last_activity_date {
        println!("  Last activity: {last}");
    }
    println!();

    #[derive(Tabled)]
    struct BadgeRow {
        #[tabled(rename = "")]
        earned: &'static str,
        #[tabled(rename = "Badge")]
        name: &'static str,
        #[tabled(rename = "How")]
        description: &'static str,
    }

    let rows: Vec<BadgeRow> = snapshot
        .badges
        .iter()
        .map(|b| BadgeRow {
            earned: if b.earned { "*" } else { "" },
            name: b.name,
            description: b.description,
        })
        .collect();
    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
    Ok(())
}

fn print_weekly_table(stats: &WeeklyStats) {
    #[derive(Tabled)]
    struct WeeklyRow {
        #[tabled(rename = "")]
        label: &'static str,
        #[tabled(rename = "This week")]
        current: String,
        #[tabled(rename = "Last week")]
        previous: String,
    }

    let cur = no_neg_zero(stats.current_volume);
    let prev = no_neg_zero(stats.previous_volume);
    let rows = vec![
        WeeklyRow {
            label: "Sets logged",
            current: stats.sessions.to_string(),
            previous: stats.previous_sessions.to_string(),
        },
        WeeklyRow {
            label: "Volume (kg)",
            current: format!("{cur:.0}"),
            previous: format!("{prev:.0}"),
        },
    ];
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    let delta = no_neg_zero(stats.volume_delta);
    println!("  Volume change: {delta:+.0} kg");
    match &stats.best_lift_exercise {
        Some(name) => println!("  Best lift: {name} (+{:.1} kg)", stats.best_lift_delta),
        None => println!("  Best lift: no improvement yet"),
    }
    let avg = no_neg_zero(stats.avg_calories);
    println!(
        "  Meals scanned: {} (avg {avg:.0} kcal, {} under {:.0}g protein)",
        stats.meal_scans, stats.low_protein_scans, stats.protein_target_g
    );
}

/// Weekly stats, optionally with the AI-written summary. Any AI failure
/// fails the command; there is no stats-only fallback once `--summary` is set.
pub(crate) async fn cmd_weekly(
    service: &CoachService,
    coach: &dyn CoachModel,
    email: &str,
    summary: bool,
    lang: Option<&str>,
    json: bool,
) -> Result<()> {
    let user = resolve_user(service, email)?;
    let stats = service.weekly_stats(user.id, Utc::now())?;

    if !summary {
        if json {
            return print_json(&stats);
        }
        println!("=== {}: last 7 days ===\n", user.email);
        print_weekly_table(&stats);
        return Ok(());
    }

    let report = weekly_report(coach, stats, Language::parse_lenient(lang)).await?;
    if json {
        return print_json(&report);
    }
    println!("=== {}: last 7 days ===\n", user.email);
    print_weekly_table(&report.stats);
    println!("\n{}", report.summary);
    Ok(())
}
