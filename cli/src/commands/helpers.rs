use anyhow::{Context, Result};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use repcoach_core::models::User;
use repcoach_core::service::CoachService;

/// Look a user up by email, failing with a readable message.
pub(crate) fn resolve_user(service: &CoachService, email: &str) -> Result<User> {
    service
        .user_by_email(email)?
        .with_context(|| format!("No user with email '{}'", email.trim()))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn print_user_table(users: &[User]) {
    #[derive(Tabled)]
    struct UserRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Email")]
        email: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Tier")]
        tier: &'static str,
        #[tabled(rename = "Admin")]
        admin: &'static str,
        #[tabled(rename = "Created")]
        created: String,
    }

    let rows: Vec<UserRow> = users
        .iter()
        .map(|u| UserRow {
            id: u.id,
            email: truncate(&u.email, 40),
            name: u
                .display_name
                .as_deref()
                .map(|n| truncate(n, 25))
                .unwrap_or_default(),
            tier: u.tier.as_str(),
            admin: if u.is_admin { "yes" } else { "" },
            created: u.created_at.format("%Y-%m-%d").to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::single(0)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
