use anyhow::{Result, bail};
use chrono::Utc;

use repcoach_core::service::CoachService;
use repcoach_core::tool_state::ToolState;

use super::helpers::{print_json, resolve_user};

fn print_tool_state(state: &ToolState) {
    let h = &state.hydration;
    println!("  Hydration: {} / {} ml", h.consumed_ml, h.target_ml);

    let sw = &state.stopwatch;
    let secs = sw.elapsed_ms / 1000;
    let running = if sw.running { " (running)" } else { "" };
    println!(
        "  Stopwatch: {:02}:{:02}:{:02}{running}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    );

    let b = &state.boxing;
    let status = if b.is_finished() {
        "finished"
    } else if b.running {
        "running"
    } else {
        "paused"
    };
    println!(
        "  Interval timer: round {}/{} {:?}, {}s left ({status})",
        b.current_round, b.rounds, b.phase, b.time_left
    );
    println!(
        "    {}s rounds, {}s rest, {}s total",
        b.round_length,
        b.rest_length,
        b.total_duration_secs()
    );
}

pub(crate) fn cmd_tool_state_show(service: &CoachService, email: &str, json: bool) -> Result<()> {
    let user = resolve_user(service, email)?;
    let state = service.tool_state(user.id, Utc::now())?;
    if json {
        return print_json(&state);
    }
    println!("=== {} ===\n", user.email);
    print_tool_state(&state);
    Ok(())
}

pub(crate) fn cmd_tool_state_reset(
    service: &CoachService,
    email: Option<&str>,
    all: bool,
    json: bool,
) -> Result<()> {
    let removed = match (email, all) {
        (Some(_), true) => bail!("Pass either an email or --all, not both"),
        (None, false) => bail!("Pass an email, or --all to reset every user"),
        (Some(email), false) => {
            let user = resolve_user(service, email)?;
            usize::from(service.reset_tool_state(user.id)?)
        }
        (None, true) => service.reset_all_tool_states()?,
    };

    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("Reset {removed} tool state(s). Next read returns defaults.");
    }
    Ok(())
}
