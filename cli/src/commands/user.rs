use anyhow::{Result, bail};
use chrono::Utc;
use std::process;

use repcoach_core::models::Tier;
use repcoach_core::service::CoachService;

use super::helpers::{json_error, print_json, print_user_table, resolve_user};
use crate::config::generate_session_token;

pub(crate) fn cmd_user_add(
    service: &CoachService,
    email: &str,
    name: Option<&str>,
    admin: bool,
    json: bool,
) -> Result<()> {
    let user = service.create_user(email, name, admin, Utc::now())?;
    if json {
        return print_json(&user);
    }
    let role = if user.is_admin { "admin" } else { "user" };
    println!("Created {role} {} (id {})", user.email, user.id);
    Ok(())
}

pub(crate) fn cmd_user_list(service: &CoachService, json: bool) -> Result<()> {
    let users = service.list_users()?;
    if json {
        return print_json(&users);
    }
    if users.is_empty() {
        eprintln!("No users yet. Create one with: repcoach user add <email>");
        process::exit(2);
    }
    print_user_table(&users);
    Ok(())
}

pub(crate) fn cmd_user_tier(service: &CoachService, email: &str, tier: &str, json: bool) -> Result<()> {
    let tier = Tier::parse(tier)?;
    let user = resolve_user(service, email)?;
    let Some(updated) = service.set_user_tier(user.id, tier)? else {
        bail!("User {} disappeared while updating", user.id);
    };
    if json {
        return print_json(&updated);
    }
    println!("{} is now on the {} tier", updated.email, updated.tier.as_str());
    Ok(())
}

/// Issue a new bearer token. The token is shown once and never stored.
pub(crate) fn cmd_session_issue(service: &CoachService, email: &str, json: bool) -> Result<()> {
    let user = resolve_user(service, email)?;
    let token = generate_session_token();
    service.issue_session(user.id, &token, Utc::now())?;
    if json {
        println!(
            "{}",
            serde_json::json!({ "user_id": user.id, "email": user.email, "token": token })
        );
    } else {
        println!("Session token for {}:\n\n  {token}\n", user.email);
        println!("Include in requests: Authorization: Bearer {token}");
        eprintln!("The token is not stored and cannot be shown again.");
    }
    Ok(())
}

pub(crate) fn cmd_session_revoke(service: &CoachService, token: &str, json: bool) -> Result<()> {
    let revoked = service.revoke_session(token.trim())?;
    if json {
        println!("{}", serde_json::json!({ "revoked": revoked }));
    } else if revoked {
        println!("Session revoked.");
    } else {
        eprintln!("No session matches that token.");
        process::exit(2);
    }
    Ok(())
}

pub(crate) fn cmd_session_revoke_all(service: &CoachService, email: &str, json: bool) -> Result<()> {
    let user = match resolve_user(service, email) {
        Ok(user) => user,
        Err(e) if json => {
            println!("{}", json_error(&e.to_string()));
            process::exit(1);
        }
        Err(e) => return Err(e),
    };
    let revoked = service.revoke_all_sessions(user.id)?;
    if json {
        println!("{}", serde_json::json!({ "revoked": revoked }));
    } else {
        println!("Revoked {revoked} session(s) for {}", user.email);
    }
    Ok(())
}
