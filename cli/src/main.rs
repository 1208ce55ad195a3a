mod coach_client;
mod commands;
mod config;
mod logging;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;
use std::sync::Arc;
use tracing::{info, warn};

use crate::coach_client::OpenAiCoach;
use crate::commands::{
    cmd_import_log, cmd_session_issue, cmd_session_revoke, cmd_session_revoke_all, cmd_stats,
    cmd_tool_state_reset, cmd_tool_state_show, cmd_user_add, cmd_user_list, cmd_user_tier,
    cmd_weekly,
};
use crate::config::Config;
use repcoach_core::coach::{CoachModel, UnconfiguredCoach};
use repcoach_core::service::CoachService;

#[derive(Parser)]
#[command(
    name = "repcoach",
    version,
    about = "Self-hosted fitness coaching backend",
    long_about = "Serves workout timers, streaks, meal scans and weekly AI summaries over a \
                  small REST API, and manages users and sessions from the command line."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
    },
    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Issue and revoke API session tokens
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Show streak, XP, level and badges for a user
    Stats {
        /// User email
        email: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compare the last 7 days with the week before
    Weekly {
        /// User email
        email: String,
        /// Ask the AI coach for a written summary
        #[arg(long)]
        summary: bool,
        /// Summary language: en, fr, es (anything else falls back to en)
        #[arg(long)]
        lang: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or reset widget state (hydration, stopwatch, interval timer)
    ToolState {
        #[command(subcommand)]
        command: ToolStateCommands,
    },
    /// Import a workout log CSV export into a user's performance log
    ImportLog {
        /// Path to the CSV file
        file: std::path::PathBuf,
        /// User email to import for
        #[arg(long)]
        email: String,
        /// Preview import without making changes
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user
    Add {
        /// Email address (unique)
        email: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Grant admin privileges
        #[arg(long)]
        admin: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List all users
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change a user's subscription tier
    Tier {
        /// User email
        email: String,
        /// New tier: free or pro
        tier: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Issue a new bearer token for a user
    Issue {
        /// User email
        email: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Revoke a single token
    Revoke {
        /// The bearer token to revoke
        token: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Revoke every token belonging to a user
    RevokeAll {
        /// User email
        email: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ToolStateCommands {
    /// Show a user's current (projected) tool state
    Show {
        /// User email
        email: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reset tool state to defaults
    Reset {
        /// User email
        email: Option<String>,
        /// Reset every user
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn build_coach(config: &Config) -> Result<Arc<dyn CoachModel>> {
    match config.settings.ai_api_key() {
        Some(key) => Ok(Arc::new(OpenAiCoach::new(&config.settings.ai, key)?)),
        None => {
            warn!("no ai.api_key configured; meal scans and weekly summaries are disabled");
            Ok(Arc::new(UnconfiguredCoach))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    logging::init(&config.settings.logging)?;
    let service = CoachService::new(&config.db_path, config.service_settings())?;

    match cli.command {
        Commands::Serve { port, bind } => {
            let coach = build_coach(&config)?;
            info!(
                db = %config.db_path.display(),
                config = %config.config_path.display(),
                model = %config.settings.ai.model,
                "starting server"
            );
            server::start_server(service, coach, port, &bind).await
        }
        Commands::User { command } => match command {
            UserCommands::Add {
                email,
                name,
                admin,
                json,
            } => cmd_user_add(&service, &email, name.as_deref(), admin, json),
            UserCommands::List { json } => cmd_user_list(&service, json),
            UserCommands::Tier { email, tier, json } => {
                cmd_user_tier(&service, &email, &tier, json)
            }
        },
        Commands::Session { command } => match command {
            SessionCommands::Issue { email, json } => cmd_session_issue(&service, &email, json),
            SessionCommands::Revoke { token, json } => cmd_session_revoke(&service, &token, json),
            SessionCommands::RevokeAll { email, json } => {
                cmd_session_revoke_all(&service, &email, json)
            }
        },
        Commands::Stats { email, json } => cmd_stats(&service, &email, json),
        Commands::Weekly {
            email,
            summary,
            lang,
            json,
        } => {
            let coach = build_coach(&config)?;
            cmd_weekly(
                &service,
                coach.as_ref(),
                &email,
                summary,
                lang.as_deref(),
                json,
            )
            .await
        }
        Commands::ToolState { command } => match command {
            ToolStateCommands::Show { email, json } => cmd_tool_state_show(&service, &email, json),
            ToolStateCommands::Reset { email, all, json } => {
                cmd_tool_state_reset(&service, email.as_deref(), all, json)
            }
        },
        Commands::ImportLog {
            file,
            email,
            dry_run,
            json,
        } => cmd_import_log(&service, &file, &email, dry_run, json),
    }
}
