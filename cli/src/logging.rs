use anyhow::{Result, bail};
use std::env;
use std::io;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            other => bail!("Unknown log format '{other}'"),
        }
    }
}

/// Builds the filter: `RUST_LOG` wins over the configured level, and the
/// HTTP stack is always kept quiet.
pub fn build_filter(level: &str, rust_log: Option<&str>) -> EnvFilter {
    let base = rust_log.map_or_else(
        || EnvFilter::new(format!("{level},repcoach={level},repcoach_core={level}")),
        EnvFilter::new,
    );
    [
        "hyper=warn",
        "hyper_util=warn",
        "reqwest=warn",
        "rusqlite=warn",
        "tower_http=info",
    ]
    .into_iter()
    .filter_map(|d| d.parse().ok())
    .fold(base, EnvFilter::add_directive)
}

/// Install the global subscriber. Logs go to stderr so `--json` output on
/// stdout stays clean.
pub fn init(settings: &LoggingSettings) -> Result<()> {
    let format = LogFormat::parse(&settings.format)?;
    let rust_log = env::var("RUST_LOG").ok();
    let filter = build_filter(&settings.level, rust_log.as_deref());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(io::stderr),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .try_init()?,
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(io::stderr),
            )
            .try_init()?,
    }

    tracing::debug!(
        log.level = %settings.level,
        log.format = ?format,
        "logging initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formats() {
        assert_eq!(LogFormat::parse("json").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::parse("compact").unwrap(), LogFormat::Compact);
        assert_eq!(LogFormat::parse("pretty").unwrap(), LogFormat::Pretty);
        assert!(LogFormat::parse("xml").is_err());
    }

    #[test]
    fn test_filter_prefers_rust_log() {
        let filter = build_filter("info", Some("debug")).to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("hyper=warn"));

        let filter = build_filter("warn", None).to_string();
        assert!(filter.contains("repcoach_core=warn"));
        assert!(filter.contains("reqwest=warn"));
    }
}
