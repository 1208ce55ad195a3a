use anyhow::{Context, Result};
use directories::ProjectDirs;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use repcoach_core::service::ServiceSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid ai.model: cannot be empty")]
    EmptyModel,

    #[error("Invalid ai.base_url: {0}. Must start with http:// or https://")]
    InvalidBaseUrl(String),

    #[error("Invalid nutrition.protein_target_g: {0}. Must be positive")]
    InvalidProteinTarget(f64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: pretty, json, compact")]
    InvalidLogFormat(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionSettings {
    /// Meals below this protein count as low-protein in the weekly report.
    pub protein_target_g: f64,
}

impl Default for NutritionSettings {
    fn default() -> Self {
        Self {
            protein_target_g: 25.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSettings {
    pub free_monthly_scans: i64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            free_monthly_scans: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Everything that can be set in `config.toml` or `REPCOACH_*` variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ai: AiSettings,
    pub nutrition: NutritionSettings,
    pub quota: QuotaSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Precedence, lowest first: defaults, the TOML file, `REPCOACH_*`
    /// environment variables (`__` separates nested keys, e.g.
    /// `REPCOACH_AI__API_KEY`).
    pub fn figment(config_path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("REPCOACH_").split("__"))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let settings: Settings = figment
            .extract()
            .context("Failed to extract configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ai.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        if !(self.ai.base_url.starts_with("http://") || self.ai.base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(self.ai.base_url.clone()));
        }
        if !self.nutrition.protein_target_g.is_finite() || self.nutrition.protein_target_g <= 0.0 {
            return Err(ConfigError::InvalidProteinTarget(
                self.nutrition.protein_target_g,
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(self.logging.format.clone()));
        }
        Ok(())
    }

    /// The API key, if one is set and not blank.
    pub fn ai_api_key(&self) -> Option<&str> {
        self.ai
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub settings: Settings,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "repcoach").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("repcoach.db");
        let config_path = data_dir.join("config.toml");
        let settings = Settings::from_figment(&Settings::figment(&config_path))?;

        Ok(Config {
            db_path,
            data_dir,
            config_path,
            settings,
        })
    }

    pub fn scan_dir(&self) -> PathBuf {
        self.data_dir.join("scans")
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            protein_target_g: self.settings.nutrition.protein_target_g,
            free_monthly_scans: self.settings.quota.free_monthly_scans,
            scan_dir: Some(self.scan_dir()),
        }
    }
}

/// A fresh opaque bearer token: 32 random bytes, hex-encoded.
pub fn generate_session_token() -> String {
    use rand::Rng;
    use std::fmt::Write;

    let bytes: [u8; 32] = rand::rng().random();
    bytes
        .iter()
        .fold(String::with_capacity(64), |mut acc: String, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}
