//! Configuration management

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};

use crate::services::controller::EngineSettings;

const DEFAULT_MAX_UPLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// Optional NATS credentials (both must be set)
    pub nats_user: Option<String>,
    pub nats_password: Option<String>,

    /// PostgreSQL connection string
    pub database_url: String,

    pub db_max_connections: u32,

    /// Where uploaded source files are stored
    pub upload_dir: PathBuf,

    /// Upper bound for a single uploaded or imported file
    pub max_upload_bytes: u64,

    /// Keep upload files after a job completes
    pub keep_uploads: bool,

    pub heartbeat_interval_ms: u64,
    pub status_poll_every: u64,
    pub stale_after_secs: u64,
    pub max_consecutive_write_failures: u32,

    /// Remote CRM REST endpoint; CRM jobs are refused when unset
    pub crm_base_url: Option<String>,
    pub crm_api_token: Option<String>,

    /// Directory for the rolling log file
    pub logs_dir: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let heartbeat_interval_ms = parse_or(&var, "HEARTBEAT_INTERVAL_MS", 2_000)?;
        let status_poll_every: u64 = parse_or(&var, "STATUS_POLL_EVERY", 10)?;
        if status_poll_every == 0 {
            anyhow::bail!("STATUS_POLL_EVERY must be at least 1");
        }
        let stale_after_secs: u64 = parse_or(&var, "STALE_AFTER_SECS", 900)?;
        if stale_after_secs == 0 {
            anyhow::bail!("STALE_AFTER_SECS must be at least 1");
        }

        Ok(Self {
            nats_url: var("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string()),
            nats_user: var("NATS_USER"),
            nats_password: var("NATS_PASSWORD"),
            database_url,
            db_max_connections: parse_or(&var, "DATABASE_MAX_CONNECTIONS", 10)?,
            upload_dir: var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("uploads")),
            max_upload_bytes: parse_or(&var, "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            keep_uploads: var("KEEP_UPLOADS").map_or(false, |v| parse_flag(&v)),
            heartbeat_interval_ms,
            status_poll_every,
            stale_after_secs,
            max_consecutive_write_failures: parse_or(&var, "MAX_CONSECUTIVE_WRITE_FAILURES", 5)?,
            crm_base_url: var("CRM_BASE_URL"),
            crm_api_token: var("CRM_API_TOKEN"),
            logs_dir: var("LOGS_DIR").unwrap_or_else(|| "../logs".to_string()),
        })
    }

    /// Controller tuning derived from this configuration
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            status_poll_every: self.status_poll_every,
            max_consecutive_write_failures: self.max_consecutive_write_failures.max(1),
            stale_after: Duration::from_secs(self.stale_after_secs),
        }
    }

    /// NATS credentials, only when both halves are present
    pub fn nats_credentials(&self) -> Option<(String, String)> {
        match (&self.nats_user, &self.nats_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        }
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
