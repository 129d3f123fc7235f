//! Environment-based configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{AppError, Result};

/// All runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API binds to
    pub listen_addr: SocketAddr,

    /// AdGuard Home base URL, e.g. `http://192.168.1.1:3000`
    pub upstream_url: String,
    pub upstream_user: String,
    pub upstream_password: String,

    /// How often the query log is polled
    pub poll_interval: Duration,
    /// How many records each poll requests
    pub poll_page_size: usize,

    /// Path to the embedded database file
    pub db_path: String,

    /// Processed-query marks older than this are garbage collected
    pub processed_retention: Duration,

    /// LLM classification settings
    pub llm_enabled: bool,
    pub llm_provider: String,
    pub llm_timeout: Duration,
    pub llm_batch_size: usize,
    pub llm_flush_interval: Duration,
    pub llm_batch_delay: Duration,

    pub gemini_api_key: String,
    pub gemini_model: String,
}

impl Config {
    /// Read configuration from the environment, validating required fields.
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = get_env("LISTEN_ADDR", "0.0.0.0:8080")
            .parse()
            .map_err(|_| AppError::Config("invalid LISTEN_ADDR".into()))?;

        let cfg = Self {
            listen_addr,
            upstream_url: required("AGH_URL")?,
            upstream_user: required("AGH_USER")?,
            upstream_password: required("AGH_PASS")?,
            poll_interval: Duration::from_secs(get_u64("POLL_INTERVAL_SECS", 10)?),
            poll_page_size: get_u64("POLL_PAGE_SIZE", 100)? as usize,
            db_path: required("DB_PATH")?,
            processed_retention: Duration::from_secs(
                get_u64("PROCESSED_RETENTION_DAYS", 7)? * 24 * 60 * 60,
            ),
            llm_enabled: get_bool("LLM_ENABLE", false),
            llm_provider: get_env("LLM_PROVIDER", "gemini"),
            llm_timeout: Duration::from_secs(get_u64("LLM_TIMEOUT_SECS", 30)?),
            llm_batch_size: get_u64("LLM_BATCH_SIZE", 20)? as usize,
            llm_flush_interval: Duration::from_secs(get_u64("LLM_FLUSH_INTERVAL_SECS", 60)?),
            llm_batch_delay: Duration::from_secs(get_u64("LLM_BATCH_DELAY_SECS", 60)?),
            gemini_api_key: get_env("GEMINI_API_KEY", ""),
            gemini_model: get_env("GEMINI_MODEL", "gemini-1.5-flash"),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval < Duration::from_secs(1) {
            return Err(AppError::Config(
                "POLL_INTERVAL_SECS must be at least 1".into(),
            ));
        }
        if self.llm_batch_size == 0 {
            return Err(AppError::Config("LLM_BATCH_SIZE must be positive".into()));
        }
        if self.llm_enabled {
            match self.llm_provider.as_str() {
                "gemini" => {
                    if self.gemini_api_key.is_empty() {
                        return Err(AppError::Config(
                            "GEMINI_API_KEY is required when LLM_PROVIDER=gemini".into(),
                        ));
                    }
                }
                other => {
                    return Err(AppError::Config(format!(
                        "invalid LLM_PROVIDER: {other} (must be gemini)"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn get_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn required(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::Config(format!("{key} is required"))),
    }
}

fn get_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| AppError::Config(format!("invalid {key}: {v}"))),
        Err(_) => Ok(default),
    }
}

fn get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}
