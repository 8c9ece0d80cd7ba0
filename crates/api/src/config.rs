//! Application configuration loaded from environment variables.

use std::time::Duration;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT` — bind address (default: `0.0.0.0:3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `json` for JSON lines, anything else for text
/// - `DATABASE_URL` — Postgres ledger; the in-memory ledger when unset
/// - `GATEWAY_BASE_URL`, `GATEWAY_API_KEY` — payment gateway
/// - `INVITE_PROVIDER_URL`, `INVITE_PROVIDER_TOKEN` — invite provider
/// - `MAIL_API_URL`, `MAIL_API_KEY`, `MAIL_FROM` — buyer mail; logged when unset
/// - `WORKER_INTERVAL_SECS`, `WORKER_BATCH_SIZE`, `WORKER_CONCURRENCY`
/// - `SETTINGS_REFRESH_SECS`, `HTTP_TIMEOUT_SECS`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub gateway_base_url: Option<String>,
    pub gateway_api_key: String,
    pub invite_provider_url: Option<String>,
    pub invite_provider_token: String,
    pub mail_api_url: Option<String>,
    pub mail_api_key: String,
    pub mail_from: String,
    pub worker_interval: Duration,
    pub worker_batch_size: usize,
    pub worker_concurrency: usize,
    pub settings_refresh: Duration,
    pub http_timeout: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str| text(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            host: text("HOST").unwrap_or(defaults.host),
            port: text("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: text("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match text("LOG_FORMAT") {
                Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: text("DATABASE_URL"),
            gateway_base_url: text("GATEWAY_BASE_URL"),
            gateway_api_key: text("GATEWAY_API_KEY").unwrap_or_default(),
            invite_provider_url: text("INVITE_PROVIDER_URL"),
            invite_provider_token: text("INVITE_PROVIDER_TOKEN").unwrap_or_default(),
            mail_api_url: text("MAIL_API_URL"),
            mail_api_key: text("MAIL_API_KEY").unwrap_or_default(),
            mail_from: text("MAIL_FROM").unwrap_or(defaults.mail_from),
            worker_interval: number("WORKER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.worker_interval),
            worker_batch_size: number("WORKER_BATCH_SIZE")
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.worker_batch_size),
            worker_concurrency: number("WORKER_CONCURRENCY")
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.worker_concurrency),
            settings_refresh: number("SETTINGS_REFRESH_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.settings_refresh),
            http_timeout: number("HTTP_TIMEOUT_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            gateway_base_url: None,
            gateway_api_key: String::new(),
            invite_provider_url: None,
            invite_provider_token: String::new(),
            mail_api_url: None,
            mail_api_key: String::new(),
            mail_from: "orders@localhost".to_string(),
            worker_interval: Duration::from_secs(5),
            worker_batch_size: 20,
            worker_concurrency: 4,
            settings_refresh: Duration::from_secs(60),
            http_timeout: Duration::from_secs(15),
        }
    }
}
