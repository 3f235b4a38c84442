use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_HOSTNAME: &str = "localhost";
const DEFAULT_SCREENSHOTS_DIR: &str = "./screenshots";
const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
const DEFAULT_BCRYPT_ROUNDS: u32 = 10;
const DEFAULT_NOTIFICATION_TIMEOUT_MS: u64 = 10_000;
const MIN_BCRYPT_ROUNDS: u32 = 4;
const MAX_BCRYPT_ROUNDS: u32 = 31;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub log_json: bool,
    /// Externally reachable host, without scheme.
    pub hostname: String,
    pub screenshots_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub max_body_bytes: usize,
    pub database_url: Option<String>,
    pub bcrypt_rounds: u32,
    pub trust_forwarded_for: bool,
    pub notifications_enabled: bool,
    pub notification_webhook_url: Option<String>,
    pub notification_timeout_ms: u64,
    pub probe_template_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid INGEST_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid {name} value '{value}': expected an unsigned integer")]
    InvalidNumber { name: &'static str, value: String },
    #[error("invalid {name} value '{value}': expected true or false")]
    InvalidBool { name: &'static str, value: String },
    #[error("BCRYPT_ROUNDS must be between 4 and 31, got {0}")]
    BcryptRoundsOutOfRange(u32),
    #[error("NOTIFICATIONS_ENABLED is set but NOTIFICATION_WEBHOOK_URL is missing")]
    MissingNotificationWebhook,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr_raw =
            non_empty("INGEST_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = non_empty("INGEST_LOG_FILTER")
            .or_else(|| non_empty("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let log_json = parse_bool("INGEST_LOG_JSON", non_empty("INGEST_LOG_JSON"), false)?;

        let hostname = non_empty("HOSTNAME")
            .map(|value| strip_scheme(&value).trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());

        let screenshots_dir = non_empty("SCREENSHOTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SCREENSHOTS_DIR));

        let upload_dir = non_empty("INGEST_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);

        let max_body_bytes = parse_number(
            "INGEST_MAX_BODY_BYTES",
            non_empty("INGEST_MAX_BODY_BYTES"),
            DEFAULT_MAX_BODY_BYTES as u64,
        )?;
        let max_body_bytes = usize::try_from(max_body_bytes).unwrap_or(usize::MAX);

        let database_url = non_empty("DATABASE_URL").or_else(|| non_empty("DB_URL"));

        let bcrypt_rounds = parse_number(
            "BCRYPT_ROUNDS",
            non_empty("BCRYPT_ROUNDS"),
            u64::from(DEFAULT_BCRYPT_ROUNDS),
        )?;
        let bcrypt_rounds = u32::try_from(bcrypt_rounds).unwrap_or(u32::MAX);
        if !(MIN_BCRYPT_ROUNDS..=MAX_BCRYPT_ROUNDS).contains(&bcrypt_rounds) {
            return Err(ConfigError::BcryptRoundsOutOfRange(bcrypt_rounds));
        }

        let trust_forwarded_for = parse_bool(
            "INGEST_TRUST_FORWARDED_FOR",
            non_empty("INGEST_TRUST_FORWARDED_FOR"),
            false,
        )?;

        let notifications_enabled = parse_bool(
            "NOTIFICATIONS_ENABLED",
            non_empty("NOTIFICATIONS_ENABLED"),
            false,
        )?;
        let notification_webhook_url = non_empty("NOTIFICATION_WEBHOOK_URL");
        if notifications_enabled && notification_webhook_url.is_none() {
            return Err(ConfigError::MissingNotificationWebhook);
        }
        let notification_timeout_ms = parse_number(
            "NOTIFICATION_TIMEOUT_MS",
            non_empty("NOTIFICATION_TIMEOUT_MS"),
            DEFAULT_NOTIFICATION_TIMEOUT_MS,
        )?;

        let probe_template_path = non_empty("PROBE_TEMPLATE_PATH").map(PathBuf::from);

        Ok(Self {
            bind_addr,
            log_filter,
            log_json,
            hostname,
            screenshots_dir,
            upload_dir,
            max_body_bytes,
            database_url,
            bcrypt_rounds,
            trust_forwarded_for,
            notifications_enabled,
            notification_webhook_url,
            notification_timeout_ms,
            probe_template_path,
        })
    }

    /// `https://{hostname}`, the value substituted for `[HOST_URL]`.
    pub fn host_url(&self) -> String {
        format!("https://{}", self.hostname)
    }

    #[cfg(test)]
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_json: false,
            hostname: "probe.test".to_string(),
            screenshots_dir: data_dir.join("screenshots"),
            upload_dir: data_dir.join("uploads"),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            database_url: None,
            bcrypt_rounds: MIN_BCRYPT_ROUNDS,
            trust_forwarded_for: false,
            notifications_enabled: false,
            notification_webhook_url: None,
            notification_timeout_ms: DEFAULT_NOTIFICATION_TIMEOUT_MS,
            probe_template_path: None,
        }
    }
}

fn strip_scheme(value: &str) -> &str {
    value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .unwrap_or(value)
}

fn parse_bool(name: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidBool { name, value }),
    }
}

fn parse_number(name: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber { name, value })
}
