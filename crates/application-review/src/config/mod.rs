use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub review: ReviewConfig,
    pub storage: StorageConfig,
    pub intake: IntakeConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = AppEnvironment::from_str(
            &lookup("APP_ENV").unwrap_or_else(|| "development".to_string()),
        );

        let host = lookup("APP_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = lookup("APP_PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = lookup("APP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let review = ReviewConfig {
            acceptance_threshold: required_positive(&lookup, "ACCEPTANCE_THRESHOLD")?,
            denial_threshold: required_positive(&lookup, "DENIAL_THRESHOLD")?,
            poll_interval: Duration::from_secs(
                required_positive(&lookup, "POLL_INTERVAL_SECONDS")?.get() as u64,
            ),
            undo_window: required_seconds(&lookup, "UNDO_WINDOW_SECONDS")?,
            rate_window: Duration::from_secs(
                required_positive(&lookup, "RATE_WINDOW_SECONDS")?.get() as u64,
            ),
            rate_ceiling: required_positive(&lookup, "RATE_CEILING")?.get() as usize,
            rate_backoff: Duration::from_secs(
                required_positive(&lookup, "RATE_BACKOFF_SECONDS")?.get() as u64,
            ),
        };

        let storage = StorageConfig {
            database_path: PathBuf::from(
                lookup("DATABASE_PATH").unwrap_or_else(|| "application_review.db".to_string()),
            ),
            max_retries: optional_number(&lookup, "STORE_MAX_RETRIES", 3)?,
            retry_base_delay: Duration::from_millis(optional_number(
                &lookup,
                "STORE_RETRY_BASE_MS",
                100,
            )?),
            processed_marker_ttl_days: optional_number(&lookup, "PROCESSED_MARKER_TTL_DAYS", 30)?,
        };

        let intake = IntakeConfig {
            form_export_path: lookup("FORM_EXPORT_PATH")
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            applicant_id_question: lookup("APPLICANT_ID_QUESTION_ID")
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            review,
            storage,
            intake,
        })
    }
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing { key })
}

fn required_positive<F>(lookup: &F, key: &'static str) -> Result<NonZeroU32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = required(lookup, key)?;
    let parsed = value
        .parse::<i64>()
        .map_err(|_| ConfigError::NotNumeric {
            key,
            value: value.clone(),
        })?;
    u32::try_from(parsed)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or(ConfigError::NotPositive { key, value })
}

fn required_seconds<F>(lookup: &F, key: &'static str) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = required(lookup, key)?;
    let seconds = value
        .parse::<f64>()
        .map_err(|_| ConfigError::NotNumeric {
            key,
            value: value.clone(),
        })?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(ConfigError::NotPositive { key, value });
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| ConfigError::OutOfRange { key, value })
}

fn optional_number<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::NotNumeric { key, value }),
        None => Ok(default),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Thresholds, cadence and rate budget for the review engine. Every field is required.
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub acceptance_threshold: NonZeroU32,
    pub denial_threshold: NonZeroU32,
    pub poll_interval: Duration,
    pub undo_window: Duration,
    pub rate_window: Duration,
    pub rate_ceiling: usize,
    pub rate_backoff: Duration,
}

/// Location of the SQLite database and the store's retry policy.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub processed_marker_ttl_days: u32,
}

/// Where submissions come from and how the applicant is identified.
#[derive(Debug, Clone, Default)]
pub struct IntakeConfig {
    pub form_export_path: Option<PathBuf>,
    pub applicant_id_question: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    Missing { key: &'static str },
    NotNumeric { key: &'static str, value: String },
    NotPositive { key: &'static str, value: String },
    OutOfRange { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::Missing { key } => write!(f, "{key} is required"),
            ConfigError::NotNumeric { key, value } => {
                write!(f, "{key} must be numeric, got '{value}'")
            }
            ConfigError::NotPositive { key, value } => {
                write!(f, "{key} must be positive, got '{value}'")
            }
            ConfigError::OutOfRange { key, value } => {
                write!(f, "{key} is out of range, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}
