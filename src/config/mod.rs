//! Configuration loading for the batch orchestrator.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `ORCHESTRATOR_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, fmt, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "ORCHESTRATOR_";

/// Application configuration derived from `ORCHESTRATOR_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_endpoint: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Which orchestrator strategy drives dispatch. Exactly one runs per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    #[default]
    RoundRobin,
    Parallel,
}

impl SchedulerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerMode::RoundRobin => "round_robin",
            SchedulerMode::Parallel => "parallel",
        }
    }
}

impl fmt::Display for SchedulerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(SchedulerMode::RoundRobin),
            "parallel" => Ok(SchedulerMode::Parallel),
            _ => Err(ConfigError::InvalidSchedulerMode {
                value: value.to_string(),
            }),
        }
    }
}

/// Scheduler-specific configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    #[serde(default)]
    pub mode: SchedulerMode,
    #[serde(default = "default_round_robin_interval_seconds")]
    pub round_robin_interval_seconds: u64,
    #[serde(default = "default_dispatch_timeout_seconds")]
    pub dispatch_timeout_seconds: u64,
    #[serde(default = "default_parallel_interval_seconds")]
    pub parallel_interval_seconds: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_reaper_interval_seconds")]
    pub reaper_interval_seconds: u64,
    #[serde(default = "default_stale_threshold_seconds")]
    pub stale_threshold_seconds: u64,
    #[serde(default = "default_backfill_months")]
    pub backfill_months: u32,
    #[serde(default = "default_max_failures")]
    pub default_max_failures: i32,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: i32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            pipeline_endpoint: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::default(),
            round_robin_interval_seconds: default_round_robin_interval_seconds(),
            dispatch_timeout_seconds: default_dispatch_timeout_seconds(),
            parallel_interval_seconds: default_parallel_interval_seconds(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            reaper_interval_seconds: default_reaper_interval_seconds(),
            stale_threshold_seconds: default_stale_threshold_seconds(),
            backfill_months: default_backfill_months(),
            default_max_failures: default_max_failures(),
            default_max_retries: default_max_retries(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec!["[REDACTED]".to_string()];
        }
        serde_json::to_string_pretty(&config)
    }

    fn is_local_profile(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_local_profile() && self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        if let Some(endpoint) = &self.pipeline_endpoint {
            let parsed = Url::parse(endpoint).map_err(|err| ConfigError::InvalidPipelineEndpoint {
                value: endpoint.clone(),
                reason: err.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidPipelineEndpoint {
                    value: endpoint.clone(),
                    reason: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
        } else if !self.is_local_profile() {
            return Err(ConfigError::MissingPipelineEndpoint);
        }

        self.scheduler.validate()
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("round_robin_interval_seconds", self.round_robin_interval_seconds),
            ("dispatch_timeout_seconds", self.dispatch_timeout_seconds),
            ("parallel_interval_seconds", self.parallel_interval_seconds),
            ("reaper_interval_seconds", self.reaper_interval_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidSchedulerInterval {
                    field: field.to_string(),
                });
            }
        }

        if !(1..=256).contains(&self.max_concurrent_jobs) {
            return Err(ConfigError::InvalidMaxConcurrentJobs {
                value: self.max_concurrent_jobs,
            });
        }

        // A healthy in-flight run must never look stale.
        if self.stale_threshold_seconds <= self.dispatch_timeout_seconds {
            return Err(ConfigError::InvalidStaleThreshold {
                stale: self.stale_threshold_seconds,
                timeout: self.dispatch_timeout_seconds,
            });
        }

        if !(1..=120).contains(&self.backfill_months) {
            return Err(ConfigError::InvalidBackfillMonths {
                value: self.backfill_months,
            });
        }

        if self.default_max_failures < 1 {
            return Err(ConfigError::InvalidMaxFailures {
                value: self.default_max_failures,
            });
        }

        if self.default_max_retries < 0 {
            return Err(ConfigError::InvalidMaxRetries {
                value: self.default_max_retries,
            });
        }

        Ok(())
    }

    pub fn round_robin_interval(&self) -> Duration {
        Duration::from_secs(self.round_robin_interval_seconds)
    }

    pub fn parallel_interval(&self) -> Duration {
        Duration::from_secs(self.parallel_interval_seconds)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_seconds)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_seconds)
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://orchestrator.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_round_robin_interval_seconds() -> u64 {
    30
}

fn default_dispatch_timeout_seconds() -> u64 {
    300
}

fn default_parallel_interval_seconds() -> u64 {
    300
}

fn default_max_concurrent_jobs() -> usize {
    20
}

fn default_reaper_interval_seconds() -> u64 {
    300
}

fn default_stale_threshold_seconds() -> u64 {
    1800
}

fn default_backfill_months() -> u32 {
    24
}

fn default_max_failures() -> i32 {
    3
}

fn default_max_retries() -> i32 {
    3
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set ORCHESTRATOR_OPERATOR_TOKEN or ORCHESTRATOR_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("pipeline endpoint is missing; set ORCHESTRATOR_PIPELINE_ENDPOINT")]
    MissingPipelineEndpoint,
    #[error("invalid pipeline endpoint '{value}': {reason}")]
    InvalidPipelineEndpoint { value: String, reason: String },
    #[error("invalid scheduler mode '{value}'; expected round_robin or parallel")]
    InvalidSchedulerMode { value: String },
    #[error("invalid value '{value}' for {key}")]
    InvalidNumber { key: String, value: String },
    #[error("scheduler {field} must be at least 1 second")]
    InvalidSchedulerInterval { field: String },
    #[error("scheduler max concurrent jobs must be between 1 and 256, got {value}")]
    InvalidMaxConcurrentJobs { value: usize },
    #[error(
        "scheduler stale threshold ({stale}s) must exceed the dispatch timeout ({timeout}s)"
    )]
    InvalidStaleThreshold { stale: u64, timeout: u64 },
    #[error("scheduler backfill months must be between 1 and 120, got {value}")]
    InvalidBackfillMonths { value: u32 },
    #[error("scheduler default max failures must be at least 1, got {value}")]
    InvalidMaxFailures { value: i32 },
    #[error("scheduler default max retries cannot be negative, got {value}")]
    InvalidMaxRetries { value: i32 },
}

/// Loads configuration using layered `.env` files and `ORCHESTRATOR_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration. Process environment wins over every file.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Comma-separated list wins over the single-token form.
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            tokens
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else if let Some(token) = take_string(&mut layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let pipeline_endpoint = take_string(&mut layered, "PIPELINE_ENDPOINT");

        let mode = match take_string(&mut layered, "SCHEDULER_MODE") {
            Some(raw) => raw.parse()?,
            None => SchedulerMode::default(),
        };

        let scheduler = SchedulerConfig {
            mode,
            round_robin_interval_seconds: take_number(
                &mut layered,
                "SCHEDULER_ROUND_ROBIN_INTERVAL_SECONDS",
                default_round_robin_interval_seconds,
            )?,
            dispatch_timeout_seconds: take_number(
                &mut layered,
                "SCHEDULER_DISPATCH_TIMEOUT_SECONDS",
                default_dispatch_timeout_seconds,
            )?,
            parallel_interval_seconds: take_number(
                &mut layered,
                "SCHEDULER_PARALLEL_INTERVAL_SECONDS",
                default_parallel_interval_seconds,
            )?,
            max_concurrent_jobs: take_number(
                &mut layered,
                "SCHEDULER_MAX_CONCURRENT_JOBS",
                default_max_concurrent_jobs,
            )?,
            reaper_interval_seconds: take_number(
                &mut layered,
                "SCHEDULER_REAPER_INTERVAL_SECONDS",
                default_reaper_interval_seconds,
            )?,
            stale_threshold_seconds: take_number(
                &mut layered,
                "SCHEDULER_STALE_THRESHOLD_SECONDS",
                default_stale_threshold_seconds,
            )?,
            backfill_months: take_number(
                &mut layered,
                "SCHEDULER_BACKFILL_MONTHS",
                default_backfill_months,
            )?,
            default_max_failures: take_number(
                &mut layered,
                "SCHEDULER_DEFAULT_MAX_FAILURES",
                default_max_failures,
            )?,
            default_max_retries: take_number(
                &mut layered,
                "SCHEDULER_DEFAULT_MAX_RETRIES",
                default_max_retries,
            )?,
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            pipeline_endpoint,
            scheduler,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Scheduler numbers are strict: a typo must not silently fall back to the default.
fn take_number<T: FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> Result<T, ConfigError> {
    match take_string(layered, key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidNumber {
            key: format!("{ENV_PREFIX}{key}"),
            value: raw,
        }),
        None => Ok(default()),
    }
}
