use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::workflows::underwriting::fusion::{DecisionThresholds, FusionPolicy, ThresholdError};
use crate::workflows::underwriting::orchestrator::{OrchestratorSettings, RetryPolicy};
use crate::workflows::underwriting::policy::{ChunkingConfig, PolicyError};

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
    pub underwriting: UnderwritingConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            underwriting: UnderwritingConfig::from_env()?,
        })
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

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Decision cut-offs, resilience knobs, and storage locations for the underwriting workflow.
#[derive(Debug, Clone)]
pub struct UnderwritingConfig {
    pub thresholds: DecisionThresholds,
    pub confidence_floor: f64,
    pub branch_timeout: Duration,
    pub retry: RetryPolicy,
    pub chunking: ChunkingConfig,
    /// JSON state file; runs are kept in memory when unset.
    pub state_path: Option<PathBuf>,
    /// Policy corpus indexed at startup.
    pub policy_csv: Option<PathBuf>,
}

impl UnderwritingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = OrchestratorSettings::default();
        let thresholds = DecisionThresholds::new(
            number("UW_APPROVE_THRESHOLD", defaults.thresholds.approve)?,
            number("UW_REJECT_THRESHOLD", defaults.thresholds.reject)?,
        )
        .map_err(ConfigError::InvalidThresholds)?;

        let confidence_floor: f64 =
            number("UW_CONFIDENCE_FLOOR", defaults.fusion.confidence_floor)?;
        if !(0.0..=1.0).contains(&confidence_floor) {
            return Err(ConfigError::InvalidNumber {
                key: "UW_CONFIDENCE_FLOOR",
                value: confidence_floor.to_string(),
            });
        }

        let retry = RetryPolicy {
            max_retries: number("UW_RETRY_MAX", defaults.retry.max_retries)?,
            base_delay: Duration::from_millis(number(
                "UW_RETRY_BASE_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(number(
                "UW_RETRY_CAP_MS",
                defaults.retry.max_delay.as_millis() as u64,
            )?),
        };

        let fallback = ChunkingConfig::default();
        let chunking = ChunkingConfig::new(
            number("UW_CHUNK_SIZE", fallback.chunk_size)?,
            number("UW_CHUNK_OVERLAP", fallback.chunk_overlap)?,
        )
        .map_err(ConfigError::InvalidChunking)?;

        Ok(Self {
            thresholds,
            confidence_floor,
            branch_timeout: Duration::from_secs(number(
                "UW_BRANCH_TIMEOUT_SECS",
                defaults.branch_timeout.as_secs(),
            )?),
            retry,
            chunking,
            state_path: path("UW_STATE_PATH"),
            policy_csv: path("UW_POLICY_CSV"),
        })
    }

    /// Orchestrator settings with these overrides applied on top of the defaults.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            branch_timeout: self.branch_timeout,
            retry: self.retry,
            thresholds: self.thresholds,
            fusion: FusionPolicy {
                confidence_floor: self.confidence_floor,
                ..FusionPolicy::default()
            },
            ..OrchestratorSettings::default()
        }
    }
}

fn number<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value: raw }),
        _ => Ok(default),
    }
}

fn path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { key: &'static str, value: String },
    InvalidThresholds(ThresholdError),
    InvalidChunking(PolicyError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { key, value } => {
                write!(f, "{key} has an invalid value '{value}'")
            }
            ConfigError::InvalidThresholds(err) => write!(f, "invalid decision thresholds: {err}"),
            ConfigError::InvalidChunking(err) => write!(f, "invalid chunking settings: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort | ConfigError::InvalidNumber { .. } => None,
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidThresholds(err) => Some(err),
            ConfigError::InvalidChunking(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for key in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "UW_APPROVE_THRESHOLD",
            "UW_REJECT_THRESHOLD",
            "UW_CONFIDENCE_FLOOR",
            "UW_BRANCH_TIMEOUT_SECS",
            "UW_RETRY_MAX",
            "UW_RETRY_BASE_MS",
            "UW_RETRY_CAP_MS",
            "UW_CHUNK_SIZE",
            "UW_CHUNK_OVERLAP",
            "UW_STATE_PATH",
            "UW_POLICY_CSV",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");

        let underwriting = config.underwriting;
        assert_eq!(underwriting.thresholds, DecisionThresholds::default());
        assert_eq!(underwriting.confidence_floor, 0.6);
        assert_eq!(underwriting.branch_timeout, Duration::from_secs(30));
        assert_eq!(underwriting.retry, RetryPolicy::default());
        assert_eq!(underwriting.chunking, ChunkingConfig::default());
        assert!(underwriting.state_path.is_none());
        assert!(underwriting.policy_csv.is_none());
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn underwriting_overrides_flow_into_orchestrator_settings() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("UW_APPROVE_THRESHOLD", "750");
        env::set_var("UW_REJECT_THRESHOLD", "450");
        env::set_var("UW_CONFIDENCE_FLOOR", "0.7");
        env::set_var("UW_RETRY_MAX", "5");
        env::set_var("UW_STATE_PATH", "/tmp/underwriting-state.json");

        let config = AppConfig::load().expect("config loads");
        let settings = config.underwriting.orchestrator_settings();
        assert_eq!(settings.thresholds, DecisionThresholds { approve: 750, reject: 450 });
        assert_eq!(settings.fusion.confidence_floor, 0.7);
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(
            config.underwriting.state_path,
            Some(PathBuf::from("/tmp/underwriting-state.json"))
        );
        reset_env();
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("UW_APPROVE_THRESHOLD", "400");
        env::set_var("UW_REJECT_THRESHOLD", "600");

        let err = AppConfig::load().expect_err("reject above approve");
        assert!(matches!(err, ConfigError::InvalidThresholds(_)));
        reset_env();
    }

    #[test]
    fn non_numeric_values_name_the_variable() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("UW_CHUNK_SIZE", "large");

        let err = AppConfig::load().expect_err("chunk size must be numeric");
        assert_eq!(err.to_string(), "UW_CHUNK_SIZE has an invalid value 'large'");
        reset_env();
    }
}
