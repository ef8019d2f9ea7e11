//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::error::{DaemonError, DaemonResult};
use std::env;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiConfig,

    /// Dispatch worker configuration
    pub dispatch: DispatchConfig,

    /// Reconciliation and rate sync configuration
    pub reconcile: ReconcileConfig,

    /// Upstream configuration
    pub upstream: UpstreamConfig,

    /// Environment (test, development, production)
    pub environment: Environment,

    /// PostgreSQL connection string (`postgres` feature)
    pub database_url: Option<String>,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// Dispatch worker configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of concurrent worker tasks
    pub worker_concurrency: usize,
    /// Delivery attempts before a job is given up
    pub max_attempts: u32,
    /// Delay after the first failed attempt (doubles afterwards)
    pub backoff: Duration,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// How long a claimed order is protected from other workers
    pub lease: Duration,
}

/// Reconciliation and rate sync configuration.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Interval between reconciliation passes
    pub interval: Duration,
    /// Age after which an undispatched pending order is re-enqueued
    pub stale_pending_after: Duration,
    /// Interval between catalog rate syncs
    pub rate_sync_interval: Duration,
}

/// Upstream configuration.
#[derive(Clone)]
pub struct UpstreamConfig {
    /// Bound on every upstream call
    pub timeout: Duration,
    /// Hex-encoded AES-256 key for provider API keys
    pub crypto_key: Option<String>,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("timeout", &self.timeout)
            .field("crypto_key", &self.crypto_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment (uses stubs)
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let environment = Self::load_environment()?;
        let api = Self::load_api_config()?;
        let dispatch = Self::load_dispatch_config()?;
        let reconcile = Self::load_reconcile_config()?;
        let upstream = UpstreamConfig {
            timeout: Duration::from_secs(Self::load_env("SMM_UPSTREAM_TIMEOUT_SECS", 30)?),
            crypto_key: env::var("SMM_CRYPTO_KEY").ok().filter(|k| !k.trim().is_empty()),
        };

        Ok(Self {
            api,
            dispatch,
            reconcile,
            upstream,
            environment,
            database_url: env::var("DATABASE_URL").ok(),
        })
    }

    /// Create test configuration.
    pub fn test() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
            },
            dispatch: DispatchConfig {
                worker_concurrency: 2,
                max_attempts: 3,
                backoff: Duration::from_millis(10),
                poll_interval: Duration::from_millis(10),
                lease: Duration::from_secs(5),
            },
            reconcile: ReconcileConfig {
                interval: Duration::from_millis(50),
                stale_pending_after: Duration::from_secs(300),
                rate_sync_interval: Duration::from_secs(3600),
            },
            upstream: UpstreamConfig {
                timeout: Duration::from_secs(1),
                crypto_key: None,
            },
            environment: Environment::Test,
            database_url: None,
        }
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("SMM_ENV").unwrap_or_else(|_| "development".to_string());
        env_str.parse()
    }

    fn load_api_config() -> DaemonResult<ApiConfig> {
        let host = env::var("SMM_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = Self::load_env("SMM_API_PORT", 8080u16)?;

        Ok(ApiConfig { host, port })
    }

    fn load_dispatch_config() -> DaemonResult<DispatchConfig> {
        let worker_concurrency = Self::load_env("SMM_WORKER_CONCURRENCY", 5usize)?;
        if worker_concurrency == 0 {
            return Err(DaemonError::Config(
                "SMM_WORKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(DispatchConfig {
            worker_concurrency,
            max_attempts: Self::load_env("SMM_DISPATCH_MAX_ATTEMPTS", 3)?,
            backoff: Duration::from_millis(Self::load_env("SMM_DISPATCH_BACKOFF_MS", 1000)?),
            poll_interval: Duration::from_millis(Self::load_env("SMM_DISPATCH_POLL_MS", 250)?),
            lease: Duration::from_secs(Self::load_env("SMM_DISPATCH_LEASE_SECS", 120)?),
        })
    }

    fn load_reconcile_config() -> DaemonResult<ReconcileConfig> {
        let interval = Self::load_env("SMM_RECONCILE_INTERVAL_SECS", 120u64)?;
        let rate_sync_interval = Self::load_env("SMM_RATE_SYNC_INTERVAL_SECS", 3600u64)?;
        if interval == 0 || rate_sync_interval == 0 {
            return Err(DaemonError::Config(
                "SMM_RECONCILE_INTERVAL_SECS and SMM_RATE_SYNC_INTERVAL_SECS must be positive"
                    .to_string(),
            ));
        }

        Ok(ReconcileConfig {
            interval: Duration::from_secs(interval),
            stale_pending_after: Duration::from_secs(Self::load_env(
                "SMM_STALE_PENDING_SECS",
                300,
            )?),
            rate_sync_interval: Duration::from_secs(rate_sync_interval),
        })
    }

    fn load_env<T: FromStr>(key: &str, default: T) -> DaemonResult<T> {
        match env::var(key) {
            Ok(val) => val
                .trim()
                .parse::<T>()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            dispatch: DispatchConfig {
                worker_concurrency: 5,
                max_attempts: 3,
                backoff: Duration::from_millis(1000),
                poll_interval: Duration::from_millis(250),
                lease: Duration::from_secs(120),
            },
            reconcile: ReconcileConfig {
                interval: Duration::from_secs(120),
                stale_pending_after: Duration::from_secs(300),
                rate_sync_interval: Duration::from_secs(3600),
            },
            upstream: UpstreamConfig {
                timeout: Duration::from_secs(30),
                crypto_key: None,
            },
            environment: Environment::Development,
            database_url: None,
        }
    }
}

impl FromStr for Environment {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid SMM_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
