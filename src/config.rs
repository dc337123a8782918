//! Runtime configuration
//!
//! Everything the control plane needs at startup, sourced from environment
//! variables with sane defaults. Listener host/port live on the binary's CLI
//! args instead, see `bin/server/main.rs`.

use std::fmt;
use std::time::Duration;

use crate::rate_limit::RateLimiterConfig;

/// Control plane configuration
#[derive(Clone)]
pub struct ControlConfig {
    /// Direct PostgreSQL URL (preferred), from `DATABASE_URL`
    pub database_url: Option<String>,
    /// Pooled PostgreSQL URL used as fallback, from `DATABASE_POOL_URL`
    pub database_pool_url: Option<String>,
    /// Base URL of the orchestrator API, from `ORCHESTRATOR_URL`
    pub orchestrator_url: String,
    /// Base URL of the secret store, from `SECRET_STORE_URL`
    /// (falls back to the orchestrator URL when unset)
    pub secret_store_url: Option<String>,
    /// Namespace scoping secret lookups, from `SECRET_NAMESPACE`
    pub secret_namespace: Option<String>,
    /// Directory holding challenge type definitions, from `CHALLENGE_TYPES_DIR`
    pub typedef_dir: String,
    /// Seconds between reconcile cycles, from `RECONCILE_INTERVAL_SECS`
    pub reconcile_interval_secs: u64,
    /// Timeout for outbound HTTP calls, from `HTTP_TIMEOUT_SECS`
    pub http_timeout_secs: u64,
    /// Rate limiter budget per window, from `RATE_LIMIT_POINTS`
    pub rate_limit_points: u32,
    /// Rate limiter window length in seconds, from `RATE_LIMIT_DURATION_SECS`
    pub rate_limit_duration_secs: u64,
    /// Rate limiter block length in seconds, from `RATE_LIMIT_BLOCK_SECS`
    pub rate_limit_block_secs: u64,
}

impl fmt::Debug for ControlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Store URLs can embed credentials.
        f.debug_struct("ControlConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field(
                "database_pool_url",
                &self.database_pool_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("orchestrator_url", &self.orchestrator_url)
            .field("secret_store_url", &self.secret_store_url)
            .field("secret_namespace", &self.secret_namespace)
            .field("typedef_dir", &self.typedef_dir)
            .field("reconcile_interval_secs", &self.reconcile_interval_secs)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("rate_limit_points", &self.rate_limit_points)
            .field("rate_limit_duration_secs", &self.rate_limit_duration_secs)
            .field("rate_limit_block_secs", &self.rate_limit_block_secs)
            .finish()
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_pool_url: None,
            orchestrator_url: "http://localhost:8006".to_string(),
            secret_store_url: None,
            secret_namespace: None,
            typedef_dir: "./challenge-types".to_string(),
            reconcile_interval_secs: 2,
            http_timeout_secs: 10,
            rate_limit_points: 10,
            rate_limit_duration_secs: 60,
            rate_limit_block_secs: 60,
        }
    }
}

impl ControlConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            database_pool_url: std::env::var("DATABASE_POOL_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            orchestrator_url: std::env::var("ORCHESTRATOR_URL")
                .unwrap_or(defaults.orchestrator_url),
            secret_store_url: std::env::var("SECRET_STORE_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            secret_namespace: std::env::var("SECRET_NAMESPACE")
                .ok()
                .filter(|s| !s.is_empty()),
            typedef_dir: std::env::var("CHALLENGE_TYPES_DIR").unwrap_or(defaults.typedef_dir),
            reconcile_interval_secs: std::env::var("RECONCILE_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.reconcile_interval_secs),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            rate_limit_points: std::env::var("RATE_LIMIT_POINTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rate_limit_points),
            rate_limit_duration_secs: std::env::var("RATE_LIMIT_DURATION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rate_limit_duration_secs),
            rate_limit_block_secs: std::env::var("RATE_LIMIT_BLOCK_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rate_limit_block_secs),
        }
    }

    /// Secret store base URL, defaulting to the orchestrator itself.
    pub fn secret_store_base(&self) -> &str {
        self.secret_store_url
            .as_deref()
            .unwrap_or(&self.orchestrator_url)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn rate_limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            points: self.rate_limit_points,
            duration: Duration::from_secs(self.rate_limit_duration_secs),
            block_duration: Duration::from_secs(self.rate_limit_block_secs),
        }
    }
}
