//! Configuration data structures for switchyard.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files
//! and to `SWITCHYARD_*` environment overrides. Defaults keep a minimal
//! config concise; the catalog seed (`services` / `routes`) reuses the
//! domain model types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    balancer::Algorithm,
    model::{Route, Service},
};

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_read_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub load_balancing: LoadBalancingConfig,
    pub health_check: HealthCheckConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub tls: Option<TlsConfig>,
    pub storage: StorageConfig,
    /// Catalog seed loaded at startup; runtime mutation flows through the
    /// catalog store.
    pub services: Vec<Service>,
    pub routes: Vec<Route>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            load_balancing: LoadBalancingConfig::default(),
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            tls: None,
            storage: StorageConfig::default(),
            services: Vec::new(),
            routes: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub algorithm: Algorithm,
    pub sticky: StickyConfig,
}

fn default_cookie_name() -> String {
    "lb_session".to_string()
}

fn default_sticky_ttl() -> u64 {
    30 * 60
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StickyConfig {
    pub enabled: bool,
    pub cookie_name: String,
    pub ttl_secs: u64,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: default_cookie_name(),
            ttl_secs: default_sticky_ttl(),
        }
    }
}

impl StickyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub fail_threshold: u32,
    pub pass_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 2,
            fail_threshold: 3,
            pass_threshold: 2,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Minimum requests in the rolling window before the breaker can trip
    pub failure_threshold: u64,
    /// HalfOpen trial budget / success streak to close
    pub success_threshold: u32,
    /// Open duration before probing
    pub timeout_secs: u64,
    /// Rolling window for failure accounting
    pub interval_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 10,
            success_threshold: 2,
            timeout_secs: 30,
            interval_secs: 60,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn breaker_config(&self) -> crate::core::breaker::BreakerConfig {
        crate::core::breaker::BreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_secs(self.timeout_secs),
            interval: Duration::from_secs(self.interval_secs),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub rps: u32,
    pub burst: u32,
    /// Key by this header instead of the client IP when present
    pub by_header: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rps: 10,
            burst: 20,
            by_header: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    /// Largest request body the retry path will buffer
    pub buffer_limit: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 2_000,
            buffer_limit: 256 * 1024,
        }
    }
}

impl RetryConfig {
    /// Capped exponential backoff before attempt `attempt` (1-based retries).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_backoff_ms as f64 * factor) as u64;
        Duration::from_millis(millis.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    #[serde(default = "default_tls_min_version")]
    pub min_version: String,
    #[serde(default = "default_true")]
    pub http2: bool,
}

fn default_tls_min_version() -> String {
    "1.2".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub path: Option<String>,
}
