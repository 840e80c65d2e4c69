//! switchyard — a layer-7 reverse proxy and HTTP gateway.
//!
//! switchyard multiplexes external clients onto pools of backend services:
//! each request is matched against a mutable route catalog, a healthy
//! backend is picked by a configurable load-balancing policy, and the
//! request is forwarded with standard proxy header rewriting. Health
//! checks, a per-service circuit breaker and per-client rate limits guard
//! the backends; catalog changes reconfigure the data plane live via a
//! watch stream.
//!
//! # Features
//! - Routing on host (exact or `*.wildcard`), path prefix, path regex and
//!   header equality, with priorities and deterministic tie-breaking
//! - Load balancers: round-robin, weighted (smooth), least-connections,
//!   consistent-hash IP-hash; sticky-session decorator over any of them
//! - Active probes + passive observations with hysteresis per server
//! - Circuit breaker per service, token-bucket rate limiting per client
//! - Live reconfiguration from the catalog watch stream
//! - Structured tracing, Prometheus-style metrics, graceful shutdown
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) and keeps the domain logic in `core`. Embedders
//! should prefer the re-exports below over reaching into the modules.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use switchyard::{
//!     adapters::MemoryCatalog,
//!     config::loader::load_config,
//!     core::Router,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = load_config("config.yaml")?;
//! let catalog = Arc::new(MemoryCatalog::new());
//! catalog.seed(cfg.services.clone(), cfg.routes.clone()).await?;
//! let router = Arc::new(Router::new());
//! // Wire the pieces into a ProxyHandler (see the binary for the full
//! // assembly).
//! # Ok(()) }
//! ```

pub mod adapters;
pub mod config;
pub mod core;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub use crate::{
    adapters::{HealthMonitor, HttpClientAdapter, MemoryCatalog, ProxyHandler},
    core::{
        Algorithm, ClientRateLimiter, HealthRegistry, LoadBalancer, MultiCircuitBreaker,
        ProxyError, Router, ServerPool, StickySessions,
    },
    ports::catalog::CatalogStore,
    utils::{ConnectionTracker, GracefulShutdown},
};
