//! Core domain logic: routing, balancing, health, protection and request
//! rewriting. No I/O lives here; the adapters drive these types.

pub mod balancer;
pub mod breaker;
pub mod director;
pub mod error;
pub mod health;
pub mod model;
pub mod pool;
pub mod rate_limit;
pub mod rewrite;
pub mod router;

pub use balancer::{Algorithm, LoadBalancer, SelectContext, StickySessions};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, MultiCircuitBreaker};
pub use error::{ProxyError, ProxyResult};
pub use health::{HealthRegistry, HealthThresholds};
pub use model::{Route, Server, Service};
pub use pool::ServerPool;
pub use rate_limit::ClientRateLimiter;
pub use rewrite::UrlRewriter;
pub use router::Router;
