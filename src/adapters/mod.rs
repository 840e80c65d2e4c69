//! Adapters: I/O-facing implementations of the ports plus the request
//! handler that drives the core.

pub mod catalog_sync;
pub mod health_monitor;
pub mod http_client;
pub mod memory_catalog;
pub mod proxy_handler;

pub use catalog_sync::CatalogSync;
pub use health_monitor::HealthMonitor;
pub use http_client::HttpClientAdapter;
pub use memory_catalog::MemoryCatalog;
pub use proxy_handler::ProxyHandler;
