pub mod buffer_pool;
pub mod connection_tracker;
pub mod graceful_shutdown;
pub mod remote_ip;

pub use buffer_pool::BufferPool;
pub use connection_tracker::ConnectionTracker;
pub use graceful_shutdown::{GracefulShutdown, ShutdownToken};
