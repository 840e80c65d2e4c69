//! In-flight request accounting for graceful drain and introspection.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::time::Duration;

/// Counts requests currently being processed by the gateway.
///
/// The active gauge is decremented by an RAII guard so cancelled requests
/// are accounted for the same way completed ones are.
pub struct ConnectionTracker {
    active_requests: AtomicUsize,
    total_requests: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            active_requests: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    pub fn begin_request(self: &Arc<Self>) -> RequestGuard {
        self.active_requests.fetch_add(1, Ordering::AcqRel);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        crate::metrics::set_active_requests(self.active());
        RequestGuard {
            tracker: self.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.active_requests.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Wait for in-flight requests to finish, up to `timeout`.
    ///
    /// Returns `true` when the gateway drained fully.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RequestGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.active_requests.fetch_sub(1, Ordering::AcqRel);
        crate::metrics::set_active_requests(self.tracker.active());
    }
}
