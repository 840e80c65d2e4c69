//! Health state for backend servers.
//!
//! One [`HealthInfo`] per tracked server, shared between the runtime
//! [`Server`](crate::core::model::Server) (which reads the flag on the hot
//! path) and the [`HealthRegistry`] (which owns the hysteresis pipeline).
//! Active probe results and passive response observations flow through the
//! same `observe` transition so neither source can double-count.

use std::{
    collections::HashMap,
    sync::{
        Mutex, RwLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Instant,
};

use crate::metrics::set_backend_health_status;

/// Hysteresis thresholds: a server flips unhealthy after `fail_threshold`
/// consecutive failures and back after `pass_threshold` consecutive passes.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub fail_threshold: u32,
    pub pass_threshold: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            fail_threshold: 3,
            pass_threshold: 2,
        }
    }
}

#[derive(Debug, Default)]
struct LastObservation {
    last_check: Option<Instant>,
    last_error: Option<String>,
}

/// Per-server health state with hysteresis.
#[derive(Debug)]
pub struct HealthInfo {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    consecutive_passes: AtomicU32,
    total_passes: AtomicU64,
    total_failures: AtomicU64,
    /// Suppresses overlapping active probes on the same server.
    probe_in_flight: AtomicBool,
    last: Mutex<LastObservation>,
}

impl Default for HealthInfo {
    fn default() -> Self {
        Self {
            // Untracked servers default to healthy; a fresh entry starts there too.
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            consecutive_passes: AtomicU32::new(0),
            total_passes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            last: Mutex::new(LastObservation::default()),
        }
    }
}

impl HealthInfo {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_passes(&self) -> u32 {
        self.consecutive_passes.load(Ordering::Relaxed)
    }

    /// Record one observation through the hysteresis pipeline.
    ///
    /// Returns `true` when the healthy flag flipped.
    fn observe(
        &self,
        server_id: &str,
        pass: bool,
        error: Option<&str>,
        thresholds: HealthThresholds,
    ) -> bool {
        // The counter pair and the flag must move together; the flip check is
        // a multi-field decision so it runs under the entry lock.
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.last_check = Some(Instant::now());

        let flipped = if pass {
            self.total_passes.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Release);
            let passes = self.consecutive_passes.fetch_add(1, Ordering::AcqRel) + 1;
            last.last_error = None;
            if !self.is_healthy() && passes >= thresholds.pass_threshold {
                self.healthy.store(true, Ordering::Release);
                true
            } else {
                false
            }
        } else {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
            self.consecutive_passes.store(0, Ordering::Release);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            last.last_error = error.map(String::from);
            if self.is_healthy() && failures >= thresholds.fail_threshold {
                self.healthy.store(false, Ordering::Release);
                true
            } else {
                false
            }
        };
        drop(last);

        if flipped {
            let now_healthy = self.is_healthy();
            set_backend_health_status(server_id, now_healthy);
            if now_healthy {
                tracing::info!(server = server_id, "backend recovered");
            } else {
                tracing::warn!(server = server_id, "backend marked unhealthy");
            }
        }
        flipped
    }
}

/// Diagnostic view over one server's health state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub server_id: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_passes: u32,
    pub total_passes: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub seconds_since_last_check: Option<u64>,
}

/// Registry of [`HealthInfo`] entries keyed by server id.
///
/// The map is guarded by a reader/writer lock; the per-entry state is
/// atomics plus an inner lock for the transition check, so recording an
/// observation only takes the map read lock.
pub struct HealthRegistry {
    thresholds: HealthThresholds,
    entries: RwLock<HashMap<String, std::sync::Arc<HealthInfo>>>,
}

impl HealthRegistry {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    /// Get or create the entry for a server. Materialized servers hold the
    /// returned `Arc` so the hot path never touches the map.
    pub fn track(&self, server_id: &str) -> std::sync::Arc<HealthInfo> {
        if let Some(info) = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(server_id)
        {
            return info.clone();
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }

    pub fn untrack(&self, server_id: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(server_id);
    }

    /// Untracked servers are healthy by default.
    pub fn is_healthy(&self, server_id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(server_id)
            .is_none_or(|info| info.is_healthy())
    }

    pub fn record_success(&self, server_id: &str) {
        self.track(server_id)
            .observe(server_id, true, None, self.thresholds);
    }

    pub fn record_failure(&self, server_id: &str, error: &str) {
        self.track(server_id)
            .observe(server_id, false, Some(error), self.thresholds);
    }

    /// Claim the probe slot for a server. Returns `false` when a probe is
    /// already in flight.
    pub fn begin_probe(&self, server_id: &str) -> bool {
        self.track(server_id)
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_probe(&self, server_id: &str) {
        self.track(server_id)
            .probe_in_flight
            .store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<HealthSnapshot> = entries
            .iter()
            .map(|(id, info)| {
                let last = info.last.lock().unwrap_or_else(|e| e.into_inner());
                HealthSnapshot {
                    server_id: id.clone(),
                    healthy: info.is_healthy(),
                    consecutive_failures: info.consecutive_failures(),
                    consecutive_passes: info.consecutive_passes(),
                    total_passes: info.total_passes.load(Ordering::Relaxed),
                    total_failures: info.total_failures.load(Ordering::Relaxed),
                    last_error: last.last_error.clone(),
                    seconds_since_last_check: last.last_check.map(|t| t.elapsed().as_secs()),
                }
            })
            .collect();
        out.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        out
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_servers_are_healthy() {
        let registry = HealthRegistry::default();
        assert!(registry.is_healthy("svc:http://10.0.0.1:8080"));
    }

    #[test]
    fn flips_unhealthy_at_exact_fail_threshold() {
        let registry = HealthRegistry::new(HealthThresholds {
            fail_threshold: 3,
            pass_threshold: 2,
        });

        registry.record_failure("s", "boom");
        registry.record_failure("s", "boom");
        assert!(registry.is_healthy("s"));
        registry.record_failure("s", "boom");
        assert!(!registry.is_healthy("s"));
    }

    #[test]
    fn flips_healthy_at_exact_pass_threshold() {
        let registry = HealthRegistry::new(HealthThresholds {
            fail_threshold: 1,
            pass_threshold: 2,
        });

        registry.record_failure("s", "boom");
        assert!(!registry.is_healthy("s"));
        registry.record_success("s");
        assert!(!registry.is_healthy("s"));
        registry.record_success("s");
        assert!(registry.is_healthy("s"));
    }

    #[test]
    fn isolated_failure_resets_pass_streak_without_flip() {
        let registry = HealthRegistry::new(HealthThresholds {
            fail_threshold: 3,
            pass_threshold: 2,
        });

        registry.record_failure("s", "one");
        registry.record_success("s");
        registry.record_failure("s", "two");
        registry.record_failure("s", "three");
        // The streak was broken by the success, so only two consecutive
        // failures have accumulated.
        assert!(registry.is_healthy("s"));
        registry.record_failure("s", "four");
        assert!(!registry.is_healthy("s"));
    }

    #[test]
    fn probe_guard_suppresses_overlap() {
        let registry = HealthRegistry::default();
        assert!(registry.begin_probe("s"));
        assert!(!registry.begin_probe("s"));
        registry.end_probe("s");
        assert!(registry.begin_probe("s"));
    }

    #[test]
    fn snapshot_reports_counters() {
        let registry = HealthRegistry::default();
        registry.record_failure("s", "connect refused");
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].total_failures, 1);
        assert_eq!(snap[0].last_error.as_deref(), Some("connect refused"));
    }
}
