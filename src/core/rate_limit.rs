//! Per-client token-bucket rate limiting.
//!
//! Each client key owns a bucket of `burst` tokens refilled at `rps`
//! tokens/second (a keyed `governor` limiter). The key comes from a
//! configurable request header, falling back to the client IP extracted the
//! same way IP-hash does it. Idle buckets are evicted by a periodic sweep so
//! the key space cannot grow without bound.

use std::{net::SocketAddr, num::NonZeroU32, time::Duration};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
};
use http::HeaderMap;

use crate::utils::remote_ip::client_ip;

/// How often the sweeper evicts idle buckets.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct ClientRateLimiter {
    limiter: KeyedLimiter,
    rps: u32,
    burst: u32,
    by_header: Option<String>,
}

impl ClientRateLimiter {
    /// Build a limiter allowing `rps` sustained requests/second with bursts
    /// up to `burst`. `burst ≥ rps ≥ 1` is enforced by config validation;
    /// zero values are clamped here so a hand-built limiter stays safe.
    pub fn new(rps: u32, burst: u32, by_header: Option<String>) -> Self {
        let rps_nz = NonZeroU32::new(rps.max(1)).unwrap_or(NonZeroU32::MIN);
        let burst_nz = NonZeroU32::new(burst.max(rps.max(1))).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rps_nz).allow_burst(burst_nz);
        Self {
            limiter: RateLimiter::keyed(quota),
            rps: rps_nz.get(),
            burst: burst_nz.get(),
            by_header: by_header.filter(|h| !h.is_empty()),
        }
    }

    /// Non-blocking: consume one token for `key` if available.
    pub fn allow(&self, key: &str) -> bool {
        self.limiter.check_key(&key.to_string()).is_ok()
    }

    /// Blocking variant: wait until a token for `key` is available and
    /// consume it. Cancellation is cooperative — dropping the future
    /// abandons the wait without consuming anything.
    pub async fn wait(&self, key: &str) {
        self.limiter.until_key_ready(&key.to_string()).await;
    }

    /// The per-key bucket capacity.
    pub fn limit(&self, _key: &str) -> u32 {
        self.burst
    }

    pub fn rps(&self) -> u32 {
        self.rps
    }

    /// Derive the client key: configured header first, client IP otherwise.
    pub fn key_for(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        if let Some(header) = self.by_header.as_deref()
            && let Some(value) = headers.get(header).and_then(|v| v.to_str().ok())
            && !value.is_empty()
        {
            return value.to_string();
        }
        client_ip(headers, peer)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Evict buckets that have been idle long enough for their state to be
    /// indistinguishable from a fresh one.
    pub fn sweep(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }
}
