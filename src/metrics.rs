//! Metric helpers for switchyard.
//!
//! Thin wrappers over the `metrics` crate macros plus a process-wide
//! snapshot store so the `/prometheus/metrics` endpoint can render values
//! without requiring an external recorder to be installed. The registry is
//! initialize-once; components call the helper functions and never touch
//! the store directly.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::Lazy;

use crate::core::breaker::BreakerState;

pub const SWITCHYARD_REQUESTS_TOTAL: &str = "switchyard_requests_total";
pub const SWITCHYARD_REQUEST_DURATION_SECONDS: &str = "switchyard_request_duration_seconds";
pub const SWITCHYARD_BACKEND_REQUESTS_TOTAL: &str = "switchyard_backend_requests_total";
pub const SWITCHYARD_BACKEND_REQUEST_DURATION_SECONDS: &str =
    "switchyard_backend_request_duration_seconds";
pub const SWITCHYARD_BACKEND_HEALTH_STATUS: &str = "switchyard_backend_health_status";
pub const SWITCHYARD_BREAKER_STATE: &str = "switchyard_breaker_state"; // 0 closed, 1 open, 2 half-open
pub const SWITCHYARD_ACTIVE_REQUESTS: &str = "switchyard_active_requests";
pub const SWITCHYARD_RATE_LIMITED_TOTAL: &str = "switchyard_rate_limited_total";

/// Aggregate counters rendered by the exposition endpoint.
pub struct Totals {
    pub requests: AtomicU64,
    pub backend_requests: AtomicU64,
    pub rate_limited: AtomicU64,
    pub active_requests: AtomicUsize,
}

pub static TOTALS: Lazy<Totals> = Lazy::new(|| {
    describe_counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        SWITCHYARD_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests forwarded to backend servers."
    );
    describe_histogram!(
        SWITCHYARD_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests forwarded to backend servers."
    );
    describe_gauge!(
        SWITCHYARD_BACKEND_HEALTH_STATUS,
        "Health of individual backend servers (1 healthy, 0 unhealthy)."
    );
    describe_gauge!(
        SWITCHYARD_BREAKER_STATE,
        "Circuit breaker state per service (0 closed, 1 open, 2 half-open)."
    );
    describe_gauge!(
        SWITCHYARD_ACTIVE_REQUESTS,
        "Number of requests currently being processed."
    );
    describe_counter!(
        SWITCHYARD_RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests rejected by the rate limiter."
    );

    Totals {
        requests: AtomicU64::new(0),
        backend_requests: AtomicU64::new(0),
        rate_limited: AtomicU64::new(0),
        active_requests: AtomicUsize::new(0),
    }
});

/// Labeled gauge values (backend health, breaker states) for exposition.
static GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub fn increment_request_total(path: &str, method: &str, status: u16) {
    TOTALS.requests.fetch_add(1, Ordering::Relaxed);
    counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(path: &str, method: &str, duration: Duration) {
    histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        "path" => path.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_backend_request_total(backend: &str, status: u16) {
    TOTALS.backend_requests.fetch_add(1, Ordering::Relaxed);
    counter!(
        SWITCHYARD_BACKEND_REQUESTS_TOTAL,
        "backend" => backend.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_backend_request_duration(backend: &str, duration: Duration) {
    histogram!(
        SWITCHYARD_BACKEND_REQUEST_DURATION_SECONDS,
        "backend" => backend.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_rate_limited() {
    TOTALS.rate_limited.fetch_add(1, Ordering::Relaxed);
    counter!(SWITCHYARD_RATE_LIMITED_TOTAL).increment(1);
}

pub fn set_active_requests(count: usize) {
    TOTALS.active_requests.store(count, Ordering::Relaxed);
    gauge!(SWITCHYARD_ACTIVE_REQUESTS).set(count as f64);
}

pub fn set_backend_health_status(server_id: &str, healthy: bool) {
    let value = if healthy { 1.0 } else { 0.0 };
    store_gauge(
        format!("{SWITCHYARD_BACKEND_HEALTH_STATUS}{{backend=\"{server_id}\"}}"),
        value,
    );
    gauge!(SWITCHYARD_BACKEND_HEALTH_STATUS, "backend" => server_id.to_string()).set(value);
}

pub fn set_breaker_state(service_id: &str, state: BreakerState) {
    let value = match state {
        BreakerState::Closed => 0.0,
        BreakerState::Open => 1.0,
        BreakerState::HalfOpen => 2.0,
    };
    store_gauge(
        format!("{SWITCHYARD_BREAKER_STATE}{{service=\"{service_id}\"}}"),
        value,
    );
    gauge!(SWITCHYARD_BREAKER_STATE, "service" => service_id.to_string()).set(value);
}

fn store_gauge(series: String, value: f64) {
    if let Ok(mut gauges) = GAUGES.lock() {
        gauges.insert(series, value);
    }
}

/// Render the Prometheus text exposition for the built-in families.
pub fn render_prometheus() -> String {
    let totals = &*TOTALS;
    let mut out = String::new();

    fn family(out: &mut String, name: &str, kind: &str, help: &str) {
        out.push_str(&format!("# HELP {name} {help}\n"));
        out.push_str(&format!("# TYPE {name} {kind}\n"));
    }

    family(
        &mut out,
        SWITCHYARD_REQUESTS_TOTAL,
        "counter",
        "Total number of HTTP requests processed by the gateway.",
    );
    out.push_str(&format!(
        "{SWITCHYARD_REQUESTS_TOTAL} {}\n",
        totals.requests.load(Ordering::Relaxed)
    ));

    family(
        &mut out,
        SWITCHYARD_BACKEND_REQUESTS_TOTAL,
        "counter",
        "Total number of HTTP requests forwarded to backend servers.",
    );
    out.push_str(&format!(
        "{SWITCHYARD_BACKEND_REQUESTS_TOTAL} {}\n",
        totals.backend_requests.load(Ordering::Relaxed)
    ));

    family(
        &mut out,
        SWITCHYARD_RATE_LIMITED_TOTAL,
        "counter",
        "Requests rejected by the rate limiter.",
    );
    out.push_str(&format!(
        "{SWITCHYARD_RATE_LIMITED_TOTAL} {}\n",
        totals.rate_limited.load(Ordering::Relaxed)
    ));

    family(
        &mut out,
        SWITCHYARD_ACTIVE_REQUESTS,
        "gauge",
        "Number of requests currently being processed.",
    );
    out.push_str(&format!(
        "{SWITCHYARD_ACTIVE_REQUESTS} {}\n",
        totals.active_requests.load(Ordering::Relaxed)
    ));

    family(
        &mut out,
        SWITCHYARD_BACKEND_HEALTH_STATUS,
        "gauge",
        "Health of individual backend servers (1 healthy, 0 unhealthy).",
    );
    family(
        &mut out,
        SWITCHYARD_BREAKER_STATE,
        "gauge",
        "Circuit breaker state per service (0 closed, 1 open, 2 half-open).",
    );
    if let Ok(gauges) = GAUGES.lock() {
        let mut series: Vec<_> = gauges.iter().collect();
        series.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in series {
            out.push_str(&format!("{name} {value}\n"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_families_and_series() {
        increment_request_total("/x", "GET", 200);
        set_backend_health_status("s1:http://10.0.0.1:8080", true);
        set_breaker_state("s1", BreakerState::Open);

        let text = render_prometheus();
        assert!(text.contains("# TYPE switchyard_requests_total counter"));
        assert!(text.contains("switchyard_backend_health_status{backend=\"s1:http://10.0.0.1:8080\"} 1"));
        assert!(text.contains("switchyard_breaker_state{service=\"s1\"} 1"));
    }
}
