//! Active health probing.
//!
//! Every `interval`, each server of every active service gets one GET
//! against its health path. Probe results feed the same hysteresis pipeline
//! as the proxy's passive observations, so neither source double-counts. A
//! per-server compare-and-set guard suppresses overlapping probes when a
//! backend answers slower than the probe interval.

use std::sync::Arc;

use crate::{
    config::models::HealthCheckConfig,
    core::{health::HealthRegistry, pool::ServerPool},
    ports::{catalog::CatalogStore, http_client::HttpClient},
    utils::graceful_shutdown::ShutdownToken,
};

pub struct HealthMonitor {
    catalog: Arc<dyn CatalogStore>,
    pool: Arc<ServerPool>,
    registry: Arc<HealthRegistry>,
    client: Arc<dyn HttpClient>,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        pool: Arc<ServerPool>,
        registry: Arc<HealthRegistry>,
        client: Arc<dyn HttpClient>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            catalog,
            pool,
            registry,
            client,
            config,
        }
    }

    /// Probe loop; returns when the shutdown token fires.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownToken) {
        if !self.config.enabled {
            tracing::info!("health checking is disabled");
            return;
        }

        tracing::info!(
            interval_secs = self.config.interval_secs,
            timeout_secs = self.config.timeout_secs,
            fail_threshold = self.config.fail_threshold,
            pass_threshold = self.config.pass_threshold,
            "health monitor started"
        );

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; give backends a beat to start.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                _ = shutdown.wait() => break,
            }
        }
        tracing::info!("health monitor stopped");
    }

    async fn probe_all(&self) {
        let services = match self.catalog.list_services().await {
            Ok(services) => services,
            Err(e) => {
                tracing::error!(error = %e, "health monitor failed to list services");
                return;
            }
        };

        for service in services.into_iter().filter(|s| s.active) {
            let servers = self.pool.servers_for(&service);
            for server in servers.iter() {
                if !self.registry.begin_probe(&server.id) {
                    tracing::debug!(server = %server.id, "probe already in flight, skipping");
                    continue;
                }

                let url = probe_url(server.url.as_str(), &service.health_path);
                let monitor_client = self.client.clone();
                let registry = self.registry.clone();
                let server_id = server.id.clone();
                let probe_timeout = self.config.timeout();
                // Probes run concurrently and are bounded by their timeout;
                // the in-flight flag prevents pile-up across cycles.
                tokio::spawn(async move {
                    match monitor_client.probe(&url, probe_timeout).await {
                        Ok(status) if (200..300).contains(&status) => {
                            registry.record_success(&server_id);
                        }
                        Ok(status) => {
                            registry
                                .record_failure(&server_id, &format!("probe status {status}"));
                        }
                        Err(e) => {
                            registry.record_failure(&server_id, &e.to_string());
                        }
                    }
                    registry.end_probe(&server_id);
                });
            }
        }
    }
}

fn probe_url(endpoint: &str, health_path: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if health_path.starts_with('/') {
        format!("{base}{health_path}")
    } else {
        format!("{base}/{health_path}")
    }
}
