//! Graceful shutdown coordination.
//!
//! A broadcast channel fans the stop signal out to every long-lived
//! background task (health monitor, sweepers, catalog watchers) plus the
//! accept loop. Tasks hold a [`ShutdownToken`] and select on `wait`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{signal, sync::broadcast};

pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_initiated: Arc<AtomicBool>,
    shutdown_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_timeout,
        }
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn is_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Trigger shutdown once; later calls are no-ops.
    pub fn trigger(&self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("shutdown initiated");
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Block until SIGINT or SIGTERM, then trigger shutdown.
    pub async fn run_signal_handler(&self) {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received SIGINT, initiating graceful shutdown");
            }
            _ = Self::wait_for_sigterm() => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
            }
        }
        self.trigger();
    }

    #[cfg(unix)]
    async fn wait_for_sigterm() {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_sigterm() {
        std::future::pending::<()>().await;
    }
}

/// Cloneable handle a background task awaits on.
pub struct ShutdownToken {
    rx: broadcast::Receiver<()>,
}

impl ShutdownToken {
    pub async fn wait(&mut self) {
        // A closed channel means the coordinator is gone; treat as shutdown.
        let _ = self.rx.recv().await;
    }
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.resubscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_tokens() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let mut token = shutdown.token();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(100), token.wait())
            .await
            .expect("token should observe trigger");
        assert!(shutdown.is_initiated());
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_initiated());
    }
}
