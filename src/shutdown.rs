//! Graceful shutdown for the mlserve process.
//!
//! A [`ShutdownCoordinator`] is shared by the signal handler and every task
//! that should stop with the process: the metrics server and the startup
//! model load.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Shutdown coordinator for managing graceful service termination.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Watch channel for checking if shutdown is in progress.
    shutdown_watch: watch::Receiver<bool>,
    /// Internal sender for watch channel.
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    /// Flag indicating if shutdown has been initiated.
    is_shutting_down: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);

        Self {
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if shutdown is in progress.
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown");
            let _ = self.shutdown_watch_tx.send(true);
        }
    }

    /// Wait for shutdown signal (for use in select! macros).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Runs `task` until it completes or shutdown starts. Returns `None` if
    /// the task was dropped unfinished.
    pub async fn run_until_shutdown<F: Future>(&self, task: F) -> Option<F::Output> {
        tokio::select! {
            result = task => Some(result),
            _ = self.wait_for_shutdown() => {
                info!("Task cancelled due to shutdown");
                None
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal handler for graceful shutdown.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Waits for SIGTERM or SIGINT, then starts shutdown.
    #[cfg(unix)]
    pub async fn run(self) {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to install Ctrl+C handler");
                }
            }
        }

        self.coordinator.shutdown();
    }

    #[cfg(not(unix))]
    pub async fn run(self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => error!(error = %e, "Failed to install Ctrl+C handler"),
        }
        self.coordinator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_is_sticky() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutting_down());

        coordinator.shutdown();
        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());

        let waited =
            tokio::time::timeout(Duration::from_millis(100), coordinator.wait_for_shutdown()).await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn test_run_until_shutdown_completes() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.run_until_shutdown(async { 42 }).await, Some(42));
    }

    #[tokio::test]
    async fn test_run_until_shutdown_cancels() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();

        let task = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            42
        };
        assert_eq!(coordinator.run_until_shutdown(task).await, None);
    }
}
