//! Coordinated shutdown for the daemon's background tasks.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the cancellation token every long-running task listens on, plus
/// the handles needed to wait for them.
pub struct ShutdownManager {
    cancel_token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    grace: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            tasks: Vec::new(),
            grace: Duration::from_secs(10),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Spawn a named task tracked for shutdown.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name, tokio::spawn(task)));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Block until ctrl+c or until something else cancels the token (the
    /// `stop` RPC), then stop all tasks.
    pub async fn wait_for_shutdown(self) {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => tracing::info!("🛑 Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            },
            _ = self.cancel_token.cancelled() => {
                tracing::info!("🛑 Shutdown requested");
            }
        }
        self.shutdown().await;
    }

    /// Cancel the token and wait up to the grace period for tasks to finish.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();

        let grace = self.grace;
        let tasks = std::mem::take(&mut self.tasks);
        let join_all = async {
            for (name, handle) in tasks {
                if let Err(e) = handle.await {
                    tracing::warn!("Task {} ended abnormally: {}", name, e);
                }
            }
        };

        match tokio::time::timeout(grace, join_all).await {
            Ok(()) => tracing::info!("✓ All tasks shut down gracefully"),
            Err(_) => tracing::warn!("⏱️  Shutdown timeout: some tasks did not complete"),
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_tasks_observe_cancellation() {
        let mut manager = ShutdownManager::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let token = manager.token();
        let flag = stopped.clone();
        manager.spawn("waiter", async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(manager.task_count(), 1);

        manager.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_hits_grace_timeout() {
        let mut manager = ShutdownManager::new().with_grace(Duration::from_millis(50));
        manager.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let started = tokio::time::Instant::now();
        manager.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
