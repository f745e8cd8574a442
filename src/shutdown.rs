//! Coordinated shutdown of the node's background tasks.

use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long registered tasks get to finish after cancellation
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    /// Wait for Ctrl+C (or for the token to be cancelled elsewhere), then
    /// shut down.
    pub async fn wait_for_shutdown(self) {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            },
            _ = self.cancel_token.cancelled() => {
                tracing::info!("Shutdown requested");
            }
        }
        self.shutdown().await;
    }

    /// Cancel every task and join them, bounded by [`SHUTDOWN_GRACE`].
    /// Returns `true` when all tasks finished in time.
    pub async fn shutdown(mut self) -> bool {
        self.cancel_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.task_handles.drain(..).collect();
        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!("Task ended abnormally: {}", e);
                }
            }
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, join_all).await {
            Ok(()) => {
                tracing::info!("All tasks shut down gracefully");
                true
            }
            Err(_) => {
                tracing::warn!("Shutdown timeout: some tasks did not complete");
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
