//! Graceful shutdown on SIGTERM and SIGINT.
//!
//! A signal cancels the root token every tracker derives its unit tokens
//! from, so in-flight transfers stop at their next chunk boundary and the
//! running command returns a cancellation error.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shutdown coordinator
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    root: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Cancel the root token once SIGTERM or SIGINT arrives.
    pub fn spawn_signal_listener(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.wait_for_signal().await;
        })
    }

    /// Wait for SIGTERM or SIGINT, then cancel.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Unable to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Unable to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling running transfers");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling running transfers");
            }
            _ = self.root.cancelled() => {
                return;
            }
        }

        self.shutdown();
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_child_tokens() {
        let coordinator = ShutdownCoordinator::new();
        let unit = coordinator.token().child_token();
        let listener = coordinator.spawn_signal_listener();

        let waiter = tokio::spawn(async move { unit.cancelled().await });

        coordinator.shutdown();
        waiter.await.unwrap();
        listener.await.unwrap();
        assert!(coordinator.is_shutting_down());
    }
}
