//! Graceful shutdown of the listeners
//!
//! Listeners subscribe to the coordinator and stop accepting once notified.
//! Queries in flight hold a `QueryGuard`, TCP connections a
//! `ConnectionGuard`; `shutdown` waits for both to drain up to the
//! configured timeouts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Display, Error)]
pub enum ShutdownError {
    #[display(fmt = "shutdown already in progress")]
    AlreadyShuttingDown,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time granted to in-flight queries
    pub query_timeout: Duration,
    /// Time granted to open TCP connections after the queries are done
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig {
            query_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ShutdownCoordinator {
    shutting_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
    active_queries: Arc<AtomicUsize>,
    config: ShutdownConfig,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> ShutdownCoordinator {
        let (shutdown_tx, _) = broadcast::channel(1);

        ShutdownCoordinator {
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
            active_queries: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn register_connection(&self) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counter: self.active_connections.clone(),
        }
    }

    pub fn register_query(&self) -> QueryGuard {
        self.active_queries.fetch_add(1, Ordering::Relaxed);
        QueryGuard {
            counter: self.active_queries.clone(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn query_count(&self) -> usize {
        self.active_queries.load(Ordering::Relaxed)
    }

    /// Notify the listeners and wait for queries and connections to drain
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(ShutdownError::AlreadyShuttingDown);
        }

        log::info!("shutting down, {} queries in flight", self.query_count());
        let _ = self.shutdown_tx.send(());

        if timeout(self.config.query_timeout, wait_for_zero(&self.active_queries))
            .await
            .is_err()
        {
            log::warn!(
                "query timeout reached, {} queries still active",
                self.query_count()
            );
        }

        if timeout(self.config.drain_timeout, wait_for_zero(&self.active_connections))
            .await
            .is_err()
        {
            log::warn!(
                "drain timeout reached, {} connections still open",
                self.connection_count()
            );
        }

        log::info!("shutdown complete");
        Ok(())
    }
}

async fn wait_for_zero(counter: &AtomicUsize) {
    while counter.load(Ordering::Relaxed) > 0 {
        sleep(POLL_INTERVAL).await;
    }
}

pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct QueryGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guards() {
        let coordinator = ShutdownCoordinator::new(ShutdownConfig::default());

        let query = coordinator.register_query();
        let connection = coordinator.register_connection();
        assert_eq!(1, coordinator.query_count());
        assert_eq!(1, coordinator.connection_count());

        drop(query);
        drop(connection);
        assert_eq!(0, coordinator.query_count());
        assert_eq!(0, coordinator.connection_count());
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_drains() {
        let coordinator = Arc::new(ShutdownCoordinator::new(ShutdownConfig {
            query_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
        }));
        let mut rx = coordinator.subscribe();

        let guard = coordinator.register_query();
        let release = tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            drop(guard);
        });

        coordinator.shutdown().await.unwrap();
        assert!(rx.try_recv().is_ok());
        assert_eq!(0, coordinator.query_count());
        assert!(coordinator.is_shutting_down());
        release.await.unwrap();

        assert!(coordinator.shutdown().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_after_timeout() {
        let coordinator = ShutdownCoordinator::new(ShutdownConfig {
            query_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
        });

        let _stuck = coordinator.register_query();
        coordinator.shutdown().await.unwrap();
        assert_eq!(1, coordinator.query_count());
    }
}
