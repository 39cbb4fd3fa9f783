//! # Agent Pool Manager
//!
//! Keeps a warm population of tunnel connections to one relay target:
//! at least `PoolIdleSize` idle connections, never more than `PoolMaxSize`
//! in total. The pool refills on a one-second ticker and opportunistically
//! whenever a connection picks up a request, so a lost idle slot is covered
//! immediately instead of on the next tick.

use crate::config::Config;
use crate::connection::{Connection, Status};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tunnel_wire as wire;

/// Period of the background refill ticker.
const REFILL_PERIOD: Duration = Duration::from_secs(1);

pub struct Pool {
    config: Arc<Config>,
    target: String,
    http: reqwest::Client,
    connections: RwLock<Vec<Arc<Connection>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(config: Arc<Config>, http: reqwest::Client, target: String) -> Arc<Self> {
        Arc::new(Self {
            config,
            target,
            http,
            connections: RwLock::new(Vec::new()),
            ticker: Mutex::new(None),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn secret_key(&self) -> &str {
        &self.config.secret_key
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn greeting(&self) -> wire::Greeting {
        wire::Greeting {
            id: self.config.id.clone(),
            pool_idle_size: self.config.pool_idle_size,
        }
    }

    /// Fills the pool once and starts the refill ticker.
    pub fn start(self: &Arc<Self>) {
        self.refill();

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFILL_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.refill();
            }
        });
        *self.ticker.lock() = Some(handle);
    }

    /// Tops the pool up toward the idle target. An empty pool always dials
    /// exactly one connection first, even when the idle target is zero, so
    /// the pool bootstraps itself. Growth never exceeds the max size;
    /// connections still dialing count toward the total.
    pub fn refill(self: &Arc<Self>) {
        let mut connections = self.connections.write();
        let size = measure(&connections);

        let mut to_create = self.config.pool_idle_size.saturating_sub(size.idle);
        if size.total == 0 {
            to_create = 1;
        }
        to_create = to_create.min(self.config.pool_max_size.saturating_sub(size.total));

        for _ in 0..to_create {
            let connection = Connection::new();
            connections.push(Arc::clone(&connection));

            let pool = Arc::clone(self);
            tokio::spawn(async move {
                connection.run(&pool).await;
            });
        }

        if to_create > 0 {
            debug!(relay = %self.target, created = to_create, "growing connection pool");
        }
    }

    /// Drops a connection from the pool. Safe to call more than once for
    /// the same connection.
    pub fn remove(&self, connection: &Arc<Connection>) {
        self.connections
            .write()
            .retain(|candidate| !Arc::ptr_eq(candidate, connection));
    }

    pub fn size(&self) -> PoolSize {
        measure(&self.connections.read())
    }

    /// Stops the ticker, then closes every connection.
    pub async fn shutdown(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }

        let connections: Vec<_> = self.connections.write().drain(..).collect();
        info!(relay = %self.target, count = connections.len(), "closing pool");
        for connection in connections {
            connection.close().await;
        }
    }
}

fn measure(connections: &[Arc<Connection>]) -> PoolSize {
    let mut size = PoolSize {
        total: connections.len(),
        ..PoolSize::default()
    };
    for connection in connections {
        match connection.status() {
            Status::Connecting => size.connecting += 1,
            Status::Idle => size.idle += 1,
            Status::Running => size.running += 1,
        }
    }
    size
}

/// Connection counters for one pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolSize {
    pub connecting: usize,
    pub idle: usize,
    pub running: usize,
    pub total: usize,
}

impl fmt::Display for PoolSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connecting {}, idle {}, running {}, total {}",
            self.connecting, self.idle, self.running, self.total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(idle: usize, max: usize) -> Arc<Pool> {
        let target = "ws://127.0.0.1:1/register".to_string();
        let config = Config {
            id: "test-agent".to_string(),
            targets: vec![target.clone()],
            pool_idle_size: idle,
            pool_max_size: max,
            secret_key: "secret".to_string(),
        };
        Pool::new(Arc::new(config), reqwest::Client::new(), target)
    }

    // The dial tasks spawned by refill only progress at await points, so
    // back-to-back refill calls observe a stable Connecting population.

    #[tokio::test]
    async fn refill_kickstarts_a_single_connection() {
        let pool = test_pool(3, 5);
        pool.refill();

        let size = pool.size();
        assert_eq!(size.total, 1);
        assert_eq!(size.connecting, 1);
    }

    #[tokio::test]
    async fn refill_grows_toward_the_idle_target() {
        let pool = test_pool(3, 5);
        pool.refill();
        assert_eq!(pool.size().total, 1);

        // No connection is idle yet, so the next rounds keep growing until
        // the max size caps them.
        pool.refill();
        assert_eq!(pool.size().total, 4);
        pool.refill();
        assert_eq!(pool.size().total, 5);
        pool.refill();
        assert_eq!(pool.size().total, 5);
    }

    #[tokio::test]
    async fn refill_respects_the_max_size() {
        let pool = test_pool(10, 2);
        pool.refill();
        pool.refill();
        pool.refill();
        assert_eq!(pool.size().total, 2);
    }

    #[tokio::test]
    async fn refill_with_zero_idle_target_still_bootstraps() {
        let pool = test_pool(0, 5);
        pool.refill();
        assert_eq!(pool.size().total, 1);

        pool.refill();
        assert_eq!(pool.size().total, 1, "no growth beyond the kickstart");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let pool = test_pool(1, 5);
        pool.refill();
        let connection = pool.connections.read()[0].clone();

        pool.remove(&connection);
        pool.remove(&connection);
        assert_eq!(pool.size().total, 0);
    }

    #[tokio::test]
    async fn shutdown_clears_the_pool() {
        let pool = test_pool(3, 5);
        pool.refill();
        pool.refill();
        assert!(pool.size().total > 0);

        pool.shutdown().await;
        assert_eq!(pool.size().total, 0);
    }

    #[test]
    fn pool_size_display() {
        let size = PoolSize {
            connecting: 1,
            idle: 2,
            running: 3,
            total: 6,
        };
        assert_eq!(size.to_string(), "connecting 1, idle 2, running 3, total 6");
    }
}
