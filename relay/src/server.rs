//! # Relay Server Core
//!
//! Owns the pool registry and the two background tasks that keep it
//! healthy:
//!
//! - the **dispatcher**, a single task that serves connection requests one
//!   at a time, scanning every pool's idle channel in random order until it
//!   can claim a connection or the dispatch timeout expires;
//! - the **cleaner**, which sweeps the pools every five seconds, reaping
//!   stale idle connections and dropping pools that lost their last one.

use crate::config::Config;
use crate::connection::Connection;
use crate::pool::{Pool, PoolSize};
use axum::extract::ws::WebSocket;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tunnel_wire as wire;

/// Pause between dispatcher scans when no pool currently offers an idle
/// connection, bounding the busy-wait.
const DISPATCH_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Period of the background pool sweep.
const CLEAN_PERIOD: Duration = Duration::from_secs(5);

/// A request handler's claim ticket. The dispatcher either delivers a taken
/// connection on `reply` or drops it, which reads as "no connection".
struct ConnectionRequest {
    reply: oneshot::Sender<Arc<Connection>>,
}

pub struct Server {
    config: Config,
    pools: DashMap<String, Arc<Pool>>,
    dispatch_tx: mpsc::Sender<ConnectionRequest>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<ConnectionRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: Config) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1);
        Arc::new(Self {
            config,
            pools: DashMap::new(),
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts the cleaner and dispatcher tasks. Calling `start` twice is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(requests) = self.dispatch_rx.lock().take() else {
            return;
        };

        let mut tasks = self.tasks.lock();

        let server = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEAN_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                server.clean();
            }
        }));

        let server = Arc::clone(self);
        tasks.push(tokio::spawn(server.dispatch(requests)));
    }

    /// Stops the background tasks and shuts every pool down. Requests in
    /// flight observe a lost dispatcher and fail with a proxy error.
    pub fn shutdown(&self) {
        info!("shutting down relay server");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pools.retain(|_, pool| {
            pool.shutdown();
            false
        });
    }

    // ─── Registration ───────────────────────────────────────────

    /// Adds a registered websocket to the pool named by the greeting,
    /// creating the pool on first use and refreshing its idle target.
    pub fn register(&self, greeting: &wire::Greeting, ws: WebSocket) {
        let pool = {
            let entry = self.pools.entry(greeting.id.clone()).or_insert_with(|| {
                info!(pool = %greeting.id, "creating connection pool");
                Pool::new(greeting.id.clone(), self.config.idle_timeout())
            });
            Arc::clone(entry.value())
        };
        pool.set_size(greeting.pool_idle_size);
        pool.register(ws);
    }

    pub fn has_pools(&self) -> bool {
        !self.pools.is_empty()
    }

    /// Snapshot of every pool's connection counters.
    pub fn pool_sizes(&self) -> Vec<(String, PoolSize)> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().size()))
            .collect()
    }

    // ─── Cleaning ───────────────────────────────────────────────

    /// Sweeps every pool, dropping the ones that lost all connections.
    pub fn clean(&self) {
        if self.pools.is_empty() {
            return;
        }

        let mut idle = 0usize;
        let mut busy = 0usize;
        self.pools.retain(|id, pool| {
            if pool.is_empty() {
                info!(pool = %id, "removing empty connection pool");
                pool.shutdown();
                return false;
            }
            let size = pool.size();
            idle += size.idle;
            busy += size.busy;
            true
        });
        debug!(pools = self.pools.len(), idle, busy, "pool sweep");
    }

    // ─── Dispatch ───────────────────────────────────────────────

    /// Asks the dispatcher for an idle connection, waiting at most the
    /// configured dispatch timeout. `None` when no connection could be
    /// claimed in time.
    pub async fn request_connection(&self) -> Option<Arc<Connection>> {
        let (reply, claimed) = oneshot::channel();
        self.dispatch_tx
            .send(ConnectionRequest { reply })
            .await
            .ok()?;
        claimed.await.ok()
    }

    /// Serves connection requests one at a time.
    async fn dispatch(self: Arc<Self>, mut requests: mpsc::Receiver<ConnectionRequest>) {
        while let Some(request) = requests.recv().await {
            let deadline = Instant::now() + self.config.dispatch_timeout();
            if let Some(connection) = self.find_connection(deadline).await {
                let _ = request.reply.send(connection);
            }
        }
    }

    /// Scans the pools' idle channels until a connection can be taken or
    /// the deadline passes. The scan order is shuffled per round so no pool
    /// starves the others.
    async fn find_connection(&self, deadline: Instant) -> Option<Arc<Connection>> {
        loop {
            if Instant::now() >= deadline {
                return None;
            }

            let mut pools: Vec<Arc<Pool>> = self
                .pools
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            if pools.is_empty() {
                return None;
            }
            pools.shuffle(&mut rand::thread_rng());

            for pool in &pools {
                if let Some(connection) = pool.poll_idle().await {
                    if connection.take() {
                        return Some(connection);
                    }
                    // Closed while enqueued; the clean pass already swept it.
                }
            }

            tokio::time::sleep(DISPATCH_RETRY_DELAY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(timeout_ms: u64) -> Config {
        Config {
            timeout: timeout_ms,
            secret_key: "secret".to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn new_server_has_no_pools() {
        let server = Server::new(test_config(100));
        assert!(!server.has_pools());
        assert!(server.pool_sizes().is_empty());
    }

    #[tokio::test]
    async fn dispatch_with_no_pools_fails_immediately() {
        let server = Server::new(test_config(5_000));
        server.start();

        let started = Instant::now();
        assert!(server.request_connection().await.is_none());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn clean_on_empty_registry_is_a_no_op() {
        let server = Server::new(test_config(100));
        server.clean();
        assert!(!server.has_pools());
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_fails() {
        let server = Server::new(test_config(100));
        server.start();
        server.shutdown();
        assert!(server.request_connection().await.is_none());
    }

    #[tokio::test]
    async fn start_twice_is_a_no_op() {
        let server = Server::new(test_config(100));
        server.start();
        server.start();
        assert_eq!(server.tasks.lock().len(), 2);
        server.shutdown();
    }
}
