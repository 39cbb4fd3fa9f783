//! # Agent Process Aggregate
//!
//! Owns one connection pool per configured relay target and the shared
//! HTTP client the pools execute forwarded requests with.

use crate::config::Config;
use crate::pool::{Pool, PoolSize};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

pub struct Client {
    config: Arc<Config>,
    http: reqwest::Client,
    pools: Mutex<Vec<Arc<Pool>>>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            http: reqwest::Client::new(),
            pools: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens one pool per configured relay target and starts their refill
    /// tickers.
    pub fn start(&self) {
        let mut pools = self.pools.lock();
        for target in &self.config.targets {
            info!(relay = %target, "starting connection pool");
            let pool = Pool::new(
                Arc::clone(&self.config),
                self.http.clone(),
                target.clone(),
            );
            pool.start();
            pools.push(pool);
        }
    }

    /// Snapshot of every pool's connection counters.
    pub fn pool_sizes(&self) -> Vec<(String, PoolSize)> {
        self.pools
            .lock()
            .iter()
            .map(|pool| (pool.target().to_string(), pool.size()))
            .collect()
    }

    /// Stops the refill tickers and closes every connection.
    pub async fn shutdown(&self) {
        let pools: Vec<_> = self.pools.lock().drain(..).collect();
        for pool in pools {
            pool.shutdown().await;
        }
    }
}
