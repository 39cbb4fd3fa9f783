//! # Relay Connection Pool
//!
//! Groups the tunnel connections registered under one agent identity. The
//! pool tracks the idle target the agent advertises in its greeting and
//! reaps surplus idle connections that outlive the idle timeout.
//!
//! Membership is only mutated under the pool guard; the guard is never held
//! across websocket I/O.

use crate::connection::{Connection, Status};
use axum::extract::ws::WebSocket;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

pub struct Pool {
    id: String,
    idle_timeout: Duration,
    idle_tx: mpsc::Sender<Arc<Connection>>,
    /// Receive side of the idle channel. The dispatcher is the sole
    /// consumer; connections enqueue themselves on release and park until
    /// it drains them.
    idle_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Connection>>>,
    inner: Mutex<Inner>,
}

struct Inner {
    connections: Vec<Arc<Connection>>,
    /// Idle target reported by the agent greeting; idle connections beyond
    /// this count are eligible for reaping.
    size: usize,
    done: bool,
}

impl Pool {
    pub fn new(id: String, idle_timeout: Duration) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::channel(1);
        Arc::new(Self {
            id,
            idle_timeout,
            idle_tx,
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            inner: Mutex::new(Inner {
                connections: Vec::new(),
                size: 0,
                done: false,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Refreshes the idle target from a new greeting.
    pub fn set_size(&self, size: usize) {
        self.inner.lock().size = size;
    }

    /// Wraps an upgraded websocket into a connection owned by this pool.
    /// After a shutdown the socket is dropped instead, which closes it.
    pub fn register(&self, ws: WebSocket) {
        let mut inner = self.inner.lock();
        if inner.done {
            return;
        }

        info!(pool = %self.id, "registering new tunnel connection");
        let connection = Connection::new(self.id.clone(), self.idle_tx.clone(), ws);
        inner.connections.push(connection);
    }

    /// Non-blocking poll of the idle channel, used by the dispatcher's scan.
    pub async fn poll_idle(&self) -> Option<Arc<Connection>> {
        self.idle_rx.lock().await.try_recv().ok()
    }

    /// Closes surplus idle connections that have been idle longer than the
    /// idle timeout, and drops closed connections from the list.
    pub fn clean(&self) {
        let mut inner = self.inner.lock();
        Self::clean_locked(&mut inner, self.idle_timeout);
    }

    fn clean_locked(inner: &mut Inner, idle_timeout: Duration) {
        let size = inner.size;
        let mut idle = 0usize;
        inner.connections.retain(|connection| {
            if connection.status() == Status::Idle {
                idle += 1;
                if idle > size && connection.idle_for() > idle_timeout {
                    connection.close();
                }
            }
            connection.status() != Status::Closed
        });
    }

    /// Runs a clean pass and reports whether the pool lost its last
    /// connection; empty pools are discarded by the server sweep.
    pub fn is_empty(&self) -> bool {
        let mut inner = self.inner.lock();
        Self::clean_locked(&mut inner, self.idle_timeout);
        inner.connections.is_empty()
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.done = true;
        for connection in &inner.connections {
            connection.close();
        }
        Self::clean_locked(&mut inner, self.idle_timeout);
    }

    pub fn size(&self) -> PoolSize {
        let inner = self.inner.lock();
        let mut size = PoolSize::default();
        for connection in &inner.connections {
            match connection.status() {
                Status::Idle => size.idle += 1,
                Status::Busy => size.busy += 1,
                Status::Closed => size.closed += 1,
            }
        }
        size
    }
}

/// Connection counters for one pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolSize {
    pub idle: usize,
    pub busy: usize,
    pub closed: usize,
}

impl fmt::Display for PoolSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} idle, {} busy, {} closed",
            self.idle, self.busy, self.closed
        )
    }
}
