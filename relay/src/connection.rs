//! # Relay Tunnel Connection
//!
//! One registered websocket between the relay and an agent. The connection
//! moves through `Idle → Busy → Idle → … → Closed`:
//!
//! - [`Connection::take`] is the only `Idle → Busy` transition; exactly one
//!   request handler holds a busy connection at a time.
//! - [`Connection::release`] is the only `Busy → Idle` transition; it stamps
//!   the idle timestamp and re-offers the connection to the pool's idle
//!   channel.
//! - [`Connection::close`] is terminal and idempotent; a closed connection
//!   never reopens and is swept by the pool cleaner.
//!
//! A dedicated read loop owns the receive half of the websocket and hands
//! frames to the request handler through a rendezvous: the handler registers
//! a one-shot waiter per frame it expects, and the read loop never pulls
//! more than one frame beyond the last consumed one. Response bodies
//! therefore flow through without the loop racing ahead of the handler.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tunnel_wire as wire;

/// Lifecycle states of a relay-side tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Busy,
    Closed,
}

/// Errors from one proxied exchange. All of them are terminal for the
/// connection: the relay cannot know whether the agent is still in frame
/// sync after a partial exchange, so the caller closes it.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unable to serialize request: {0}")]
    Envelope(#[from] wire::WireError),

    #[error("unable to write to tunnel: {0}")]
    Write(String),

    #[error("tunnel connection lost")]
    ConnectionLost,

    #[error("tunnel protocol violation: {0}")]
    Protocol(&'static str),
}

struct State {
    status: Status,
    idle_since: Instant,
}

pub struct Connection {
    pool_id: String,
    state: Mutex<State>,
    writer: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    /// Rendezvous lane: the request handler registers one waiter per frame
    /// it expects; the read loop fulfills them in arrival order. `close`
    /// drops the sender, which the read loop observes as end-of-channel.
    next_response: Mutex<Option<mpsc::Sender<oneshot::Sender<Message>>>>,
    idle_tx: mpsc::Sender<Arc<Connection>>,
}

impl Connection {
    /// Wraps a freshly upgraded websocket. The connection starts idle, is
    /// immediately offered to the pool, and its read loop is running by the
    /// time this returns.
    pub fn new(
        pool_id: String,
        idle_tx: mpsc::Sender<Arc<Connection>>,
        ws: WebSocket,
    ) -> Arc<Self> {
        let (writer, reader) = ws.split();
        let (next_tx, next_rx) = mpsc::channel(1);

        let connection = Arc::new(Self {
            pool_id,
            state: Mutex::new(State {
                status: Status::Idle,
                idle_since: Instant::now(),
            }),
            writer: tokio::sync::Mutex::new(writer),
            next_response: Mutex::new(Some(next_tx)),
            idle_tx,
        });

        connection.release();
        tokio::spawn(Arc::clone(&connection).read_loop(reader, next_rx));
        connection
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    /// How long the connection has been idle. Only meaningful while the
    /// status is [`Status::Idle`].
    pub fn idle_for(&self) -> Duration {
        self.state.lock().idle_since.elapsed()
    }

    /// Atomically claims an idle connection for a request handler. Fails if
    /// the connection is busy or closed, e.g. when it was closed while still
    /// enqueued on the idle channel.
    pub fn take(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != Status::Idle {
            return false;
        }
        state.status = Status::Busy;
        true
    }

    /// Returns the connection to the idle state and offers it to the pool.
    /// The offer runs on its own task so no lock is held while the idle
    /// channel waits for the dispatcher to drain it.
    pub fn release(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Idle;
            state.idle_since = Instant::now();
        }

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let _ = connection.idle_tx.send(Arc::clone(&connection)).await;
        });
    }

    /// Terminal transition. Idempotent; safe to call from the pool cleaner
    /// while the pool lock is held (nothing here blocks).
    pub fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Closed;
        }
        // Dropping the rendezvous sender unblocks a read loop parked on it.
        self.next_response.lock().take();

        info!(pool = %self.pool_id, "closing tunnel connection");
        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let mut writer = connection.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        });
    }

    /// Reads frames one at a time and hands each to the waiting request
    /// handler. Exits on peer close, read error, a data frame arriving while
    /// the connection is not busy (the two sides lost frame sync), or
    /// channel teardown. Every exit path closes the connection.
    async fn read_loop(
        self: Arc<Self>,
        mut reader: SplitStream<WebSocket>,
        mut next_response: mpsc::Receiver<oneshot::Sender<Message>>,
    ) {
        loop {
            if self.status() == Status::Closed {
                break;
            }

            let message = match reader.next().await {
                Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => message,
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong keepalive is handled by the websocket layer.
                Some(Ok(_)) => continue,
                Some(Err(error)) => {
                    debug!(pool = %self.pool_id, %error, "tunnel read failed");
                    break;
                }
            };

            if self.status() != Status::Busy {
                warn!(pool = %self.pool_id, "frame received outside a proxied exchange");
                break;
            }

            // Rendezvous: block until the handler asks for this frame. The
            // handler abandoning its waiter means the exchange failed and
            // the frame stream can no longer be trusted.
            let Some(waiter) = next_response.recv().await else {
                break;
            };
            if waiter.send(message).is_err() {
                break;
            }
        }

        self.close();
    }

    /// Runs one proxied exchange. The caller must have claimed the
    /// connection with [`Connection::take`]; on success the connection has
    /// already been released, on error the caller closes it.
    pub async fn proxy_request(
        self: &Arc<Self>,
        request: &wire::HttpRequest,
        body: Bytes,
    ) -> Result<(wire::HttpResponse, Bytes), ProxyError> {
        info!(pool = %self.pool_id, method = %request.method, url = %request.url, "proxying request");

        let envelope = request.to_json()?;
        {
            let mut writer = self.writer.lock().await;
            writer
                .send(Message::Text(envelope.into()))
                .await
                .map_err(|error| ProxyError::Write(error.to_string()))?;
            writer
                .send(Message::Binary(body))
                .await
                .map_err(|error| ProxyError::Write(error.to_string()))?;
        }

        let Message::Text(envelope) = self.next_frame().await? else {
            return Err(ProxyError::Protocol("expected text envelope frame"));
        };
        let response = wire::HttpResponse::from_json(envelope.as_str())?;

        let Message::Binary(body) = self.next_frame().await? else {
            return Err(ProxyError::Protocol("expected binary body frame"));
        };

        self.release();
        Ok((response, body))
    }

    /// One rendezvous round: registers a waiter and blocks until the read
    /// loop hands over the next frame.
    async fn next_frame(&self) -> Result<Message, ProxyError> {
        let sender = self
            .next_response
            .lock()
            .clone()
            .ok_or(ProxyError::ConnectionLost)?;
        let (waiter, frame) = oneshot::channel();
        sender
            .send(waiter)
            .await
            .map_err(|_| ProxyError::ConnectionLost)?;
        frame.await.map_err(|_| ProxyError::ConnectionLost)
    }
}
