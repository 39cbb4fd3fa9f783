//! # Agent Tunnel Connection
//!
//! One outbound websocket to a relay. The connection moves through
//! `Connecting → Idle → Running`:
//!
//! - `Connecting` covers the dial and the greeting handshake;
//! - `Idle` means the connection is parked, waiting for the relay to
//!   forward a request;
//! - `Running` covers one proxied exchange; at most one request is in
//!   flight per connection.
//!
//! A destination failure is reported back through the tunnel as a synthetic
//! 527 response and the connection keeps serving. Any websocket failure is
//! terminal: the connection closes and removes itself from its pool, and
//! the refill ticker replaces it.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use bytes::Bytes;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tunnel_wire as wire;

use crate::pool::Pool;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Interval between keepalive pings.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Write deadline for a keepalive ping; a relay that cannot absorb a ping
/// within this window is treated as dead.
const KEEPALIVE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle states of an agent-side tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Idle,
    Running,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("websocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("envelope error: {0}")]
    Wire(#[from] wire::WireError),

    #[error("invalid secret key")]
    Secret,

    #[error("connection not established")]
    NotConnected,
}

/// Errors from executing a forwarded request against its destination.
/// These are reported in-band and do not cost the connection.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("invalid method {0:?}")]
    Method(String),

    #[error("invalid header: {0}")]
    Header(#[from] wire::WireError),

    #[error("unable to execute request: {0}")]
    Request(#[from] reqwest::Error),
}

pub struct Connection {
    status: Mutex<Status>,
    /// Write half of the websocket, shared between the serve loop and the
    /// keepalive task. `None` until the dial completes and after close.
    sink: tokio::sync::Mutex<Option<WsSink>>,
}

impl Connection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Status::Connecting),
            sink: tokio::sync::Mutex::new(None),
        })
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    /// Dials the relay and serves forwarded requests until the connection
    /// dies, then removes itself from the pool. The whole lifetime of a
    /// connection runs inside this call.
    pub async fn run(self: &Arc<Self>, pool: &Arc<Pool>) {
        match self.connect(pool).await {
            Ok(stream) => self.serve(pool, stream).await,
            Err(error) => warn!(relay = %pool.target(), %error, "unable to connect"),
        }
        pool.remove(self);
        self.close().await;
    }

    /// Dials the target and performs the greeting handshake.
    async fn connect(&self, pool: &Arc<Pool>) -> Result<SplitStream<WsStream>, TunnelError> {
        info!(relay = %pool.target(), "connecting to relay");

        let mut request = pool.target().into_client_request()?;
        let secret =
            HeaderValue::from_str(pool.secret_key()).map_err(|_| TunnelError::Secret)?;
        request.headers_mut().insert(wire::SECRET_KEY_HEADER, secret);

        let (stream, _) = connect_async(request).await?;
        info!(relay = %pool.target(), "connected to relay");

        let (mut sink, stream) = stream.split();
        sink.send(Message::Text(pool.greeting().encode().into()))
            .await?;

        *self.sink.lock().await = Some(sink);
        Ok(stream)
    }

    /// Handles forwarded requests until the websocket dies. One request
    /// cycle: envelope text frame, body binary frame, execution, response
    /// envelope + body frames.
    async fn serve(self: &Arc<Self>, pool: &Arc<Pool>, mut stream: SplitStream<WsStream>) {
        let keepalive = tokio::spawn(Arc::clone(self).keepalive());

        loop {
            self.set_status(Status::Idle);

            let Some(envelope) = next_data_frame(&mut stream).await else {
                break;
            };
            self.set_status(Status::Running);
            // Cover the idle slot this connection just vacated.
            pool.refill();

            let Message::Text(envelope) = envelope else {
                let _ = self.send_error("expected text request envelope").await;
                break;
            };
            let request = match wire::HttpRequest::from_json(envelope.as_str()) {
                Ok(request) => request,
                Err(error) => {
                    let _ = self
                        .send_error(&format!("unable to deserialize request: {error}"))
                        .await;
                    break;
                }
            };

            let Some(body) = next_data_frame(&mut stream).await else {
                break;
            };
            let Message::Binary(body) = body else {
                let _ = self.send_error("expected binary request body").await;
                break;
            };

            info!(method = %request.method, url = %request.url, "executing request");

            let (response, response_body) = match self.execute(pool, &request, body).await {
                Ok(result) => result,
                Err(error) => {
                    // Destination failure: report it through the tunnel and
                    // keep serving, unless the report itself cannot be sent.
                    if self.send_error(&error.to_string()).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if let Err(error) = self.send_response(&response, response_body).await {
                debug!(%error, "unable to write response");
                break;
            }
        }

        keepalive.abort();
    }

    /// Executes one forwarded request against its destination.
    async fn execute(
        &self,
        pool: &Arc<Pool>,
        request: &wire::HttpRequest,
        body: Bytes,
    ) -> Result<(wire::HttpResponse, Bytes), ExecuteError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ExecuteError::Method(request.method.clone()))?;
        let headers = wire::headers_from_wire(&request.header)?;

        let response = pool
            .http()
            .request(method, &request.url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status_code = response.status().as_u16();
        let header = wire::headers_to_wire(response.headers());
        let body = response.bytes().await?;

        let envelope = wire::HttpResponse {
            status_code,
            header,
            content_length: body.len() as i64,
        };
        Ok((envelope, body))
    }

    async fn send_response(
        &self,
        envelope: &wire::HttpResponse,
        body: Bytes,
    ) -> Result<(), TunnelError> {
        let json = envelope.to_json()?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TunnelError::NotConnected)?;
        sink.send(Message::Text(json.into())).await?;
        sink.send(Message::Binary(body)).await?;
        Ok(())
    }

    /// Reports a request failure to the relay as a synthetic 527 response
    /// with the error text as the body.
    async fn send_error(&self, message: &str) -> Result<(), TunnelError> {
        warn!("{message}");
        let envelope = wire::HttpResponse::tunnel_error(message);
        self.send_response(&envelope, Bytes::from(message.to_string()))
            .await
    }

    /// Pings the relay every 30 seconds. Exits when the connection closes
    /// or a ping misses its write deadline; the serve loop aborts this task
    /// when it returns, so the keepalive never outlives its connection.
    async fn keepalive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
        ticker.tick().await;
        loop {
            ticker.tick().await;

            let mut guard = self.sink.lock().await;
            let Some(sink) = guard.as_mut() else {
                break;
            };
            let ping = sink.send(Message::Ping(Bytes::new()));
            match timeout(KEEPALIVE_WRITE_TIMEOUT, ping).await {
                Ok(Ok(())) => {}
                _ => {
                    warn!("keepalive failed, closing connection");
                    drop(guard);
                    self.close().await;
                    break;
                }
            }
        }
    }

    /// Closes the websocket. Idempotent; later calls are no-ops.
    pub async fn close(&self) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };
        let _ = sink.close().await;
    }
}

/// Next text or binary frame from the stream, skipping keepalive traffic.
/// `None` on close or error, both terminal.
async fn next_data_frame(stream: &mut SplitStream<WsStream>) -> Option<Message> {
    loop {
        match stream.next().await? {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => return Some(message),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(error) => {
                debug!(%error, "tunnel read failed");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_connection_is_connecting() {
        let connection = Connection::new();
        assert_eq!(connection.status(), Status::Connecting);
    }

    #[tokio::test]
    async fn close_before_connect_is_a_no_op() {
        let connection = Connection::new();
        connection.close().await;
        connection.close().await;
        assert_eq!(connection.status(), Status::Connecting);
    }

    #[tokio::test]
    async fn send_before_connect_reports_not_connected() {
        let connection = Connection::new();
        let result = connection.send_error("boom").await;
        assert!(matches!(result, Err(TunnelError::NotConnected)));
    }
}
