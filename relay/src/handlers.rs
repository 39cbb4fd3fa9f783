//! # HTTP Handlers
//!
//! The relay's public surface:
//!
//! - `GET /register` — websocket upgrade for agents presenting the shared
//!   secret; the first text frame must be the greeting `<id>_<size>`.
//! - `ANY /request` — forwards the request through an idle tunnel
//!   connection to the URL named by `X-PROXY-DESTINATION`.
//! - `GET /status`  — liveness probe.
//!
//! Proxy-level failures are reported to the external client as HTTP 526
//! with the error text in the body.

use crate::server::Server;
use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tunnel_wire as wire;

/// Builds the relay's router.
pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/register", get(register))
        .route("/request", any(request))
        .route("/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(server)
}

/// Proxy-level failure reported to the external client.
fn proxy_error(message: impl Into<String>) -> Response {
    let message = message.into();
    warn!("{message}");
    let status = StatusCode::from_u16(wire::PROXY_ERROR_STATUS)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, message).into_response()
}

// ─── /register ──────────────────────────────────────────────────

/// `GET /register` — agent registration. The secret is checked before the
/// upgrade so rejected agents never reach the websocket layer.
async fn register(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let secret = server.config().secret_key.as_bytes();
    if secret.is_empty() {
        return proxy_error("Registration refused: no secret key configured");
    }

    let presented = headers
        .get(wire::SECRET_KEY_HEADER)
        .map(|value| value.as_bytes())
        .unwrap_or_default();
    if !bool::from(presented.ct_eq(secret)) {
        return proxy_error("Invalid X-SECRET-KEY");
    }

    ws.on_upgrade(move |socket| handshake(server, socket))
}

/// Reads and validates the greeting, then hands the socket to its pool.
/// Dropping the socket on any failure closes it without touching the pools.
async fn handshake(server: Arc<Server>, mut socket: WebSocket) {
    let greeting = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            warn!("unable to read greeting message");
            return;
        }
    };

    match wire::Greeting::parse(greeting.as_str()) {
        Ok(greeting) => server.register(&greeting, socket),
        Err(error) => warn!(%error, "rejecting registration"),
    }
}

// ─── /request ───────────────────────────────────────────────────

/// `ANY /request` — one proxied HTTP exchange.
async fn request(
    State(server): State<Arc<Server>>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let destination = parts
        .headers
        .get(wire::PROXY_DESTINATION_HEADER)
        .and_then(|value| value.to_str().ok());
    let Some(destination) = destination else {
        return proxy_error("Missing X-PROXY-DESTINATION header");
    };
    let destination = match destination.parse::<Uri>() {
        Ok(uri) if uri.scheme().is_some() => uri,
        _ => return proxy_error("Unable to parse X-PROXY-DESTINATION header"),
    };

    info!(method = %parts.method, url = %destination, "proxy request");

    if !server.has_pools() {
        return proxy_error("No proxy available");
    }

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => return proxy_error(format!("Unable to read request body: {error}")),
    };

    // Host and Content-Length travel as the destination URL and the
    // ContentLength field, not in the forwarded header map.
    let mut header = wire::headers_to_wire(&parts.headers);
    header.remove("host");
    header.remove("content-length");

    let envelope = wire::HttpRequest {
        method: parts.method.to_string(),
        url: destination.to_string(),
        header,
        content_length: body.len() as i64,
    };

    let Some(connection) = server.request_connection().await else {
        return proxy_error("Unable to get a proxy connection");
    };

    match connection.proxy_request(&envelope, body).await {
        Ok((response, body)) => match build_response(&response, body) {
            Ok(response) => response,
            Err(error) => proxy_error(format!("Unable to relay response: {error}")),
        },
        Err(error) => {
            connection.close();
            proxy_error(format!("Unable to proxy request: {error}"))
        }
    }
}

/// Rebuilds the external client's response from the tunnel envelope and the
/// buffered body. The body is re-framed locally, so its length headers are
/// left to the HTTP layer.
fn build_response(
    envelope: &wire::HttpResponse,
    body: Bytes,
) -> Result<Response, axum::http::Error> {
    let mut builder = Response::builder().status(envelope.status_code);
    for (name, values) in &envelope.header {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        for value in values {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(body))
}

// ─── /status ────────────────────────────────────────────────────

/// `GET /status` — liveness probe.
async fn status() -> &'static str {
    "ok"
}
