//! # Tunnel Wire Protocol
//!
//! Defines the messages exchanged between the relay and its agents over
//! websocket connections. Every proxied HTTP exchange travels as two frame
//! pairs: a JSON text frame carrying the envelope, immediately followed by
//! a binary frame carrying the body.
//!
//! - [`HttpRequest`]  — request envelope, relay → agent
//! - [`HttpResponse`] — response envelope, agent → relay
//! - [`Greeting`]     — the first text frame an agent sends after upgrade
//!
//! The envelope field names (`Method`, `URL`, `Header`, `ContentLength`,
//! `StatusCode`) are part of the wire format and must not change.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Header carrying the shared secret during agent registration.
pub const SECRET_KEY_HEADER: &str = "X-SECRET-KEY";

/// Header naming the absolute destination URL of a proxied request.
pub const PROXY_DESTINATION_HEADER: &str = "X-PROXY-DESTINATION";

/// Status the relay reports to external clients for proxy-level failures
/// (no pool, dispatch timeout, tunnel loss).
pub const PROXY_ERROR_STATUS: u16 = 526;

/// Status an agent uses for synthetic in-tunnel error responses, so the
/// external client can tell a destination failure from a relay failure.
pub const TUNNEL_ERROR_STATUS: u16 = 527;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid greeting: {0}")]
    Greeting(String),

    #[error("invalid envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("invalid header: {0}")]
    Header(String),
}

// ─── Envelopes ──────────────────────────────────────────────────

/// Request envelope, sent by the relay as a JSON text frame. The request
/// body follows in a separate binary frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(rename = "Method")]
    pub method: String,

    /// Absolute destination URL the agent must execute the request against.
    #[serde(rename = "URL")]
    pub url: String,

    #[serde(rename = "Header")]
    pub header: HashMap<String, Vec<String>>,

    #[serde(rename = "ContentLength")]
    pub content_length: i64,
}

impl HttpRequest {
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Response envelope, sent by the agent as a JSON text frame. The response
/// body follows in a separate binary frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    #[serde(rename = "StatusCode")]
    pub status_code: u16,

    #[serde(rename = "Header")]
    pub header: HashMap<String, Vec<String>>,

    #[serde(rename = "ContentLength")]
    pub content_length: i64,
}

impl HttpResponse {
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Synthetic envelope an agent sends when it cannot execute a forwarded
    /// request. The error text travels as the response body.
    pub fn tunnel_error(message: &str) -> Self {
        Self {
            status_code: TUNNEL_ERROR_STATUS,
            header: HashMap::new(),
            content_length: message.len() as i64,
        }
    }
}

// ─── Greeting ───────────────────────────────────────────────────

/// The first text frame on a freshly upgraded tunnel connection, announcing
/// the agent identity and the pool's idle target: `<id>_<idle-size>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub id: String,
    pub pool_idle_size: usize,
}

impl Greeting {
    pub fn encode(&self) -> String {
        format!("{}_{}", self.id, self.pool_idle_size)
    }

    /// Parses a greeting frame. The size is everything after the last `_`,
    /// so agent ids containing underscores stay valid.
    pub fn parse(raw: &str) -> Result<Self, WireError> {
        let (id, size) = raw
            .rsplit_once('_')
            .ok_or_else(|| WireError::Greeting(format!("missing separator in {raw:?}")))?;
        let pool_idle_size = size
            .parse::<usize>()
            .map_err(|_| WireError::Greeting(format!("bad pool size in {raw:?}")))?;
        Ok(Self {
            id: id.to_string(),
            pool_idle_size,
        })
    }
}

// ─── Header conversions ─────────────────────────────────────────

/// Flattens a typed header map into the wire representation.
pub fn headers_to_wire(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// Rebuilds a typed header map from the wire representation.
pub fn headers_from_wire(map: &HashMap<String, Vec<String>>) -> Result<HeaderMap, WireError> {
    let mut headers = HeaderMap::new();
    for (name, values) in map {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|error| WireError::Header(error.to_string()))?;
        for value in values {
            let value = HeaderValue::from_str(value)
                .map_err(|error| WireError::Header(error.to_string()))?;
            headers.append(name.clone(), value);
        }
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_headers() -> HashMap<String, Vec<String>> {
        let mut header = HashMap::new();
        header.insert("content-type".to_string(), vec!["text/plain".to_string()]);
        header.insert(
            "x-custom".to_string(),
            vec!["one".to_string(), "two".to_string()],
        );
        header
    }

    // ── envelope round-trips ─────────────────────────────────────────

    #[test]
    fn request_round_trip_preserves_all_fields() {
        let request = HttpRequest {
            method: "POST".to_string(),
            url: "http://internal.service/path?q=1".to_string(),
            header: sample_headers(),
            content_length: 42,
        };

        let decoded = HttpRequest::from_json(&request.to_json().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn request_uses_wire_field_names() {
        let request = HttpRequest {
            method: "GET".to_string(),
            url: "http://x/".to_string(),
            header: HashMap::new(),
            content_length: 0,
        };

        let json = request.to_json().unwrap();
        for field in ["\"Method\"", "\"URL\"", "\"Header\"", "\"ContentLength\""] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }

    #[test]
    fn response_round_trip_preserves_status_and_headers() {
        let response = HttpResponse {
            status_code: 204,
            header: sample_headers(),
            content_length: 0,
        };

        let decoded = HttpResponse::from_json(&response.to_json().unwrap()).unwrap();
        assert_eq!(decoded.status_code, 204);
        assert_eq!(decoded.header, response.header);
    }

    #[test]
    fn response_uses_wire_field_names() {
        let response = HttpResponse {
            status_code: 200,
            header: HashMap::new(),
            content_length: 2,
        };

        let json = response.to_json().unwrap();
        for field in ["\"StatusCode\"", "\"Header\"", "\"ContentLength\""] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }

    #[test]
    fn tunnel_error_envelope_carries_message_length() {
        let envelope = HttpResponse::tunnel_error("connection refused");
        assert_eq!(envelope.status_code, TUNNEL_ERROR_STATUS);
        assert!(envelope.header.is_empty());
        assert_eq!(envelope.content_length, "connection refused".len() as i64);
    }

    // ── greeting ─────────────────────────────────────────────────────

    #[test]
    fn greeting_round_trip() {
        let greeting = Greeting {
            id: "d5a21a38-ffbb-4df7-8b55-55c98d0a7d07".to_string(),
            pool_idle_size: 10,
        };
        assert_eq!(Greeting::parse(&greeting.encode()).unwrap(), greeting);
    }

    #[test]
    fn greeting_splits_on_last_separator() {
        let greeting = Greeting::parse("my_agent_7").unwrap();
        assert_eq!(greeting.id, "my_agent");
        assert_eq!(greeting.pool_idle_size, 7);
    }

    #[test]
    fn greeting_without_separator_is_rejected() {
        assert!(Greeting::parse("noseparator").is_err());
    }

    #[test]
    fn greeting_with_non_integer_size_is_rejected() {
        assert!(Greeting::parse("agent_ten").is_err());
        assert!(Greeting::parse("agent_").is_err());
        assert!(Greeting::parse("agent_-3").is_err());
    }

    // ── header conversions ───────────────────────────────────────────

    #[test]
    fn headers_round_trip_including_repeats() {
        let wire = sample_headers();
        let typed = headers_from_wire(&wire).unwrap();
        assert_eq!(typed.get_all("x-custom").iter().count(), 2);
        assert_eq!(headers_to_wire(&typed), wire);
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let mut wire = HashMap::new();
        wire.insert("bad name".to_string(), vec!["v".to_string()]);
        assert!(headers_from_wire(&wire).is_err());
    }
}
