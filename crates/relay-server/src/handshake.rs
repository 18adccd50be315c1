//! Upgrade request processing: query parameters and early data.
//!
//! The tunnel smuggles two things through the WebSocket handshake itself:
//! optional egress parameters in the query string (`proxyip`, `mode`) and
//! optional early payload bytes, base64url-encoded in the
//! `Sec-WebSocket-Protocol` header to save a round trip.

use crate::session::{EgressMode, SessionParams};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio_tungstenite::tungstenite::handshake::server::Request;

/// Upgrade header that doubles as the early-data carrier.
pub const EARLY_DATA_HEADER: &str = "sec-websocket-protocol";

/// Extract per-session parameters from the upgrade request.
pub fn params_from_request(req: &Request) -> SessionParams {
    let query = request_query(req);
    let mode = match query_param(query.as_deref(), "mode").as_deref() {
        Some("direct") => EgressMode::Direct,
        _ => EgressMode::Auto,
    };
    let egress_override = query_param(query.as_deref(), "proxyip").filter(|v| !v.is_empty());
    let early_data = req
        .headers()
        .get(EARLY_DATA_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(decode_early_data);

    SessionParams {
        egress_override,
        mode,
        early_data,
    }
}

/// Query string of the upgrade request. Some clients percent-encode the
/// whole `?query` into the path (`/%3Fmode=direct`); recover it.
fn request_query(req: &Request) -> Option<String> {
    if let Some(query) = req.uri().query() {
        return Some(query.to_string());
    }
    let path = req.uri().path();
    if path.contains("%3F") || path.contains("%3f") {
        let decoded = percent_decode(path);
        if let Some((_, query)) = decoded.split_once('?') {
            return Some(query.to_string());
        }
    }
    None
}

/// Look up a single query parameter, percent-decoding its value.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return Some(percent_decode(v));
        }
    }
    None
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Minimal percent-decoding; invalid escapes pass through untouched.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decode base64url early data. Standard-alphabet input is normalized and
/// padding stripped first; undecodable input is treated as absent.
fn decode_early_data(value: &str) -> Option<Vec<u8>> {
    if value.is_empty() {
        return None;
    }
    let normalized: String = value
        .chars()
        .filter(|c| *c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    URL_SAFE_NO_PAD.decode(normalized).ok()
}
