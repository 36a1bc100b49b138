//! WebSocket URL and handshake request construction
//!
//! The API credential travels as a query parameter on the connection URL,
//! so every place a URL can reach a log line goes through [`redacted`].

use super::error::TransportError;
use base64::Engine;
use url::Url;

/// Query parameter carrying the API credential
const API_KEY_PARAM: &str = "api_key";

/// Build the connection URL with the credential attached.
///
/// Accepts http(s) forms and rewrites them to ws(s).
pub(super) fn build_ws_url(ws_url: &str, api_key: &str) -> Result<Url, TransportError> {
    let normalized = ws_url
        .replace("https://", "wss://")
        .replace("http://", "ws://");

    let mut url =
        Url::parse(&normalized).map_err(|e| TransportError::Network(e.to_string()))?;
    url.query_pairs_mut().append_pair(API_KEY_PARAM, api_key);
    Ok(url)
}

/// Render a connection URL with the credential masked, safe for logs
pub(super) fn redacted(url: &Url) -> String {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if k == API_KEY_PARAM {
                (k.into_owned(), "***".to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();

    let mut safe = url.clone();
    safe.query_pairs_mut().clear().extend_pairs(pairs);
    safe.to_string()
}

/// Build the WebSocket upgrade request for the handshake
pub(super) fn build_ws_request(url: &Url) -> Result<http::Request<()>, TransportError> {
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::Network("Invalid URL: no host".to_string()))?;

    http::Request::builder()
        .uri(url.as_str())
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", generate_ws_key())
        .header("Sec-WebSocket-Version", "13")
        .body(())
        .map_err(|e| TransportError::Network(e.to_string()))
}

/// Generate a random WebSocket key
fn generate_ws_key() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut key = [0u8; 16];
    rng.fill(&mut key);
    base64::engine::general_purpose::STANDARD.encode(key)
}
