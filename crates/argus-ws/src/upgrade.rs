//! HTTP upgrade handshake (RFC 6455).
//!
//! The server validates the request and answers `101 Switching Protocols`
//! itself; once hyper hands over the raw stream, [`complete_upgrade`] wraps
//! it in a server-role WebSocket.

use std::borrow::Cow;

use base64::Engine;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::Full;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::Role;

use crate::error::{WsError, WsResult};

/// The WebSocket magic GUID used in the handshake.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Check if the headers describe a WebSocket upgrade request.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    validate_upgrade_request(headers).is_ok()
}

fn has_upgrade_header(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
}

fn has_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn websocket_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn has_websocket_version(headers: &HeaderMap) -> bool {
    headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "13")
}

/// Compute the Sec-WebSocket-Accept value from the key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Validate a WebSocket upgrade request.
///
/// Returns the accept key if valid, or an error describing why it's invalid.
pub fn validate_upgrade_request(headers: &HeaderMap) -> WsResult<String> {
    if !has_upgrade_header(headers) {
        return Err(WsError::not_websocket("missing Connection: Upgrade header"));
    }
    if !has_websocket_upgrade(headers) {
        return Err(WsError::not_websocket("missing Upgrade: websocket header"));
    }
    let key = websocket_key(headers)
        .ok_or_else(|| WsError::not_websocket("missing Sec-WebSocket-Key header"))?;
    if !has_websocket_version(headers) {
        return Err(WsError::not_websocket(
            "missing or unsupported Sec-WebSocket-Version header (must be 13)",
        ));
    }
    Ok(compute_accept_key(key))
}

/// Builds the `101 Switching Protocols` response for an accept key.
pub fn switching_protocols(accept_key: &str) -> WsResult<Response<Full<Bytes>>> {
    let accept = HeaderValue::from_str(accept_key)
        .map_err(|e| WsError::not_websocket(format!("invalid accept key: {e}")))?;
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    Ok(response)
}

/// Extracts a caller-chosen client id from a raw query string.
pub fn requested_client_id(query: Option<&str>, param: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == param)
        .and_then(|(_, value)| urlencoding::decode(&value.replace('+', " ")).ok().map(Cow::into_owned))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Wraps an already-upgraded stream as a server-side WebSocket.
pub async fn complete_upgrade<S>(stream: S) -> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    WebSocketStream::from_raw_socket(stream, Role::Server, None).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers
    }

    #[test]
    fn test_accept_key_rfc_sample() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_valid_request() {
        let headers = upgrade_headers();
        assert!(is_websocket_request(&headers));
        assert_eq!(
            validate_upgrade_request(&headers).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_missing_headers_rejected() {
        let mut headers = upgrade_headers();
        headers.remove(header::UPGRADE);
        assert!(!is_websocket_request(&headers));

        let mut headers = upgrade_headers();
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        let err = validate_upgrade_request(&headers).unwrap_err();
        assert!(err.to_string().contains("Sec-WebSocket-Version"));
    }

    #[test]
    fn test_switching_protocols_response() {
        let response = switching_protocols("abc=").unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[header::SEC_WEBSOCKET_ACCEPT], "abc=");
        assert_eq!(response.headers()[header::UPGRADE], "websocket");
    }

    #[test]
    fn test_requested_client_id() {
        assert_eq!(
            requested_client_id(Some("a=1&client_id=wall%201"), "client_id"),
            Some("wall 1".to_string())
        );
        assert_eq!(
            requested_client_id(Some("client_id=front+door"), "client_id"),
            Some("front door".to_string())
        );
        assert_eq!(requested_client_id(Some("client_id=+%20"), "client_id"), None);
        assert_eq!(requested_client_id(Some("client_id="), "client_id"), None);
        assert_eq!(requested_client_id(Some("other=x"), "client_id"), None);
        assert_eq!(requested_client_id(None, "client_id"), None);
    }
}
