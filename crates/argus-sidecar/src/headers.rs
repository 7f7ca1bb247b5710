//! Header filtering between the client and the companion service.

use http::header::{self, HeaderMap};

/// Hop-by-hop headers (RFC 9110 section 7.6.1), never forwarded.
pub static HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client credentials for this server, kept away from the companion service.
pub static CREDENTIAL_HEADERS: &[&str] = &["authorization", "cookie", "x-api-key", "x-session-token"];

/// Check if a header is hop-by-hop.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Headers listed in the `Connection` header are hop-by-hop too.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn filter(headers: &HeaderMap, also_drop: &[&str]) -> HeaderMap {
    let listed = connection_tokens(headers);
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || listed.iter().any(|t| t == name_str)
            || also_drop.contains(&name_str)
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Filter client headers before forwarding to the companion service.
///
/// `Host` and `Content-Length` are dropped as well; the client sets them for
/// the upstream connection.
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut drop = vec!["host", "content-length"];
    drop.extend_from_slice(CREDENTIAL_HEADERS);
    filter(headers, &drop)
}

/// Filter companion response headers before returning them to the client.
///
/// `Content-Length` is recomputed from the buffered body.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    filter(headers, &["content-length"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[test]
    fn test_request_filter() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-custom-hop"));
        headers.insert("x-custom-hop", HeaderValue::from_static("1"));
        headers.insert(header::HOST, HeaderValue::from_static("nvr.local"));
        headers.insert(header::COOKIE, HeaderValue::from_static("session=abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-"));
        headers.append(header::ACCEPT, HeaderValue::from_static("video/mp4"));
        headers.append(header::ACCEPT, HeaderValue::from_static("*/*"));

        let filtered = filter_request_headers(&headers);
        assert!(filtered.get(header::CONNECTION).is_none());
        assert!(filtered.get("x-custom-hop").is_none());
        assert!(filtered.get(header::HOST).is_none());
        assert!(filtered.get(header::COOKIE).is_none());
        assert!(filtered.get(header::AUTHORIZATION).is_none());
        assert_eq!(filtered[header::RANGE], "bytes=0-");
        assert_eq!(filtered.get_all(header::ACCEPT).iter().count(), 2);
    }

    #[test]
    fn test_response_filter() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/vnd.apple.mpegurl"));

        let filtered = filter_response_headers(&headers);
        assert!(filtered.get(header::TRANSFER_ENCODING).is_none());
        assert!(filtered.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(filtered[header::CONTENT_TYPE], "application/vnd.apple.mpegurl");
    }
}
