//! The synchronous handler contract.
//!
//! Handlers receive a fully buffered [`HandlerRequest`] and must populate a
//! [`HandlerResponse`] before returning. A handler never touches the live
//! connection: the request value is detached and owned, so the same handler
//! can run inline on the event-loop thread or on a worker thread.
//!
//! # Example
//!
//! ```
//! use argus_core::{Handler, HandlerRequest, HandlerResponse};
//! use http::StatusCode;
//!
//! fn get_stream(req: &HandlerRequest, res: &mut HandlerResponse) {
//!     match req.capture(0) {
//!         Some(name) => res.json(&serde_json::json!({ "name": name })),
//!         None => res.error(StatusCode::BAD_REQUEST, "missing stream name"),
//!     }
//! }
//!
//! let mut req = HandlerRequest::new(http::Method::GET, "/api/streams/front");
//! req.set_captures(vec!["front".to_string()]);
//! let mut res = HandlerResponse::new();
//! get_stream.handle(&req, &mut res);
//! assert_eq!(res.status(), StatusCode::OK);
//! ```

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{ConnectionId, Principal, RequestId};
use crate::error::CoreError;

/// Opaque owner reference handed to every handler invocation.
pub type Owner = Arc<dyn Any + Send + Sync>;

/// Where a registered handler executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Runs on the event-loop thread. Must not block.
    #[default]
    Inline,
    /// Submitted to the worker pool; may block on disk, database or network.
    Worker,
}

/// A request handler.
///
/// Implemented for every `Fn(&HandlerRequest, &mut HandlerResponse)` that is
/// `Send + Sync + 'static`.
pub trait Handler: Send + Sync + 'static {
    /// Handles a request by populating `res`.
    fn handle(&self, req: &HandlerRequest, res: &mut HandlerResponse);
}

impl<F> Handler for F
where
    F: Fn(&HandlerRequest, &mut HandlerResponse) + Send + Sync + 'static,
{
    fn handle(&self, req: &HandlerRequest, res: &mut HandlerResponse) {
        self(req, res);
    }
}

/// A detached, fully buffered request.
#[derive(Clone)]
pub struct HandlerRequest {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    captures: Vec<String>,
    connection_id: ConnectionId,
    request_id: RequestId,
    principal: Principal,
    owner: Option<Owner>,
}

impl HandlerRequest {
    /// Creates a request with an empty body, no headers and fresh ids.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            captures: Vec::new(),
            connection_id: ConnectionId::new(),
            request_id: RequestId::new(),
            principal: Principal::Anonymous,
            owner: None,
        }
    }

    /// Sets the raw query string (without the leading `?`).
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Sets the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the connection this request arrived on.
    #[must_use]
    pub fn with_connection_id(mut self, id: ConnectionId) -> Self {
        self.connection_id = id;
        self
    }

    /// Sets the authenticated caller.
    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }

    /// Sets the opaque owner reference.
    #[must_use]
    pub fn with_owner(mut self, owner: Option<Owner>) -> Self {
        self.owner = owner;
        self
    }

    /// Replaces the wildcard captures produced by the dispatcher.
    pub fn set_captures(&mut self, captures: Vec<String>) {
        self.captures = captures;
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the first value of a query parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        query_param(self.query.as_deref()?, name)
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the request body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_slice(&self.body).map_err(|e| CoreError::invalid_body(e.to_string()))
    }

    /// Returns the wildcard capture at `index`, in pattern order.
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.get(index).map(String::as_str)
    }

    /// Returns all wildcard captures.
    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    /// Returns the id of the connection the request arrived on.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Returns the request id.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Returns the authenticated caller.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Returns the owner reference downcast to `T`.
    pub fn owner<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.owner.as_ref()?.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for HandlerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("body_len", &self.body.len())
            .field("captures", &self.captures)
            .field("connection_id", &self.connection_id)
            .field("request_id", &self.request_id)
            .field("principal", &self.principal)
            .field("has_owner", &self.owner.is_some())
            .finish_non_exhaustive()
    }
}

/// Response populated by a handler.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    status: StatusCode,
    content_type: String,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Default for HandlerResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerResponse {
    /// Creates an empty `200 OK` JSON response.
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/json".to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Sets the status code.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Sets the content type.
    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }

    /// Adds a header. Invalid names or values are ignored with a warning.
    pub fn insert_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => tracing::warn!(header = name, "handler set an invalid response header"),
        }
    }

    /// Replaces the body with raw bytes.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize>(&mut self, value: &T) {
        match serde_json::to_vec(value) {
            Ok(body) => {
                self.content_type = "application/json".to_string();
                self.body = body;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize handler response");
                self.error(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response");
            }
        }
    }

    /// Sets a plain-text body.
    pub fn text(&mut self, text: impl Into<String>) {
        self.content_type = "text/plain; charset=utf-8".to_string();
        self.body = text.into().into_bytes();
    }

    /// Sets an error status with a `{"error": message}` body.
    pub fn error(&mut self, status: StatusCode, message: &str) {
        self.status = status;
        self.content_type = "application/json".to_string();
        self.body = serde_json::json!({ "error": message }).to_string().into_bytes();
    }

    /// Returns the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the content type.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Returns the extra headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Splits the response into its parts.
    pub fn into_parts(self) -> (StatusCode, String, HeaderMap, Vec<u8>) {
        (self.status, self.content_type, self.headers, self.body)
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).ok()?;
        if key != name {
            return None;
        }
        let value = value.replace('+', " ");
        urlencoding::decode(&value).ok().map(|v| v.into_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_closure_implements_handler() {
        let handler = |_req: &HandlerRequest, res: &mut HandlerResponse| res.text("ok");
        let req = HandlerRequest::new(Method::GET, "/");
        let mut res = HandlerResponse::new();
        handler.handle(&req, &mut res);
        assert_eq!(res.body(), b"ok");
        assert_eq!(res.content_type(), "text/plain; charset=utf-8");
    }

    #[test]
    fn test_query_param_decoding() {
        let req = HandlerRequest::new(Method::GET, "/api/ws")
            .with_query("client_id=abc%20def&x=1&flag");
        assert_eq!(req.query_param("client_id").as_deref(), Some("abc def"));
        assert_eq!(req.query_param("x").as_deref(), Some("1"));
        assert_eq!(req.query_param("flag").as_deref(), Some(""));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn test_query_param_plus_is_space() {
        let req = HandlerRequest::new(Method::GET, "/").with_query("q=front+door");
        assert_eq!(req.query_param("q").as_deref(), Some("front door"));
    }

    #[test]
    fn test_query_param_without_query() {
        let req = HandlerRequest::new(Method::GET, "/");
        assert_eq!(req.query_param("anything"), None);
    }

    #[test]
    fn test_json_body() {
        #[derive(Deserialize)]
        struct Body {
            name: String,
        }

        let req = HandlerRequest::new(Method::POST, "/api/streams")
            .with_body(r#"{"name":"garage"}"#);
        let body: Body = req.json().unwrap();
        assert_eq!(body.name, "garage");

        let bad = HandlerRequest::new(Method::POST, "/").with_body("not json");
        assert!(matches!(bad.json::<Body>(), Err(CoreError::InvalidBody(_))));
    }

    #[test]
    fn test_captures() {
        let mut req = HandlerRequest::new(Method::GET, "/api/streaming/cam1/hls/segment_4.ts");
        req.set_captures(vec!["cam1".into(), "4".into()]);
        assert_eq!(req.capture(0), Some("cam1"));
        assert_eq!(req.capture(1), Some("4"));
        assert_eq!(req.capture(2), None);
        assert_eq!(req.captures().len(), 2);
    }

    #[test]
    fn test_owner_downcast() {
        struct AppState {
            name: &'static str,
        }

        let owner: Owner = Arc::new(AppState { name: "nvr" });
        let req = HandlerRequest::new(Method::GET, "/").with_owner(Some(owner));
        assert_eq!(req.owner::<AppState>().map(|s| s.name), Some("nvr"));
        assert!(req.owner::<String>().is_none());
    }

    #[test]
    fn test_response_defaults() {
        let res = HandlerResponse::new();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.content_type(), "application/json");
        assert!(res.body().is_empty());
    }

    #[test]
    fn test_response_error_body() {
        let mut res = HandlerResponse::new();
        res.error(StatusCode::NOT_FOUND, "stream not found");
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let value: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(value["error"], "stream not found");
    }

    #[test]
    fn test_response_json_and_headers() {
        let mut res = HandlerResponse::new();
        res.json(&serde_json::json!({"ok": true}));
        res.insert_header("x-total-count", "3");
        res.insert_header("bad header", "x");
        assert_eq!(res.headers().get("x-total-count").unwrap(), "3");
        assert_eq!(res.headers().len(), 1);

        let (status, content_type, _, body) = res.into_parts();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "application/json");
        assert_eq!(body, br#"{"ok":true}"#);
    }

    #[test]
    fn test_execution_mode_default_is_inline() {
        assert_eq!(ExecutionMode::default(), ExecutionMode::Inline);
    }
}
