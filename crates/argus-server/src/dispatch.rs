//! The per-request pipeline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use argus_core::{
    ConnectionId, ExecutionMode, Handler, HandlerRequest, HandlerResponse, Owner, Principal,
    Versioned,
};
use argus_router::Router;
use argus_sidecar::{MediaProxy, ProxyRequest};
use argus_tasks::{Job, WorkerPool};
use argus_telemetry::metrics::record_http_request;
use argus_ws::upgrade::{complete_upgrade, requested_client_id, switching_protocols, validate_upgrade_request};
use argus_ws::{serve_client, Hub};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::auth::{authenticate, deny_response, AuthOutcome, SessionStore};
use crate::config::{AccessPolicy, ServerConfig};
use crate::registry::{CloseSignal, ConnectionGuard, ConnectionRegistry};
use crate::static_files::StaticFiles;
use crate::HttpResponse;

/// A registered handler and where it runs.
#[derive(Clone)]
pub(crate) struct RouteTarget {
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) mode: ExecutionMode,
}

/// Per-connection context shared by every request on the connection.
#[derive(Clone)]
pub(crate) struct ConnContext {
    pub(crate) id: ConnectionId,
    pub(crate) close: Arc<CloseSignal>,
    pub(crate) guard: Arc<ConnectionGuard>,
}

impl ConnContext {
    pub(crate) fn new(guard: ConnectionGuard) -> Self {
        Self {
            id: guard.id(),
            close: Arc::clone(guard.close_signal()),
            guard: Arc::new(guard),
        }
    }
}

/// Everything the pipeline reads while serving.
pub(crate) struct Dispatcher {
    pub(crate) config: ServerConfig,
    pub(crate) router: Router<RouteTarget>,
    pub(crate) policy: Arc<Versioned<AccessPolicy>>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) hub: Hub,
    pub(crate) proxy: Option<MediaProxy>,
    pub(crate) pool: Option<Arc<WorkerPool>>,
    pub(crate) static_files: Option<StaticFiles>,
    pub(crate) owner: Option<Owner>,
    /// Upgraded WebSocket connections, drained by the event loop at
    /// teardown.
    pub(crate) ws_tasks: Mutex<JoinSet<()>>,
}

pub(crate) fn json_error(status: StatusCode, message: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn with_header(mut response: HttpResponse, name: header::HeaderName, value: &'static str) -> HttpResponse {
    response
        .headers_mut()
        .insert(name, HeaderValue::from_static(value));
    response
}

fn redirect(location: &str) -> HttpResponse {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn is_api_path(path: &str) -> bool {
    path == "/api" || path.starts_with("/api/")
}

/// Converts a populated handler response into an HTTP response.
pub(crate) fn into_http(response: HandlerResponse) -> HttpResponse {
    let (status, content_type, headers, body) = response.into_parts();
    let mut builder = Response::builder().status(status);
    if !body.is_empty() || !content_type.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    let mut response = builder
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| json_error(StatusCode::INTERNAL_SERVER_ERROR, "invalid response"));
    response.headers_mut().extend(headers);
    response
}

impl Dispatcher {
    /// Serves one request end to end.
    pub(crate) async fn handle(self: Arc<Self>, req: Request<Incoming>, conn: ConnContext) -> HttpResponse {
        let started = Instant::now();
        let policy = self.policy.load();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let origin = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.registry.record_request();

        let (route, mut response) = self.route(req, &method, &path, &policy, &conn).await;

        if !response.headers().contains_key(crate::cors::headers::ALLOW_ORIGIN) {
            policy.cors.apply(origin.as_deref(), response.headers_mut());
        }
        let sent = response.body().size_hint().exact().unwrap_or(0);
        self.registry.record_sent(sent);
        let status = response.status().as_u16();
        record_http_request(&route, status);
        debug!(
            connection_id = %conn.id,
            %method,
            %path,
            route = %route,
            status,
            elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "request served"
        );
        response
    }

    async fn route(
        &self,
        mut req: Request<Incoming>,
        method: &Method,
        path: &str,
        policy: &AccessPolicy,
        conn: &ConnContext,
    ) -> (String, HttpResponse) {
        if path == self.config.ws_path {
            if !policy.auth.is_public(method, path) {
                if let AuthOutcome::Deny(reason) =
                    authenticate(&policy.auth, self.sessions.as_ref(), req.headers())
                {
                    debug!(connection_id = %conn.id, ?reason, "WebSocket upgrade refused");
                    return ("ws".into(), deny_response(path, reason));
                }
            }
            return ("ws".into(), self.upgrade(&mut req, conn));
        }

        let (parts, body) = req.into_parts();

        if policy.auth.is_static_asset(path) && (method == Method::GET || method == Method::HEAD) {
            return ("static".into(), self.serve_static(path, &parts.headers, method));
        }

        if method == Method::OPTIONS {
            let origin = parts.headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
            return ("preflight".into(), policy.cors.preflight(origin));
        }

        let principal = if policy.auth.is_public(method, path) {
            Principal::Anonymous
        } else {
            match authenticate(&policy.auth, self.sessions.as_ref(), &parts.headers) {
                AuthOutcome::Allow(principal) => principal,
                AuthOutcome::Deny(reason) => {
                    debug!(connection_id = %conn.id, %path, ?reason, "request refused");
                    return ("auth".into(), deny_response(path, reason));
                }
            }
        };

        if let Some(proxy) = self.proxy.as_ref().filter(|p| p.matches(path)) {
            let body = match self.read_body(body, &parts.headers).await {
                Ok(body) => body,
                Err(response) => return ("proxy".into(), response),
            };
            return ("proxy".into(), self.forward(proxy, parts, body).await);
        }

        if let Some(hit) = self.router.match_route(method, path) {
            let label = hit.pattern.to_string();
            let target = hit.target.clone();
            let captures = hit.captures.into_vec();
            let body = match self.read_body(body, &parts.headers).await {
                Ok(body) => body,
                Err(response) => return (label, response),
            };

            let mut request = HandlerRequest::new(method.clone(), path)
                .with_headers(parts.headers)
                .with_body(body)
                .with_connection_id(conn.id)
                .with_principal(principal)
                .with_owner(self.owner.clone());
            if let Some(query) = parts.uri.query() {
                request = request.with_query(query);
            }
            request.set_captures(captures);

            return (label, self.invoke(target, request, conn.id).await);
        }

        ("fallback".into(), self.fallback(method, path, &parts.headers))
    }

    async fn read_body(&self, body: Incoming, headers: &HeaderMap) -> Result<Bytes, HttpResponse> {
        let limit = self.config.max_body_bytes;
        let too_large = || {
            with_header(
                json_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
                header::CONNECTION,
                "close",
            )
        };
        if content_length(headers).is_some_and(|len| len > limit as u64) {
            return Err(too_large());
        }

        match tokio::time::timeout(self.config.body_timeout(), Limited::new(body, limit).collect()).await {
            Ok(Ok(collected)) => {
                let bytes = collected.to_bytes();
                self.registry.record_received(bytes.len() as u64);
                Ok(bytes)
            }
            Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => Err(too_large()),
            Ok(Err(e)) => {
                debug!(error = %e, "failed to read request body");
                Err(with_header(
                    json_error(StatusCode::BAD_REQUEST, "failed to read request body"),
                    header::CONNECTION,
                    "close",
                ))
            }
            Err(_) => Err(with_header(
                json_error(StatusCode::REQUEST_TIMEOUT, "request body timed out"),
                header::CONNECTION,
                "close",
            )),
        }
    }

    async fn invoke(&self, target: RouteTarget, request: HandlerRequest, id: ConnectionId) -> HttpResponse {
        match target.mode {
            ExecutionMode::Inline => {
                let mut response = HandlerResponse::new();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    target.handler.handle(&request, &mut response);
                }));
                match outcome {
                    Ok(()) => into_http(response),
                    Err(_) => {
                        error!(connection_id = %id, path = %request.path(), "inline handler panicked");
                        json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                    }
                }
            }
            ExecutionMode::Worker => self.submit(target.handler, request, id).await,
        }
    }

    async fn submit(&self, handler: Arc<dyn Handler>, request: HandlerRequest, id: ConnectionId) -> HttpResponse {
        let Some(pool) = &self.pool else {
            error!(path = %request.path(), "worker route registered without a worker pool");
            return json_error(StatusCode::SERVICE_UNAVAILABLE, "no worker pool");
        };

        let (reply, receiver) = oneshot::channel();
        let registry = Arc::clone(&self.registry);
        let job = Job::new(id, move || {
            let mut response = HandlerResponse::new();
            handler.handle(&request, &mut response);
            if !registry.is_live(id) {
                debug!(connection_id = %id, "connection closed, worker reply discarded");
                return;
            }
            if reply.send(response).is_err() {
                debug!(connection_id = %id, "request gone, worker reply discarded");
            }
        });

        if let Err(e) = pool.try_submit(job) {
            warn!(connection_id = %id, error = %e, "worker submission rejected");
            return with_header(
                json_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
                header::RETRY_AFTER,
                "1",
            );
        }

        match receiver.await {
            Ok(response) => into_http(response),
            Err(_) => {
                error!(connection_id = %id, "worker job ended without a reply");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    async fn forward(&self, proxy: &MediaProxy, parts: Parts, body: Bytes) -> HttpResponse {
        let request = ProxyRequest::new(parts.method, parts.uri.path())
            .with_query(parts.uri.query().map(str::to_string))
            .with_headers(parts.headers)
            .with_body(body);

        match proxy.forward(request).await {
            Ok(upstream) => {
                let mut response = Response::new(Full::new(upstream.body));
                *response.status_mut() = upstream.status;
                *response.headers_mut() = upstream.headers;
                response
            }
            Err(e) => {
                let response = json_error(e.status_code(), &e.to_string());
                match e.retry_after() {
                    Some(_) => with_header(response, header::RETRY_AFTER, "1"),
                    None => response,
                }
            }
        }
    }

    fn upgrade(&self, req: &mut Request<Incoming>, conn: &ConnContext) -> HttpResponse {
        let hub = &self.hub;
        let accept = match validate_upgrade_request(req.headers()) {
            Ok(accept) => accept,
            Err(e) => return json_error(e.status_code(), &e.to_string()),
        };
        let requested = requested_client_id(req.uri().query(), &hub.config().client_id_param);
        let session = match hub.connect(requested.as_deref(), conn.id) {
            Ok(session) => session,
            Err(e) => {
                warn!(connection_id = %conn.id, error = %e, "WebSocket client refused");
                return json_error(e.status_code(), &e.to_string());
            }
        };
        let response = match switching_protocols(&accept) {
            Ok(response) => response,
            Err(e) => {
                hub.disconnect(&session);
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };
        self.registry.mark_websocket(conn.id);

        let on_upgrade = hyper::upgrade::on(req);
        let hub = hub.clone();
        let conn = conn.clone();
        let meter = Arc::clone(&self.registry);
        self.ws_tasks.lock().spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let socket = complete_upgrade(TokioIo::new(upgraded)).await;
                    let client_id = session.client_id().to_string();
                    let reason = serve_client(hub, session, socket, meter, conn.close.forced()).await;
                    debug!(connection_id = %conn.id, %client_id, ?reason, "WebSocket connection ended");
                }
                Err(e) => {
                    warn!(connection_id = %conn.id, error = %e, "WebSocket upgrade failed");
                    hub.disconnect(&session);
                }
            }
            drop(conn);
        });
        response
    }

    fn serve_static(&self, path: &str, headers: &HeaderMap, method: &Method) -> HttpResponse {
        let Some(files) = &self.static_files else {
            return json_error(StatusCode::NOT_FOUND, "not found");
        };
        match files.handle(path, headers, method) {
            Ok(response) => response,
            Err(e) => {
                debug!(%path, error = %e, "static file not served");
                let status = e.status_code();
                json_error(status, status.canonical_reason().unwrap_or("error"))
            }
        }
    }

    fn fallback(&self, method: &Method, path: &str, headers: &HeaderMap) -> HttpResponse {
        if is_api_path(path) {
            return json_error(StatusCode::NOT_FOUND, "not found");
        }
        if self.static_files.is_none() {
            return json_error(StatusCode::NOT_FOUND, "not found");
        }
        if path == "/" {
            if let Some(landing) = &self.config.landing_page {
                return redirect(landing);
            }
        }
        self.serve_static(path, headers, method)
    }
}
