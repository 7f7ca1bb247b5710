//! Forwarding client for the companion streaming service.
//!
//! Every forwarded call holds one admission permit from the moment it is
//! accepted until the upstream body has been read. When no permit is free
//! the call fails at once; it never waits.

use std::time::Instant;

use argus_tasks::AdmissionLimiter;
use argus_telemetry::metrics::record_proxy_rejection;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::headers::{filter_request_headers, filter_response_headers};

/// Request to be forwarded to the companion service.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// HTTP method.
    pub method: Method,
    /// Full client path, including the proxy prefix.
    pub path: String,
    /// Raw query string, forwarded unchanged.
    pub query: Option<String>,
    /// Client request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
}

impl ProxyRequest {
    /// Create a new proxy request.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Set the query string.
    #[must_use]
    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query;
        self
    }

    /// Set the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Buffered response from the companion service.
#[derive(Debug)]
pub struct ProxyResponse {
    /// HTTP status code.
    pub status: StatusCode,
    /// Response headers, hop-by-hop headers removed.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

/// Admission-gated proxy to the companion streaming service.
#[derive(Debug, Clone)]
pub struct MediaProxy {
    client: Client,
    config: ProxyConfig,
    limiter: AdmissionLimiter,
}

impl MediaProxy {
    /// Create a proxy with its own admission limiter of
    /// `config.max_concurrent` permits.
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        let limiter = AdmissionLimiter::new(config.max_concurrent)
            .map_err(|e| ProxyError::config(e.to_string()))?;
        Self::with_limiter(config, limiter)
    }

    /// Create a proxy sharing an existing limiter.
    pub fn with_limiter(config: ProxyConfig, limiter: AdmissionLimiter) -> ProxyResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(config.max_concurrent)
            .build()
            .map_err(|e| ProxyError::config(format!("failed to create client: {e}")))?;

        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    /// Returns `true` if `path` belongs to the companion service.
    pub fn matches(&self, path: &str) -> bool {
        self.config.enabled
            && (path.starts_with(&self.config.prefix)
                || path == self.config.prefix.trim_end_matches('/'))
    }

    /// Builds the upstream URL: the prefix is stripped and the query kept.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> ProxyResult<String> {
        let bare_prefix = self.config.prefix.trim_end_matches('/');
        let rest = path
            .strip_prefix(&self.config.prefix)
            .or_else(|| (path == bare_prefix).then_some(""))
            .ok_or_else(|| {
                ProxyError::invalid_request(format!("path '{path}' is outside the proxy prefix"))
            })?;
        let decoded = urlencoding::decode(rest)
            .map_err(|_| ProxyError::invalid_request("path is not valid UTF-8 once decoded"))?;
        if decoded.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(ProxyError::invalid_request("path traversal is not allowed"));
        }

        let mut url = format!("{}/{}", self.config.upstream_url.trim_end_matches('/'), rest);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        Ok(url)
    }

    /// Forwards a request.
    ///
    /// Returns [`ProxyError::Saturated`] immediately when every permit is in
    /// use. The permit is released on every exit path.
    pub async fn forward(&self, request: ProxyRequest) -> ProxyResult<ProxyResponse> {
        let Some(_permit) = self.limiter.try_acquire() else {
            record_proxy_rejection();
            warn!(path = %request.path, max = self.limiter.max(), "proxy saturated, request rejected");
            return Err(ProxyError::Saturated {
                max: self.limiter.max(),
            });
        };

        let url = self.upstream_url(&request.path, request.query.as_deref())?;
        let timeout = self.config.request_timeout();
        let started = Instant::now();

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(filter_request_headers(&request.headers));
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(%url, error = %e, "upstream request failed");
            ProxyError::from_reqwest(&e, timeout)
        })?;

        let status = response.status();
        let headers = filter_response_headers(response.headers());
        let body = response.bytes().await.map_err(|e| {
            warn!(%url, error = %e, "failed to read upstream body");
            ProxyError::from_reqwest(&e, timeout)
        })?;

        debug!(
            method = %request.method,
            %url,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "proxied"
        );
        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }

    /// Returns the admission limiter.
    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}
