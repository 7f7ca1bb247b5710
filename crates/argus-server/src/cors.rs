//! Cross-origin headers and preflight answers.
//!
//! Preflight `OPTIONS` requests are answered on the loop without auth and
//! without consulting the router. Every other response gets the
//! `Access-Control-Allow-*` headers added when CORS is enabled.

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};

use crate::HttpResponse;

/// Header names not exported by `http`.
pub mod headers {
    /// `Access-Control-Allow-Origin`
    pub const ALLOW_ORIGIN: &str = "access-control-allow-origin";
    /// `Access-Control-Allow-Methods`
    pub const ALLOW_METHODS: &str = "access-control-allow-methods";
    /// `Access-Control-Allow-Headers`
    pub const ALLOW_HEADERS: &str = "access-control-allow-headers";
    /// `Access-Control-Allow-Credentials`
    pub const ALLOW_CREDENTIALS: &str = "access-control-allow-credentials";
    /// `Access-Control-Max-Age`
    pub const MAX_AGE: &str = "access-control-max-age";
}

/// Cross-origin rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Whether CORS headers are emitted and preflights answered.
    pub enabled: bool,
    /// Allowed origins. `*` allows any origin.
    pub allowed_origins: Vec<String>,
    /// Methods advertised in preflight answers.
    pub allowed_methods: Vec<String>,
    /// Request headers advertised in preflight answers.
    pub allowed_headers: Vec<String>,
    /// Whether credentials may accompany cross-origin requests.
    pub allow_credentials: bool,
    /// How long a browser may cache a preflight answer.
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allowed_headers: [
                "Content-Type",
                "Authorization",
                "X-API-Key",
                "X-Session-Token",
            ]
            .map(String::from)
            .to_vec(),
            allow_credentials: false,
            max_age_secs: 86400,
        }
    }
}

impl CorsConfig {
    fn allows_any(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    /// Returns the `Access-Control-Allow-Origin` value for a request origin.
    ///
    /// Credentialed responses echo the origin instead of `*`.
    pub fn origin_value(&self, origin: Option<&str>) -> Option<HeaderValue> {
        match origin {
            Some(origin) if self.allowed_origins.iter().any(|o| o == origin) => {
                HeaderValue::from_str(origin).ok()
            }
            Some(origin) if self.allows_any() && self.allow_credentials => {
                HeaderValue::from_str(origin).ok()
            }
            _ if self.allows_any() => Some(HeaderValue::from_static("*")),
            _ => None,
        }
    }

    /// Adds the allow headers to a response. No-op when disabled or the
    /// origin is not allowed.
    pub fn apply(&self, origin: Option<&str>, map: &mut HeaderMap) {
        if !self.enabled {
            return;
        }
        let Some(value) = self.origin_value(origin) else {
            return;
        };
        if value != "*" {
            map.append(header::VARY, HeaderValue::from_static("Origin"));
        }
        map.insert(headers::ALLOW_ORIGIN, value);
        if self.allow_credentials {
            map.insert(headers::ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
    }

    /// Answers an `OPTIONS` request: 204 with the preflight headers when
    /// enabled, 405 otherwise.
    pub fn preflight(&self, origin: Option<&str>) -> HttpResponse {
        if !self.enabled {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Full::new(Bytes::new()))
                .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())));
        }

        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::NO_CONTENT;
        let map = response.headers_mut();
        self.apply(origin, map);
        if let Ok(value) = HeaderValue::from_str(&self.allowed_methods.join(", ")) {
            map.insert(headers::ALLOW_METHODS, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.allowed_headers.join(", ")) {
            map.insert(headers::ALLOW_HEADERS, value);
        }
        map.insert(headers::MAX_AGE, HeaderValue::from(self.max_age_secs));
        response
    }
}
