//! Authentication policy.
//!
//! Mechanisms are tried in a fixed order and the first one that applies
//! decides the outcome:
//!
//! 1. Session token, from the session cookie or `X-Session-Token`. An
//!    expired or unknown token is rejected outright; later mechanisms are
//!    not consulted.
//! 2. `Authorization: Bearer <key>` or `X-API-Key`.
//! 3. Basic credentials, from `Authorization: Basic` or the legacy cookie
//!    carrying the same base64 `user:pass` value.
//!
//! A request presenting none of them is unauthenticated. API paths answer
//! 401 with a `WWW-Authenticate` challenge, pages redirect to the login
//! page.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use argus_core::Principal;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{self, HeaderMap};
use http::{Method, Response, StatusCode};
use http_body_util::Full;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::HttpResponse;

/// Header carrying a session token.
pub const SESSION_HEADER: &str = "x-session-token";

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Login page unauthenticated page requests are sent to.
pub const LOGIN_PAGE: &str = "/login.html";

/// Authentication rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Whether requests must authenticate at all.
    pub enabled: bool,
    /// User accepted for basic credentials.
    pub username: String,
    /// Password accepted for basic credentials.
    pub password: String,
    /// API keys by non-secret id.
    pub api_keys: BTreeMap<String, String>,
    /// Cookie holding a session token.
    pub session_cookie: String,
    /// Cookie holding legacy base64 `user:pass` credentials.
    pub legacy_cookie: String,
    /// Lifetime of sessions created at login.
    pub session_ttl_secs: u64,
    /// Path prefixes reachable without credentials.
    pub public_paths: Vec<String>,
    /// Path prefixes of static assets, served without credentials.
    pub asset_prefixes: Vec<String>,
    /// Path suffixes of static assets, served without credentials.
    pub asset_suffixes: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: "admin".to_string(),
            password: String::new(),
            api_keys: BTreeMap::new(),
            session_cookie: "session".to_string(),
            legacy_cookie: "auth".to_string(),
            session_ttl_secs: 86_400,
            public_paths: Vec::new(),
            asset_prefixes: ["/js/", "/css/", "/img/", "/fonts/"]
                .map(String::from)
                .to_vec(),
            asset_suffixes: [".js.map", ".css.map", ".ico"].map(String::from).to_vec(),
        }
    }
}

impl AuthConfig {
    /// Session lifetime as a duration.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Returns `true` for static asset paths.
    pub fn is_static_asset(&self, path: &str) -> bool {
        self.asset_prefixes.iter().any(|p| path.starts_with(p.as_str()))
            || self.asset_suffixes.iter().any(|s| path.ends_with(s.as_str()))
    }

    /// Returns `true` if the request needs no credentials.
    pub fn is_public(&self, method: &Method, path: &str) -> bool {
        !self.enabled
            || method == Method::OPTIONS
            || path == "/login"
            || path == LOGIN_PAGE
            || self.is_static_asset(path)
            || self.public_paths.iter().any(|p| path.starts_with(p.as_str()))
    }
}

/// Result of a session lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    /// The token names a live session.
    Valid(Principal),
    /// The token named a session that has expired.
    Expired,
    /// The token is not known.
    Unknown,
}

/// Session token storage.
pub trait SessionStore: Send + Sync + 'static {
    /// Looks a token up.
    fn lookup(&self, token: &str) -> SessionLookup;
}

#[derive(Debug, Clone)]
struct Session {
    user: String,
    expires_at: DateTime<Utc>,
}

/// In-memory session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session for `user` lasting `ttl` and returns its token.
    pub fn create(&self, user: impl Into<String>, ttl: Duration) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        self.insert(token.clone(), user, expires_at);
        token
    }

    /// Stores a session under a caller-chosen token.
    pub fn insert(&self, token: impl Into<String>, user: impl Into<String>, expires_at: DateTime<Utc>) {
        self.sessions.write().insert(
            token.into(),
            Session {
                user: user.into(),
                expires_at,
            },
        );
    }

    /// Removes a session. Returns `true` if it existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.write().remove(token).is_some()
    }

    /// Drops expired sessions and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }

    /// Number of stored sessions, expired ones included.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns `true` if no sessions are stored.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn lookup(&self, token: &str) -> SessionLookup {
        match self.sessions.read().get(token) {
            Some(session) if session.expires_at > Utc::now() => SessionLookup::Valid(
                Principal::Session {
                    user: session.user.clone(),
                },
            ),
            Some(_) => SessionLookup::Expired,
            None => SessionLookup::Unknown,
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No credentials were presented.
    Missing,
    /// The session token has expired.
    SessionExpired,
    /// The session token is not known.
    SessionUnknown,
    /// An API key did not match.
    BadApiKey,
    /// Basic credentials did not match.
    BadCredentials,
}

impl DenyReason {
    /// Message returned to the client.
    pub fn message(self) -> &'static str {
        match self {
            Self::Missing => "authentication required",
            Self::SessionExpired => "session expired",
            Self::SessionUnknown => "invalid session",
            Self::BadApiKey => "invalid API key",
            Self::BadCredentials => "invalid credentials",
        }
    }
}

/// Outcome of [`authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The request may proceed as this principal.
    Allow(Principal),
    /// The request is refused.
    Deny(DenyReason),
}

/// Compares two secrets in time independent of where they differ.
///
/// Inputs of different length compare unequal without inspecting content.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Finds a cookie value in the request's `Cookie` headers.
pub fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"'))
        .filter(|value| !value.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn authorization<'a>(headers: &'a HeaderMap, scheme: &str) -> Option<&'a str> {
    let value = header_str(headers, header::AUTHORIZATION.as_str())?;
    let (given, rest) = value.split_once(' ')?;
    given.eq_ignore_ascii_case(scheme).then(|| rest.trim())
}

fn check_api_key(config: &AuthConfig, presented: &str) -> AuthOutcome {
    // Every key is compared so the match position does not leak.
    let mut matched = None;
    for (id, key) in &config.api_keys {
        if constant_time_eq(key.as_bytes(), presented.as_bytes()) {
            matched = Some(id);
        }
    }
    match matched {
        Some(id) => AuthOutcome::Allow(Principal::ApiKey { key_id: id.clone() }),
        None => AuthOutcome::Deny(DenyReason::BadApiKey),
    }
}

fn check_basic(config: &AuthConfig, encoded: &str) -> AuthOutcome {
    let decoded = STANDARD
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok());
    let Some((user, pass)) = decoded.as_deref().and_then(|d| d.split_once(':')) else {
        return AuthOutcome::Deny(DenyReason::BadCredentials);
    };
    let user_ok = constant_time_eq(user.as_bytes(), config.username.as_bytes());
    let pass_ok = constant_time_eq(pass.as_bytes(), config.password.as_bytes());
    if user_ok && pass_ok && !config.password.is_empty() {
        AuthOutcome::Allow(Principal::Basic {
            user: user.to_string(),
        })
    } else {
        AuthOutcome::Deny(DenyReason::BadCredentials)
    }
}

/// Authenticates a request's credentials.
///
/// Does not check whether the path is public; see [`AuthConfig::is_public`].
pub fn authenticate(config: &AuthConfig, sessions: &dyn SessionStore, headers: &HeaderMap) -> AuthOutcome {
    let session_token =
        cookie(headers, &config.session_cookie).or_else(|| header_str(headers, SESSION_HEADER));
    if let Some(token) = session_token {
        return match sessions.lookup(token) {
            SessionLookup::Valid(principal) => AuthOutcome::Allow(principal),
            SessionLookup::Expired => AuthOutcome::Deny(DenyReason::SessionExpired),
            SessionLookup::Unknown => AuthOutcome::Deny(DenyReason::SessionUnknown),
        };
    }

    if let Some(key) = authorization(headers, "Bearer").or_else(|| header_str(headers, API_KEY_HEADER)) {
        return check_api_key(config, key);
    }

    if let Some(encoded) = authorization(headers, "Basic").or_else(|| cookie(headers, &config.legacy_cookie)) {
        return check_basic(config, encoded);
    }

    debug!("request carried no credentials");
    AuthOutcome::Deny(DenyReason::Missing)
}

/// Builds the refusal for `path`: 401 with a challenge for API paths, a
/// redirect to the login page otherwise.
pub fn deny_response(path: &str, reason: DenyReason) -> HttpResponse {
    let response = if path.starts_with("/api/") || path == "/api" {
        let body = serde_json::json!({ "error": reason.message() }).to_string();
        Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::WWW_AUTHENTICATE, "Basic realm=\"argus\"")
            .body(Full::new(Bytes::from(body)))
    } else {
        Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, LOGIN_PAGE)
            .body(Full::new(Bytes::new()))
    };
    response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn config() -> AuthConfig {
        let mut api_keys = BTreeMap::new();
        api_keys.insert("frontend".to_string(), "k-123".to_string());
        AuthConfig {
            enabled: true,
            password: "secret".into(),
            api_keys,
            public_paths: vec!["/api/health".into()],
            ..AuthConfig::default()
        }
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn basic(user: &str, pass: &str) -> String {
        STANDARD.encode(format!("{user}:{pass}"))
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_public_paths() {
        let config = config();
        assert!(config.is_public(&Method::GET, "/login.html"));
        assert!(config.is_public(&Method::POST, "/login"));
        assert!(config.is_public(&Method::GET, "/js/app.js"));
        assert!(config.is_public(&Method::GET, "/favicon.ico"));
        assert!(config.is_public(&Method::GET, "/api/health/live"));
        assert!(config.is_public(&Method::OPTIONS, "/api/cameras"));
        assert!(!config.is_public(&Method::GET, "/api/cameras"));
        assert!(!config.is_public(&Method::GET, "/index.html"));

        let disabled = AuthConfig::default();
        assert!(disabled.is_public(&Method::GET, "/api/cameras"));
    }

    #[test]
    fn test_cookie_parsing() {
        let map = headers(&[("cookie", "theme=dark; session=abc; auth=\"xyz\"")]);
        assert_eq!(cookie(&map, "session"), Some("abc"));
        assert_eq!(cookie(&map, "auth"), Some("xyz"));
        assert_eq!(cookie(&map, "missing"), None);
    }

    #[test]
    fn test_valid_session() {
        let store = MemorySessionStore::new();
        let token = store.create("admin", Duration::from_secs(60));
        let cookie_value = format!("session={token}");
        let outcome = authenticate(&config(), &store, &headers(&[("cookie", cookie_value.as_str())]));
        assert_eq!(
            outcome,
            AuthOutcome::Allow(Principal::Session { user: "admin".into() })
        );

        let outcome = authenticate(&config(), &store, &headers(&[("x-session-token", token.as_str())]));
        assert!(matches!(outcome, AuthOutcome::Allow(Principal::Session { .. })));
    }

    #[test]
    fn test_expired_session_does_not_fall_back() {
        let store = MemorySessionStore::new();
        store.insert("old", "admin", Utc::now() - chrono::Duration::seconds(5));
        let auth = format!("Basic {}", basic("admin", "secret"));
        let outcome = authenticate(
            &config(),
            &store,
            &headers(&[("cookie", "session=old"), ("authorization", auth.as_str())]),
        );
        assert_eq!(outcome, AuthOutcome::Deny(DenyReason::SessionExpired));
    }

    #[test]
    fn test_unknown_session() {
        let store = MemorySessionStore::new();
        let outcome = authenticate(&config(), &store, &headers(&[("x-session-token", "nope")]));
        assert_eq!(outcome, AuthOutcome::Deny(DenyReason::SessionUnknown));
    }

    #[test]
    fn test_api_keys() {
        let store = MemorySessionStore::new();
        let outcome = authenticate(&config(), &store, &headers(&[("authorization", "Bearer k-123")]));
        assert_eq!(
            outcome,
            AuthOutcome::Allow(Principal::ApiKey { key_id: "frontend".into() })
        );

        let outcome = authenticate(&config(), &store, &headers(&[("x-api-key", "k-123")]));
        assert!(matches!(outcome, AuthOutcome::Allow(Principal::ApiKey { .. })));

        let outcome = authenticate(&config(), &store, &headers(&[("x-api-key", "k-124")]));
        assert_eq!(outcome, AuthOutcome::Deny(DenyReason::BadApiKey));
    }

    #[test]
    fn test_basic_and_legacy_cookie() {
        let store = MemorySessionStore::new();
        let auth = format!("Basic {}", basic("admin", "secret"));
        let outcome = authenticate(&config(), &store, &headers(&[("authorization", auth.as_str())]));
        assert_eq!(outcome, AuthOutcome::Allow(Principal::Basic { user: "admin".into() }));

        let legacy = format!("auth={}", basic("admin", "secret"));
        let outcome = authenticate(&config(), &store, &headers(&[("cookie", legacy.as_str())]));
        assert!(matches!(outcome, AuthOutcome::Allow(Principal::Basic { .. })));

        let wrong = format!("Basic {}", basic("admin", "guess"));
        let outcome = authenticate(&config(), &store, &headers(&[("authorization", wrong.as_str())]));
        assert_eq!(outcome, AuthOutcome::Deny(DenyReason::BadCredentials));

        let outcome = authenticate(&config(), &store, &headers(&[("authorization", "Basic !!!")]));
        assert_eq!(outcome, AuthOutcome::Deny(DenyReason::BadCredentials));
    }

    #[test]
    fn test_empty_password_never_matches() {
        let store = MemorySessionStore::new();
        let config = AuthConfig {
            enabled: true,
            ..AuthConfig::default()
        };
        let auth = format!("Basic {}", basic("admin", ""));
        let outcome = authenticate(&config, &store, &headers(&[("authorization", auth.as_str())]));
        assert_eq!(outcome, AuthOutcome::Deny(DenyReason::BadCredentials));
    }

    #[test]
    fn test_missing_credentials() {
        let store = MemorySessionStore::new();
        assert_eq!(
            authenticate(&config(), &store, &HeaderMap::new()),
            AuthOutcome::Deny(DenyReason::Missing)
        );
    }

    #[test]
    fn test_deny_responses() {
        let api = deny_response("/api/cameras", DenyReason::Missing);
        assert_eq!(api.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(api.headers()[header::WWW_AUTHENTICATE], "Basic realm=\"argus\"");

        let page = deny_response("/live.html", DenyReason::Missing);
        assert_eq!(page.status(), StatusCode::FOUND);
        assert_eq!(page.headers()[header::LOCATION], "/login.html");
    }

    #[test]
    fn test_session_store_maintenance() {
        let store = MemorySessionStore::new();
        store.insert("old", "a", Utc::now() - chrono::Duration::seconds(1));
        let token = store.create("b", Duration::from_secs(60));
        assert_eq!(store.len(), 2);
        assert_eq!(store.purge_expired(), 1);
        assert!(store.revoke(&token));
        assert!(store.is_empty());
    }
}
