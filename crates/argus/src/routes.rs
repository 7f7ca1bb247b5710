//! Built-in routes registered by the binary.

use std::sync::Arc;

use argus_core::{Handler, HandlerRequest, HandlerResponse, Versioned};
use argus_server::auth::{constant_time_eq, cookie, SESSION_HEADER};
use argus_server::{AccessPolicy, MemorySessionStore, ServerBuilder};
use http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

/// Server statistics.
pub const STATS_PATH: &str = "/api/system/stats";
/// Creates a session from the configured credentials. Always public.
pub const LOGIN_PATH: &str = "/login";
/// Revokes the caller's session.
pub const LOGOUT_PATH: &str = "/api/logout";

#[derive(Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

/// Registers the stats, login and logout routes.
pub fn install(
    builder: ServerBuilder,
    policy: &Arc<Versioned<AccessPolicy>>,
    sessions: &Arc<MemorySessionStore>,
) -> ServerBuilder {
    builder
        .stats_route(STATS_PATH)
        .route(Method::POST, LOGIN_PATH, login(Arc::clone(policy), Arc::clone(sessions)))
        .route(Method::POST, LOGOUT_PATH, logout(Arc::clone(policy), Arc::clone(sessions)))
}

/// `POST /login` with `{"username", "password"}`.
///
/// On success sets the session cookie and returns the token for clients
/// that send `X-Session-Token` instead.
pub fn login(policy: Arc<Versioned<AccessPolicy>>, sessions: Arc<MemorySessionStore>) -> impl Handler {
    move |req: &HandlerRequest, res: &mut HandlerResponse| {
        let Ok(credentials) = req.json::<Credentials>() else {
            res.error(StatusCode::BAD_REQUEST, "expected a JSON body with username and password");
            return;
        };
        let policy = policy.load();
        let auth = &policy.auth;

        let user_ok = constant_time_eq(credentials.username.as_bytes(), auth.username.as_bytes());
        let password_ok = constant_time_eq(credentials.password.as_bytes(), auth.password.as_bytes());
        if auth.password.is_empty() || !(user_ok & password_ok) {
            warn!(user = %credentials.username, "login refused");
            res.error(StatusCode::UNAUTHORIZED, "invalid credentials");
            return;
        }

        let ttl = auth.session_ttl();
        let token = sessions.create(&credentials.username, ttl);
        info!(user = %credentials.username, "session created");
        res.insert_header(
            "set-cookie",
            &format!(
                "{}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
                auth.session_cookie,
                ttl.as_secs()
            ),
        );
        res.json(&json!({ "token": token, "expires_in": ttl.as_secs() }));
    }
}

/// `POST /api/logout`: revokes the session the request carries.
pub fn logout(policy: Arc<Versioned<AccessPolicy>>, sessions: Arc<MemorySessionStore>) -> impl Handler {
    move |req: &HandlerRequest, res: &mut HandlerResponse| {
        let policy = policy.load();
        let name = &policy.auth.session_cookie;
        let token = cookie(req.headers(), name).or_else(|| req.header(SESSION_HEADER));
        if let Some(token) = token {
            sessions.revoke(token);
        }
        res.insert_header("set-cookie", &format!("{name}=; Path=/; HttpOnly; Max-Age=0"));
        res.set_status(StatusCode::NO_CONTENT);
    }
}
