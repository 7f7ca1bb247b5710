//! # Argus
//!
//! Web tier of the Argus network video recorder: an HTTP and WebSocket
//! server with a single-threaded event loop, a bounded worker pool for
//! blocking handlers, and a proxy to the companion streaming service.
//!
//! This crate re-exports the component crates and provides the built-in
//! [`routes`] used by the `argus` binary.
//!
//! ## Crates
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `argus-core` | Handler contract, shutdown coordination, versioned config cells |
//! | `argus-router` | Pattern compilation and first-match routing |
//! | `argus-tasks` | Bounded worker pool and admission limiter |
//! | `argus-ws` | WebSocket hub, client sessions, message envelopes |
//! | `argus-sidecar` | Reverse proxy to the streaming service |
//! | `argus-server` | Event loop, request pipeline, auth, CORS, static files |
//! | `argus-config` | Configuration loading and hot reload |
//! | `argus-telemetry` | Logging and Prometheus metrics |
//!
//! ## Example
//!
//! ```rust,no_run
//! use argus::prelude::*;
//!
//! let server = Server::builder()
//!     .route(Method::GET, "/api/cameras/#", |req: &HandlerRequest, res: &mut HandlerResponse| {
//!         res.json(&serde_json::json!({ "camera": req.capture(0) }));
//!     })
//!     .build()
//!     .unwrap();
//! let running = server.start("127.0.0.1:8080").unwrap();
//! running.stop();
//! ```

#![doc(html_root_url = "https://docs.rs/argus/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod routes;

pub use argus_config as config;
pub use argus_core as core;
pub use argus_router as router;
pub use argus_server as server;
pub use argus_sidecar as sidecar;
pub use argus_tasks as tasks;
pub use argus_telemetry as telemetry;
pub use argus_ws as ws;

/// Commonly used types.
pub mod prelude {
    pub use argus_config::{ArgusConfig, ConfigLoader, ConfigWatcher};
    pub use argus_core::{
        ComponentKind, ExecutionMode, Handler, HandlerRequest, HandlerResponse, ShutdownCoordinator,
        ShutdownSignal, Versioned,
    };
    pub use argus_server::{AccessPolicy, MemorySessionStore, RunningServer, Server, ServerConfig};
    pub use argus_sidecar::{MediaProxy, ProxyConfig};
    pub use argus_tasks::{PoolConfig, WorkerPool};
    pub use argus_ws::{CloseCode, Envelope, Hub, HubConfig};
    pub use http::{Method, StatusCode};
}
