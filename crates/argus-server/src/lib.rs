//! # Argus Server
//!
//! The event loop of the Argus NVR web tier.
//!
//! One dedicated OS thread per listener runs a current-thread Tokio runtime
//! that accepts connections and drives every connection task. Handlers run
//! in one of two places:
//!
//! - `Inline` handlers run on the loop thread and must not block.
//! - `Worker` handlers are sent to the [`WorkerPool`](argus_tasks::WorkerPool)
//!   as owned jobs. The reply comes back through a one-shot channel and is
//!   discarded if the connection has closed in the meantime.
//!
//! ## Request pipeline
//!
//! 1. statistics
//! 2. WebSocket upgrade on the configured path, after auth
//! 3. static assets, served without credentials
//! 4. `OPTIONS` preflight
//! 5. auth ([`auth`])
//! 6. companion proxy prefix
//! 7. route table, inline or worker
//! 8. static files, SPA fallback, or 404
//!
//! ## Example
//!
//! ```rust,no_run
//! use argus_server::{Server, ServerConfig};
//! use http::Method;
//!
//! let server = Server::builder()
//!     .config(ServerConfig::default())
//!     .route(Method::GET, "/api/ping", |_req: &argus_core::HandlerRequest, res: &mut argus_core::HandlerResponse| {
//!         res.text("pong");
//!     })
//!     .build()
//!     .unwrap();
//!
//! let running = server.start("127.0.0.1:8080").unwrap();
//! // ...
//! running.stop();
//! ```

#![doc(html_root_url = "https://docs.rs/argus-server/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod auth;
mod config;
pub mod cors;
mod dispatch;
mod error;
mod event_loop;
pub mod registry;
mod server;
pub mod static_files;

use bytes::Bytes;
use http_body_util::Full;

/// Response type produced by the pipeline.
pub type HttpResponse = http::Response<Full<Bytes>>;

pub use auth::{AuthConfig, MemorySessionStore, SessionStore};
pub use config::{AccessPolicy, ServerConfig};
pub use cors::CorsConfig;
pub use error::{ServerError, ServerResult};
pub use event_loop::{EventLoop, PollOutcome};
pub use registry::{ConnectionRegistry, ServerStats};
pub use server::{RunningServer, Server, ServerBuilder};
