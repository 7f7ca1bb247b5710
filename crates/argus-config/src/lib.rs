//! Typed configuration for Argus.
//!
//! - TOML and JSON configuration files
//! - environment overrides `ARGUS__SECTION__KEY`
//! - strict validation, unknown fields are errors
//! - hot reload of the auth and CORS rules
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//! static_root = "/usr/share/argus/www"
//! spa_index = "index.html"
//!
//! [workers]
//! threads = 4
//! queue_capacity = 256
//!
//! [auth]
//! enabled = true
//! password = "change-me"
//! api_keys = { wall = "k-3f9a" }
//!
//! [cors]
//! enabled = false
//!
//! [proxy]
//! prefix = "/go2rtc/"
//! upstream_url = "http://127.0.0.1:1984"
//! max_concurrent = 12
//!
//! [websocket]
//! idle_timeout_secs = 3600
//!
//! [telemetry.logging]
//! level = "info"
//! format = "json"
//! ```

#![doc(html_root_url = "https://docs.rs/argus-config/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod loader;
mod schema;
mod watcher;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, ENV_PREFIX};
pub use schema::{ArgusConfig, WebSocketConfig, WorkersConfig};
pub use watcher::{ConfigWatcher, DEFAULT_DEBOUNCE};
