//! # Argus Sidecar
//!
//! Forwarding proxy from the Argus NVR web tier to the companion streaming
//! service (go2rtc by default).
//!
//! Requests under the configured prefix are forwarded with the prefix
//! stripped and the query string preserved. Concurrency is capped by an
//! [`AdmissionLimiter`](argus_tasks::AdmissionLimiter): when every permit is
//! taken the request fails immediately with 503 and `Retry-After: 1`, so a
//! burst of viewers never queues behind long-running stream pulls.
//!
//! | Failure | Status |
//! |---|---|
//! | no free permit | 503 |
//! | connect or transport error | 502 |
//! | upstream too slow | 504 |

#![doc(html_root_url = "https://docs.rs/argus-sidecar/0.1.0")]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod headers;
pub mod proxy;

pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use proxy::{MediaProxy, ProxyRequest, ProxyResponse};
