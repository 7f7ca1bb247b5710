//! Ordered first-match route table for the Argus NVR web tier.
//!
//! Routes are kept in registration order and scanned top to bottom; the
//! first entry whose method and pattern match wins. The table is built once
//! at startup and only read while serving, so lookups take no lock.
//!
//! # Pattern grammar
//!
//! | Segment | Matches |
//! |---|---|
//! | `streams` | the literal segment |
//! | `#` | exactly one segment |
//! | `segment_#.ts` | one segment with that prefix and suffix |
//! | `*` (last only) | zero or more trailing segments |
//!
//! # Example
//!
//! ```rust
//! use argus_router::{Router, ShadowPolicy};
//! use http::Method;
//!
//! let mut router = Router::with_shadow_policy(ShadowPolicy::Reject);
//! router.insert(Some(Method::GET), "/api/streams", "list").unwrap();
//! router.insert(Some(Method::GET), "/api/streams/#", "get").unwrap();
//! router.insert(None, "/go2rtc/*", "proxy").unwrap();
//!
//! let hit = router.match_route(&Method::GET, "/api/streams/front").unwrap();
//! assert_eq!(*hit.target, "get");
//! assert_eq!(hit.captures.get(0), Some("front"));
//!
//! // Registering a route an earlier one already covers is refused.
//! assert!(router.insert(Some(Method::GET), "/api/streams/back", "dead").is_err());
//! ```

mod captures;
mod error;
mod pattern;
mod router;

pub use captures::Captures;
pub use error::RouteError;
pub use pattern::Pattern;
pub use router::{RouteMatch, Router, ShadowPolicy};
