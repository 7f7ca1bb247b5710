//! # Argus Core
//!
//! Core types shared by every crate of the Argus NVR web tier.
//!
//! - [`Handler`], [`HandlerRequest`], [`HandlerResponse`] - the synchronous
//!   handler contract consumed by the route dispatcher and the worker pool
//! - [`ConnectionId`], [`RequestId`] - UUID v7 identifiers
//! - [`Principal`] - the authenticated caller attached to a request
//! - [`Versioned`] - a read-mostly, copy-on-write configuration cell
//! - [`ShutdownCoordinator`] - priority-ordered, idempotent teardown registry
//! - [`CoreError`] - shared error type

#![doc(html_root_url = "https://docs.rs/argus-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod context;
mod error;
mod handler;
pub mod shutdown;
mod versioned;

pub use context::{ConnectionId, Principal, RequestId};
pub use error::{CoreError, CoreResult};
pub use handler::{ExecutionMode, Handler, HandlerRequest, HandlerResponse, Owner};
pub use shutdown::{
    ComponentHandle, ComponentKind, ComponentState, ShutdownCoordinator, ShutdownSignal, Stoppable,
};
pub use versioned::{Snapshot, Versioned};
