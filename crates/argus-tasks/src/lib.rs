//! # Argus Tasks
//!
//! Two capacity primitives for the Argus NVR web tier:
//!
//! 1. **Worker pool**: a fixed set of OS threads draining a bounded FIFO
//!    queue. Blocking handlers run here so the event loop never stalls.
//!    `submit` blocks while the queue is full; `try_submit` fails instead.
//! 2. **Admission limiter**: a hard, non-queuing cap on concurrent calls to
//!    the companion streaming service.
//!
//! ```rust
//! use argus_core::ConnectionId;
//! use argus_tasks::{AdmissionLimiter, Job, PoolConfig, WorkerPool};
//!
//! let pool = WorkerPool::new(PoolConfig::new().with_workers(2).with_queue_capacity(16)).unwrap();
//! pool.submit(Job::new(ConnectionId::new(), || {
//!     // read a recording index from disk
//! }))
//! .unwrap();
//!
//! let limiter = AdmissionLimiter::default();
//! if let Some(_permit) = limiter.try_acquire() {
//!     // forward the request upstream
//! }
//!
//! pool.shutdown();
//! ```

#![doc(html_root_url = "https://docs.rs/argus-tasks/0.1.0")]
#![warn(missing_docs)]

mod admission;
mod error;
mod pool;

pub use admission::{AdmissionLimiter, AdmissionPermit, DEFAULT_MAX_CONCURRENT};
pub use error::{PoolError, PoolResult};
pub use pool::{Job, PoolConfig, PoolStats, WorkerPool};
