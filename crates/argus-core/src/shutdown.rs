//! Priority-ordered, idempotent shutdown coordination.
//!
//! Every long-lived subsystem registers itself with the
//! [`ShutdownCoordinator`] and receives a typed [`ComponentHandle`]. At
//! teardown the coordinator visits components from the highest priority to
//! the lowest, moving each one `RUNNING -> STOPPING -> STOPPED` exactly once.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use argus_core::{ComponentKind, ComponentState, ShutdownCoordinator, Stoppable};
//!
//! struct Pool;
//!
//! impl Stoppable for Pool {
//!     fn stop(&self) -> bool {
//!         true
//!     }
//! }
//!
//! let coordinator = ShutdownCoordinator::new();
//! let handle = coordinator.register("worker_pool", ComponentKind::WorkerPool, Some(Arc::new(Pool)), 10);
//!
//! assert!(coordinator.begin_shutdown());
//! assert!(!coordinator.begin_shutdown());
//! assert!(coordinator.wait_for_all_stopped(Duration::from_secs(1)));
//! assert_eq!(coordinator.state(handle), Some(ComponentState::Stopped));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::{CoreError, CoreResult};

/// Something the coordinator can ask to stop.
pub trait Stoppable: Send + Sync {
    /// Begins stopping.
    ///
    /// Returns `true` when the component finished stopping synchronously.
    /// Returning `false` leaves the component in `STOPPING` until its owner
    /// calls [`ShutdownCoordinator::mark_stopped`].
    fn stop(&self) -> bool;
}

/// The kind of a registered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// One accepted WebSocket client.
    WebSocketClient,
    /// The WebSocket hub.
    WebSocketHub,
    /// An HTTP listener and its event loop.
    HttpListener,
    /// The worker pool.
    WorkerPool,
    /// The companion-service proxy.
    Proxy,
    /// Anything else.
    Other,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WebSocketClient => "websocket_client",
            Self::WebSocketHub => "websocket_hub",
            Self::HttpListener => "http_listener",
            Self::WorkerPool => "worker_pool",
            Self::Proxy => "proxy",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a component. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentState {
    /// Serving normally.
    Running,
    /// Asked to stop, not finished yet.
    Stopping,
    /// Fully stopped.
    Stopped,
}

impl ComponentState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Stopping => 1,
            Self::Stopped => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Typed handle issued at registration.
///
/// The generation changes whenever a slot is released, so a handle kept
/// past its component's release never addresses the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentHandle {
    index: usize,
    generation: u64,
}

impl ComponentHandle {
    /// Returns the slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the slot generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for ComponentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

/// A process-wide shutdown flag that async tasks can await.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes every waiter. Returns `true` on the first call.
    pub fn trigger(&self) -> bool {
        let first = self
            .inner
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// Returns `true` once the signal was triggered.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Completes when the signal is triggered, immediately if it already was.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

struct Component {
    name: String,
    kind: ComponentKind,
    owner: Option<Arc<dyn Stoppable>>,
    priority: i32,
    seq: u64,
    state: Arc<AtomicU8>,
}

struct Slot {
    generation: u64,
    component: Option<Component>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    next_seq: u64,
}

impl Registry {
    fn get(&self, handle: ComponentHandle) -> Option<&Component> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.component.as_ref()
    }

    fn live(&self) -> impl Iterator<Item = &Component> {
        self.slots.iter().filter_map(|s| s.component.as_ref())
    }
}

struct StopTarget {
    name: String,
    kind: ComponentKind,
    owner: Option<Arc<dyn Stoppable>>,
    state: Arc<AtomicU8>,
}

/// Registry driving ordered, idempotent teardown.
pub struct ShutdownCoordinator {
    registry: Mutex<Registry>,
    stopped: Condvar,
    signal: ShutdownSignal,
    // Set by the first `begin_shutdown`, independent of the public signal.
    teardown: AtomicBool,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("components", &self.len())
            .field("shutdown_initiated", &self.is_shutdown_initiated())
            .finish()
    }
}

impl ShutdownCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            stopped: Condvar::new(),
            signal: ShutdownSignal::new(),
            teardown: AtomicBool::new(false),
        }
    }

    /// Registers a component. Higher priorities stop first.
    ///
    /// A component registered after shutdown began is still tracked, so its
    /// owner can report `STOPPED` and [`Self::wait_for_all_stopped`] waits
    /// for it.
    pub fn register(
        &self,
        name: impl Into<String>,
        kind: ComponentKind,
        owner: Option<Arc<dyn Stoppable>>,
        priority: i32,
    ) -> ComponentHandle {
        let mut registry = self.registry.lock();
        let seq = registry.next_seq;
        registry.next_seq += 1;

        let component = Component {
            name: name.into(),
            kind,
            owner,
            priority,
            seq,
            state: Arc::new(AtomicU8::new(ComponentState::Running.as_u8())),
        };

        let index = if let Some(index) = registry.free.pop() {
            registry.slots[index].component = Some(component);
            index
        } else {
            registry.slots.push(Slot {
                generation: 0,
                component: Some(component),
            });
            registry.slots.len() - 1
        };
        let handle = ComponentHandle {
            index,
            generation: registry.slots[index].generation,
        };
        tracing::trace!(%handle, %kind, priority, "component registered");
        handle
    }

    /// Returns the state of a component, or `None` for a stale handle.
    pub fn state(&self, handle: ComponentHandle) -> Option<ComponentState> {
        let registry = self.registry.lock();
        registry
            .get(handle)
            .map(|c| ComponentState::from_u8(c.state.load(Ordering::SeqCst)))
    }

    /// Moves a running component to `STOPPING`. Returns `true` if it moved.
    pub fn mark_stopping(&self, handle: ComponentHandle) -> bool {
        let registry = self.registry.lock();
        registry.get(handle).is_some_and(|c| to_stopping(&c.state))
    }

    /// Moves a component to `STOPPED`.
    ///
    /// Returns `true` only for the first transition; a stale handle or an
    /// already stopped component gives `false`.
    pub fn mark_stopped(&self, handle: ComponentHandle) -> bool {
        let registry = self.registry.lock();
        let changed = registry.get(handle).is_some_and(|c| to_stopped(&c.state));
        if changed {
            self.stopped.notify_all();
        }
        changed
    }

    /// Frees the slot of a stopped component.
    pub fn release(&self, handle: ComponentHandle) -> CoreResult<()> {
        let mut registry = self.registry.lock();
        let component = registry
            .get(handle)
            .ok_or_else(|| CoreError::stale_handle(handle.index, handle.generation))?;

        let state = ComponentState::from_u8(component.state.load(Ordering::SeqCst));
        if state != ComponentState::Stopped {
            return Err(CoreError::NotStopped {
                name: component.name.clone(),
                state: state.to_string(),
            });
        }

        let slot = &mut registry.slots[handle.index];
        slot.component = None;
        slot.generation += 1;
        registry.free.push(handle.index);
        // A released component no longer counts against waiters.
        self.stopped.notify_all();
        Ok(())
    }

    /// Starts shutdown. Only the first call has any effect.
    ///
    /// Components are visited by priority, highest first, ties in
    /// registration order. Each running component moves to `STOPPING`, its
    /// owner is asked to stop, and it moves to `STOPPED` when the owner
    /// reports completion. A component without an owner stops immediately.
    ///
    /// The teardown runs even when the signal from [`Self::subscribe`] was
    /// already triggered by someone else; that only requests shutdown.
    pub fn begin_shutdown(&self) -> bool {
        if self
            .teardown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("shutdown already initiated");
            return false;
        }
        self.signal.trigger();
        tracing::info!(components = self.len(), "shutdown initiated");

        let mut targets = {
            let registry = self.registry.lock();
            registry
                .live()
                .map(|c| {
                    (
                        c.priority,
                        c.seq,
                        StopTarget {
                            name: c.name.clone(),
                            kind: c.kind,
                            owner: c.owner.clone(),
                            state: Arc::clone(&c.state),
                        },
                    )
                })
                .collect::<Vec<_>>()
        };
        targets.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (priority, _, target) in targets {
            if !to_stopping(&target.state) {
                tracing::trace!(name = %target.name, "component not running, skipped");
                continue;
            }
            tracing::debug!(name = %target.name, kind = %target.kind, priority, "stopping component");

            // Owners may call back into the coordinator, so no lock is held here.
            let done = target.owner.as_ref().map_or(true, |owner| owner.stop());
            if done && to_stopped(&target.state) {
                let _registry = self.registry.lock();
                self.stopped.notify_all();
            }
        }
        true
    }

    /// Waits until every registered component is `STOPPED`.
    ///
    /// On timeout the stragglers are forced to `STOPPED` and logged, and the
    /// call returns `false`.
    pub fn wait_for_all_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry.lock();
        loop {
            let all_stopped = registry
                .live()
                .all(|c| c.state.load(Ordering::SeqCst) == ComponentState::Stopped.as_u8());
            if all_stopped {
                return true;
            }
            if self.stopped.wait_until(&mut registry, deadline).timed_out() {
                break;
            }
        }

        let mut forced = Vec::new();
        for component in registry.live() {
            if to_stopped(&component.state) {
                forced.push(component.name.clone());
            }
        }
        if forced.is_empty() {
            return true;
        }
        tracing::warn!(
            count = forced.len(),
            components = ?forced,
            "components did not stop in time, forced to stopped"
        );
        false
    }

    /// Returns `true` once [`Self::begin_shutdown`] ran.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.teardown.load(Ordering::SeqCst)
    }

    /// Returns a clone of the process-wide shutdown signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Returns the number of registered components.
    pub fn len(&self) -> usize {
        self.registry.lock().live().count()
    }

    /// Returns `true` when no component is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn to_stopping(state: &AtomicU8) -> bool {
    state
        .compare_exchange(
            ComponentState::Running.as_u8(),
            ComponentState::Stopping.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok()
}

fn to_stopped(state: &AtomicU8) -> bool {
    state.swap(ComponentState::Stopped.as_u8(), Ordering::SeqCst) != ComponentState::Stopped.as_u8()
}
