//! Connection registry and server statistics.
//!
//! Every accepted connection is registered here for as long as its task
//! runs. The registry is the only connection state shared across threads:
//! worker replies consult [`ConnectionRegistry::is_live`] before they are
//! delivered, and shutdown walks it to close every connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use argus_core::ConnectionId;
use argus_ws::FrameMeter;
use argus_telemetry::metrics::set_active_connections;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

/// Closing and force flags for one connection.
///
/// Both flags only ever go from unset to set.
#[derive(Debug, Default)]
pub struct CloseSignal {
    closing: AtomicBool,
    forced: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    /// Creates an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the connection to finish its current exchange and close.
    /// Returns `true` on the first call.
    pub fn mark_closing(&self) -> bool {
        let first = !self.closing.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Tells the connection to drop its socket now. Implies closing.
    /// Returns `true` on the first call.
    pub fn force(&self) -> bool {
        self.closing.store(true, Ordering::SeqCst);
        let first = !self.forced.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Returns `true` once closing was requested.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Returns `true` once a forced close was requested.
    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    async fn wait_until(&self, flag: impl Fn(&Self) -> bool) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if flag(self) {
                return;
            }
            notified.await;
        }
    }

    /// Completes once closing was requested.
    pub async fn closing(&self) {
        self.wait_until(Self::is_closing).await;
    }

    /// Completes once a forced close was requested.
    pub async fn forced(&self) {
        self.wait_until(Self::is_forced).await;
    }
}

#[derive(Debug)]
struct Entry {
    peer: SocketAddr,
    opened_at: Instant,
    is_websocket: bool,
    closing: Arc<CloseSignal>,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: u64,
    total_requests: u64,
    bytes_received: u64,
    bytes_sent: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Entry>,
    counters: Counters,
    closing: bool,
}

/// Point-in-time server statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStats {
    /// Connections currently registered.
    pub active_connections: usize,
    /// Registered connections that were upgraded to WebSocket.
    pub websocket_connections: usize,
    /// Connections accepted since start.
    pub total_connections: u64,
    /// Requests received since start.
    pub total_requests: u64,
    /// Request body and WebSocket frame bytes received since start.
    pub bytes_received: u64,
    /// Response body and WebSocket frame bytes sent since start.
    pub bytes_sent: u64,
    /// Total requests divided by whole seconds since start.
    pub requests_per_second: f64,
    /// Whole seconds since start.
    pub uptime_secs: u64,
    /// Start time as an RFC 3339 string.
    pub started_at: String,
}

/// Active connections and counters behind one lock.
#[derive(Debug)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    started: Instant,
    started_at: SystemTime,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Creates an empty registry; statistics start now.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            started: Instant::now(),
            started_at: SystemTime::now(),
        }
    }

    /// Registers an accepted connection.
    ///
    /// Once [`mark_all_closing`](Self::mark_all_closing) ran, new
    /// connections start out closing.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> ConnectionGuard {
        let id = ConnectionId::new();
        let closing = Arc::new(CloseSignal::new());
        let active = {
            let mut state = self.state.lock();
            if state.closing {
                closing.mark_closing();
            }
            state.connections.insert(
                id,
                Entry {
                    peer,
                    opened_at: Instant::now(),
                    is_websocket: false,
                    closing: Arc::clone(&closing),
                },
            );
            state.counters.total_connections += 1;
            state.connections.len()
        };
        set_active_connections(active);
        debug!(connection_id = %id, %peer, "connection registered");
        ConnectionGuard {
            id,
            closing,
            registry: Arc::clone(self),
        }
    }

    fn deregister(&self, id: ConnectionId) {
        let (removed, active) = {
            let mut state = self.state.lock();
            let removed = state.connections.remove(&id);
            (removed, state.connections.len())
        };
        set_active_connections(active);
        if let Some(entry) = removed {
            debug!(
                connection_id = %id,
                peer = %entry.peer,
                websocket = entry.is_websocket,
                open_ms = u64::try_from(entry.opened_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "connection closed"
            );
        }
    }

    /// Flags a connection as upgraded to WebSocket.
    pub fn mark_websocket(&self, id: ConnectionId) -> bool {
        self.state
            .lock()
            .connections
            .get_mut(&id)
            .map(|entry| entry.is_websocket = true)
            .is_some()
    }

    /// Counts one request.
    pub fn record_request(&self) {
        self.state.lock().counters.total_requests += 1;
    }

    /// Counts `bytes` read from a client: request bodies and WebSocket
    /// frames.
    pub fn record_received(&self, bytes: u64) {
        self.state.lock().counters.bytes_received += bytes;
    }

    /// Counts `bytes` sent to a client.
    pub fn record_sent(&self, bytes: u64) {
        self.state.lock().counters.bytes_sent += bytes;
    }

    /// Returns `true` while the connection is registered and not being
    /// force-closed.
    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.state
            .lock()
            .connections
            .get(&id)
            .is_some_and(|entry| !entry.closing.is_forced())
    }

    /// Marks every connection closing, and every later one on arrival.
    /// Returns how many were newly marked.
    pub fn mark_all_closing(&self) -> usize {
        let signals = {
            let mut state = self.state.lock();
            state.closing = true;
            Self::signals(&state)
        };
        signals.iter().filter(|s| s.mark_closing()).count()
    }

    /// Force-closes every connection. Returns how many were newly forced.
    pub fn force_close_all(&self) -> usize {
        let signals = {
            let mut state = self.state.lock();
            state.closing = true;
            Self::signals(&state)
        };
        signals.iter().filter(|s| s.force()).count()
    }

    fn signals(state: &RegistryState) -> Vec<Arc<CloseSignal>> {
        state
            .connections
            .values()
            .map(|entry| Arc::clone(&entry.closing))
            .collect()
    }

    /// Number of registered connections.
    pub fn active(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> ServerStats {
        let state = self.state.lock();
        let uptime_secs = self.started.elapsed().as_secs();
        let requests_per_second = if uptime_secs == 0 {
            0.0
        } else {
            state.counters.total_requests as f64 / uptime_secs as f64
        };
        ServerStats {
            active_connections: state.connections.len(),
            websocket_connections: state.connections.values().filter(|e| e.is_websocket).count(),
            total_connections: state.counters.total_connections,
            total_requests: state.counters.total_requests,
            bytes_received: state.counters.bytes_received,
            bytes_sent: state.counters.bytes_sent,
            requests_per_second,
            uptime_secs,
            started_at: chrono::DateTime::<chrono::Utc>::from(self.started_at).to_rfc3339(),
        }
    }
}

/// Keeps a connection registered; deregisters it on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: ConnectionId,
    closing: Arc<CloseSignal>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    /// The connection's id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection's close signal.
    pub fn close_signal(&self) -> &Arc<CloseSignal> {
        &self.closing
    }

    /// The registry the connection belongs to.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

impl FrameMeter for ConnectionRegistry {
    fn inbound(&self, bytes: usize) {
        self.record_received(bytes as u64);
    }

    fn outbound(&self, bytes: usize) {
        self.record_sent(bytes as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_register_and_drop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let guard = registry.register(peer());
        let id = guard.id();
        assert_eq!(registry.active(), 1);
        assert!(registry.is_live(id));

        drop(guard);
        assert_eq!(registry.active(), 0);
        assert!(!registry.is_live(id));
        assert_eq!(registry.stats().total_connections, 1);
    }

    #[test]
    fn test_counters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let guard = registry.register(peer());
        registry.record_request();
        registry.record_received(100);
        registry.record_request();
        registry.record_sent(2048);
        assert!(registry.mark_websocket(guard.id()));

        let stats = registry.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.bytes_received, 100);
        assert_eq!(stats.bytes_sent, 2048);
        assert_eq!(stats.websocket_connections, 1);
        assert!((stats.requests_per_second - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_close_flags_are_monotonic() {
        let registry = Arc::new(ConnectionRegistry::new());
        let a = registry.register(peer());
        let b = registry.register(peer());

        assert_eq!(registry.mark_all_closing(), 2);
        assert_eq!(registry.mark_all_closing(), 0);
        assert!(a.close_signal().is_closing());
        assert!(!a.close_signal().is_forced());
        assert!(registry.is_live(a.id()));

        assert_eq!(registry.force_close_all(), 2);
        assert!(b.close_signal().is_forced());
        assert!(!registry.is_live(b.id()));
        assert!(b.close_signal().is_closing());
    }

    #[test]
    fn test_late_connection_starts_closing() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.mark_all_closing();
        let late = registry.register(peer());
        assert!(late.close_signal().is_closing());
    }

    #[tokio::test]
    async fn test_close_signal_wakes_waiters() {
        let signal = Arc::new(CloseSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.forced().await })
        };
        tokio::task::yield_now().await;
        signal.mark_closing();
        signal.force();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closing_completes_if_already_set() {
        let signal = CloseSignal::new();
        signal.force();
        tokio::time::timeout(Duration::from_millis(100), signal.closing())
            .await
            .expect("already closing");
    }

    #[test]
    fn test_stats_serialize() {
        let registry = ConnectionRegistry::new();
        let json = serde_json::to_value(registry.stats()).unwrap();
        assert_eq!(json["active_connections"], 0);
        assert!(json["started_at"].is_string());
    }
}
