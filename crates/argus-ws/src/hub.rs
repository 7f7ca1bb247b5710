//! Topic-based publish/subscribe hub for WebSocket clients.
//!
//! All hub state sits behind one lock: the client table, the topic
//! subscriber sets and the topic handler registry. The event loop touches it
//! when frames arrive; worker and background threads touch it when they push
//! events. Outbound frames go through each client's unbounded channel, so no
//! caller ever blocks on a slow socket while holding the lock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use argus_core::{ComponentHandle, ComponentKind, ConnectionId, ShutdownCoordinator, Stoppable};
use argus_telemetry::metrics::{record_broadcast_delivered, set_ws_clients};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::error::{CloseCode, WsError, WsResult};
use crate::message::Envelope;

/// Lifecycle of one client. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ClientState {
    /// Registered, welcome not yet queued.
    Connecting = 0,
    /// Receiving and sending.
    Open = 1,
    /// A close frame was queued; no further deliveries.
    Closing = 2,
    /// Removed from the hub.
    Closed = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Moves `cell` forward to `next`. Returns `true` if the state changed.
    fn advance(cell: &AtomicU8, next: Self) -> bool {
        cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current < next as u8).then_some(next as u8)
        })
        .is_ok()
    }

    fn load(cell: &AtomicU8) -> Self {
        Self::from_u8(cell.load(Ordering::Acquire))
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A frame queued for a client's connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    Text(String),
    Close { code: CloseCode, reason: String },
}

/// An inbound message routed to a topic handler.
#[derive(Debug, Clone, Copy)]
pub struct TopicMessage<'a> {
    /// Sending client.
    pub client_id: &'a str,
    /// Topic named in the envelope.
    pub topic: &'a str,
    /// Envelope type.
    pub kind: &'a str,
    /// The envelope payload as JSON text.
    pub payload: &'a str,
}

/// Handles inbound messages for one topic.
///
/// Runs synchronously on the connection's task and must not block. The hub
/// is passed in so a handler can reply or broadcast.
pub trait TopicHandler: Send + Sync + 'static {
    /// Handles one message.
    fn on_message(&self, hub: &Hub, message: &TopicMessage<'_>);
}

impl<F> TopicHandler for F
where
    F: Fn(&Hub, &TopicMessage<'_>) + Send + Sync + 'static,
{
    fn on_message(&self, hub: &Hub, message: &TopicMessage<'_>) {
        self(hub, message);
    }
}

/// The connection-side half of a registered client.
///
/// Owned by the task driving the socket; pass it back to
/// [`Hub::disconnect`] when the socket ends.
#[derive(Debug)]
pub struct ClientSession {
    client_id: String,
    connection_id: ConnectionId,
    receiver: mpsc::UnboundedReceiver<Outbound>,
}

impl ClientSession {
    /// The id the hub assigned to this client.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The connection this client arrived on.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub(crate) async fn next_outbound(&mut self) -> Option<Outbound> {
        self.receiver.recv().await
    }
}

struct ClientEntry {
    connection_id: ConnectionId,
    sender: mpsc::UnboundedSender<Outbound>,
    state: Arc<AtomicU8>,
    last_activity: Instant,
    subscriptions: HashSet<String>,
    component: Option<ComponentHandle>,
}

impl ClientEntry {
    fn state(&self) -> ClientState {
        ClientState::load(&self.state)
    }

    fn deliver(&self, text: &str) -> bool {
        self.state() == ClientState::Open && self.sender.send(Outbound::Text(text.to_string())).is_ok()
    }

    fn close(&self, code: CloseCode, reason: &str) -> bool {
        ClientState::advance(&self.state, ClientState::Closing);
        self.sender
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }
}

#[derive(Default)]
struct HubState {
    clients: HashMap<String, ClientEntry>,
    topics: HashMap<String, BTreeSet<String>>,
    handlers: HashMap<String, Arc<dyn TopicHandler>>,
    closed: bool,
}

struct HubInner {
    config: HubConfig,
    state: Mutex<HubState>,
    coordinator: Option<Arc<ShutdownCoordinator>>,
}

/// The WebSocket hub. Cloning is cheap; clones share state.
///
/// # Example
///
/// ```rust
/// use argus_core::ConnectionId;
/// use argus_ws::{Envelope, Hub, HubConfig};
/// use serde_json::json;
///
/// let hub = Hub::new(HubConfig::default());
/// let session = hub.connect(Some("wall"), ConnectionId::new()).unwrap();
/// assert_eq!(session.client_id(), "wall");
///
/// hub.subscribe("wall", "events");
/// let delivered = hub.broadcast("events", &Envelope::event("events", json!({"camera": 3})));
/// assert_eq!(delivered, 1);
/// ```
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Hub")
            .field("clients", &state.clients.len())
            .field("topics", &state.topics.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Hub {
    /// Creates a hub that does not report to a shutdown coordinator.
    pub fn new(config: HubConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a hub that registers each client as a
    /// [`ComponentKind::WebSocketClient`] with `coordinator`.
    pub fn with_coordinator(config: HubConfig, coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self::build(config, Some(coordinator))
    }

    fn build(config: HubConfig, coordinator: Option<Arc<ShutdownCoordinator>>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                state: Mutex::new(HubState::default()),
                coordinator,
            }),
        }
    }

    /// Returns the hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Registers the handler for `topic`, replacing any previous one.
    pub fn register_topic_handler(&self, topic: impl Into<String>, handler: impl TopicHandler) {
        let topic = topic.into();
        debug!(%topic, "topic handler registered");
        self.inner
            .state
            .lock()
            .handlers
            .insert(topic, Arc::new(handler));
    }

    /// Returns `true` if a handler is registered for `topic`.
    pub fn has_topic_handler(&self, topic: &str) -> bool {
        self.inner.state.lock().handlers.contains_key(topic)
    }

    /// Registers a new client and queues its welcome message.
    ///
    /// The requested id is used when it is non-empty and no open client holds
    /// it; otherwise the connection id becomes the client id.
    pub fn connect(
        &self,
        requested: Option<&str>,
        connection_id: ConnectionId,
    ) -> WsResult<ClientSession> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(ClientState::Connecting as u8));

        let client_id = {
            let mut hub = self.inner.state.lock();
            if hub.closed {
                return Err(WsError::HubClosed);
            }
            let client_id = match requested.map(str::trim) {
                Some(id) if !id.is_empty() && !hub.clients.contains_key(id) => id.to_string(),
                Some(id) if !id.is_empty() => {
                    debug!(requested = %id, %connection_id, "client id taken, using connection id");
                    connection_id.to_string()
                }
                _ => connection_id.to_string(),
            };
            hub.clients.insert(
                client_id.clone(),
                ClientEntry {
                    connection_id,
                    sender: sender.clone(),
                    state: Arc::clone(&state),
                    last_activity: Instant::now(),
                    subscriptions: HashSet::new(),
                    component: None,
                },
            );
            client_id
        };

        if let Some(coordinator) = &self.inner.coordinator {
            let stopper = ClientStopper {
                hub: Arc::downgrade(&self.inner),
                client_id: client_id.clone(),
                connection_id,
            };
            let handle = coordinator.register(
                format!("ws_client:{client_id}"),
                ComponentKind::WebSocketClient,
                Some(Arc::new(stopper)),
                self.inner.config.client_priority,
            );
            self.attach_component(&client_id, connection_id, handle);
        }

        match Envelope::welcome(&client_id).to_text() {
            // The receiver is alive: it is returned below.
            Ok(welcome) => drop(sender.send(Outbound::Text(welcome))),
            Err(e) => warn!(client_id = %client_id, error = %e, "welcome not sent"),
        }
        ClientState::advance(&state, ClientState::Open);

        let count = self.client_count();
        set_ws_clients(count);
        info!(client_id = %client_id, %connection_id, clients = count, "WebSocket client connected");

        Ok(ClientSession {
            client_id,
            connection_id,
            receiver,
        })
    }

    fn attach_component(&self, client_id: &str, connection_id: ConnectionId, handle: ComponentHandle) {
        let attached = {
            let mut hub = self.inner.state.lock();
            match hub.clients.get_mut(client_id) {
                Some(entry) if entry.connection_id == connection_id => {
                    entry.component = Some(handle);
                    true
                }
                _ => false,
            }
        };
        if !attached {
            // The client disconnected before its component was attached.
            self.stop_component(Some(handle));
        }
    }

    fn stop_component(&self, handle: Option<ComponentHandle>) {
        let (Some(coordinator), Some(handle)) = (&self.inner.coordinator, handle) else {
            return;
        };
        coordinator.mark_stopped(handle);
        if let Err(e) = coordinator.release(handle) {
            debug!(error = %e, "client component already released");
        }
    }

    /// Removes a client whose connection ended.
    ///
    /// The client leaves every topic before its component is marked
    /// `STOPPED`; the component slot is then released.
    pub fn disconnect(&self, session: &ClientSession) -> bool {
        self.remove_client(&session.client_id, session.connection_id)
    }

    fn remove_client(&self, client_id: &str, connection_id: ConnectionId) -> bool {
        let (component, remaining) = {
            let mut guard = self.inner.state.lock();
            let hub = &mut *guard;
            match hub.clients.get(client_id) {
                Some(entry) if entry.connection_id == connection_id => {}
                _ => return false,
            }
            let Some(entry) = hub.clients.remove(client_id) else {
                return false;
            };
            ClientState::advance(&entry.state, ClientState::Closing);
            for topic in &entry.subscriptions {
                if let Some(subscribers) = hub.topics.get_mut(topic) {
                    subscribers.remove(client_id);
                    if subscribers.is_empty() {
                        hub.topics.remove(topic);
                    }
                }
            }
            ClientState::advance(&entry.state, ClientState::Closed);
            (entry.component, hub.clients.len())
        };

        self.stop_component(component);
        set_ws_clients(remaining);
        info!(client_id = %client_id, %connection_id, clients = remaining, "WebSocket client disconnected");
        true
    }

    /// Records inbound activity for the idle sweep.
    pub fn touch(&self, client_id: &str) {
        if let Some(entry) = self.inner.state.lock().clients.get_mut(client_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Handles one inbound text frame.
    ///
    /// `subscribe` and `unsubscribe` are answered with an ack. Any other type
    /// goes to the topic's handler. Malformed frames and unknown topics are
    /// answered with an error envelope; the connection stays open.
    pub fn handle_text(&self, client_id: &str, text: &str) {
        self.touch(client_id);

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "malformed frame");
                self.send_to_client(client_id, &Envelope::error(&e.to_string()));
                return;
            }
        };

        match envelope.kind.as_str() {
            "subscribe" => match envelope.requested_topic() {
                Some(topic) => {
                    if self.subscribe(client_id, topic) {
                        self.send_to_client(client_id, &Envelope::ack("Subscribed", topic));
                    }
                }
                None => {
                    self.send_to_client(client_id, &Envelope::error("missing topic"));
                }
            },
            "unsubscribe" => match envelope.requested_topic() {
                Some(topic) => {
                    if self.unsubscribe(client_id, topic) {
                        self.send_to_client(client_id, &Envelope::ack("Unsubscribed", topic));
                    }
                }
                None => {
                    self.send_to_client(client_id, &Envelope::error("missing topic"));
                }
            },
            _ => self.dispatch(client_id, &envelope),
        }
    }

    fn dispatch(&self, client_id: &str, envelope: &Envelope) {
        let handler = self.inner.state.lock().handlers.get(&envelope.topic).cloned();
        let Some(handler) = handler else {
            debug!(client_id = %client_id, topic = %envelope.topic, "no handler for topic");
            let err = WsError::UnknownTopic(envelope.topic.clone());
            self.send_to_client(client_id, &Envelope::error(&err.to_string()));
            return;
        };

        let payload = envelope.payload.to_string();
        let message = TopicMessage {
            client_id,
            topic: &envelope.topic,
            kind: &envelope.kind,
            payload: &payload,
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(self, &message))).is_err() {
            error!(client_id = %client_id, topic = %envelope.topic, "topic handler panicked");
            self.send_to_client(client_id, &Envelope::error("internal error"));
        }
    }

    /// Subscribes a client to a topic. Returns `false` for an unknown or
    /// closing client.
    pub fn subscribe(&self, client_id: &str, topic: &str) -> bool {
        let mut guard = self.inner.state.lock();
        let hub = &mut *guard;
        let Some(entry) = hub.clients.get_mut(client_id) else {
            return false;
        };
        if entry.state() >= ClientState::Closing {
            return false;
        }
        entry.subscriptions.insert(topic.to_string());
        hub.topics
            .entry(topic.to_string())
            .or_default()
            .insert(client_id.to_string());
        debug!(client_id = %client_id, topic = %topic, "subscribed");
        true
    }

    /// Removes a client from a topic. Returns `false` for an unknown client.
    pub fn unsubscribe(&self, client_id: &str, topic: &str) -> bool {
        let mut guard = self.inner.state.lock();
        let hub = &mut *guard;
        let Some(entry) = hub.clients.get_mut(client_id) else {
            return false;
        };
        entry.subscriptions.remove(topic);
        if let Some(subscribers) = hub.topics.get_mut(topic) {
            subscribers.remove(client_id);
            if subscribers.is_empty() {
                hub.topics.remove(topic);
            }
        }
        debug!(client_id = %client_id, topic = %topic, "unsubscribed");
        true
    }

    /// Sends an envelope to every subscriber of `topic`.
    ///
    /// Returns the number of deliveries. A subscriber whose connection has
    /// closed is skipped and not counted.
    pub fn broadcast(&self, topic: &str, envelope: &Envelope) -> usize {
        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(topic = %topic, error = %e, "broadcast dropped");
                return 0;
            }
        };

        let (subscribers, delivered) = {
            let hub = self.inner.state.lock();
            match hub.topics.get(topic) {
                Some(ids) => {
                    let delivered = ids
                        .iter()
                        .filter_map(|id| hub.clients.get(id))
                        .filter(|entry| entry.deliver(&text))
                        .count();
                    (ids.len(), delivered)
                }
                None => (0, 0),
            }
        };

        record_broadcast_delivered(topic, delivered);
        debug!(topic = %topic, subscribers, delivered, "broadcast");
        delivered
    }

    /// Sends an envelope to one client. Returns `true` if it was queued.
    pub fn send_to_client(&self, client_id: &str, envelope: &Envelope) -> bool {
        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "message dropped");
                return false;
            }
        };
        self.inner
            .state
            .lock()
            .clients
            .get(client_id)
            .is_some_and(|entry| entry.deliver(&text))
    }

    /// Queues a close frame for one client.
    pub fn close_client(&self, client_id: &str, code: CloseCode, reason: &str) -> bool {
        self.inner
            .state
            .lock()
            .clients
            .get(client_id)
            .is_some_and(|entry| entry.close(code, reason))
    }

    fn close_connection(
        &self,
        client_id: &str,
        connection_id: ConnectionId,
        code: CloseCode,
        reason: &str,
    ) -> bool {
        self.inner
            .state
            .lock()
            .clients
            .get(client_id)
            .filter(|entry| entry.connection_id == connection_id)
            .is_some_and(|entry| entry.close(code, reason))
    }

    /// Queues a close frame for every client. Returns how many were queued.
    pub fn close_all(&self, code: CloseCode) -> usize {
        let reason = match code {
            CloseCode::GoingAway => "server shutting down",
            _ => "",
        };
        let closed = self
            .inner
            .state
            .lock()
            .clients
            .values()
            .filter(|entry| entry.close(code, reason))
            .count();
        info!(clients = closed, code = %code, "closing all WebSocket clients");
        closed
    }

    /// Drops clients with no inbound activity for longer than `max_idle`.
    ///
    /// Live connections are sent a close frame and leave the hub once their
    /// task ends. Clients whose task is already gone are removed at once.
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let mut dead = Vec::new();
        let mut closed = 0;
        {
            let hub = self.inner.state.lock();
            for (id, entry) in &hub.clients {
                if entry.last_activity.elapsed() <= max_idle || entry.state() >= ClientState::Closing {
                    continue;
                }
                closed += 1;
                if !entry.close(CloseCode::Normal, "idle timeout") {
                    dead.push((id.clone(), entry.connection_id));
                }
            }
        }
        for (client_id, connection_id) in dead {
            self.remove_client(&client_id, connection_id);
        }
        if closed > 0 {
            info!(clients = closed, max_idle_secs = max_idle.as_secs(), "idle WebSocket clients dropped");
        }
        closed
    }

    /// Returns the number of registered clients.
    pub fn client_count(&self) -> usize {
        self.inner.state.lock().clients.len()
    }

    /// Returns the subscribers of `topic`, sorted.
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the state of a client, `None` once it left the hub.
    pub fn client_state(&self, client_id: &str) -> Option<ClientState> {
        self.inner
            .state
            .lock()
            .clients
            .get(client_id)
            .map(ClientEntry::state)
    }

    /// Returns `true` once the hub refuses new clients.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Refuses new clients and sends close 1001 to every connected one.
    ///
    /// Returns the number of clients asked to close. Idempotent.
    pub fn shutdown(&self) -> usize {
        {
            let mut hub = self.inner.state.lock();
            if hub.closed {
                return 0;
            }
            hub.closed = true;
        }
        self.close_all(CloseCode::GoingAway)
    }
}

impl Stoppable for Hub {
    fn stop(&self) -> bool {
        self.shutdown();
        true
    }
}

/// Coordinator owner for one client component.
///
/// Stopping queues a close frame and leaves the component in `STOPPING`
/// until the connection task reports the socket closed.
struct ClientStopper {
    hub: Weak<HubInner>,
    client_id: String,
    connection_id: ConnectionId,
}

impl Stoppable for ClientStopper {
    fn stop(&self) -> bool {
        let Some(inner) = self.hub.upgrade() else {
            return true;
        };
        let hub = Hub { inner };
        if hub.close_connection(
            &self.client_id,
            self.connection_id,
            CloseCode::GoingAway,
            "server shutting down",
        ) {
            return false;
        }
        // No task is left to report the close.
        hub.remove_client(&self.client_id, self.connection_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::ComponentState;
    use serde_json::{json, Value};

    fn drain(session: &mut ClientSession) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = session.receiver.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn texts(session: &mut ClientSession) -> Vec<Value> {
        drain(session)
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Text(text) => serde_json::from_str(&text).ok(),
                Outbound::Close { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_sends_welcome_and_opens() {
        let hub = Hub::new(HubConfig::default());
        let mut session = hub.connect(Some("wall"), ConnectionId::new()).unwrap();

        assert_eq!(session.client_id(), "wall");
        assert_eq!(hub.client_state("wall"), Some(ClientState::Open));
        let frames = texts(&mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "welcome");
        assert_eq!(frames[0]["payload"]["client_id"], "wall");
    }

    #[test]
    fn test_taken_or_empty_id_falls_back_to_connection_id() {
        let hub = Hub::new(HubConfig::default());
        let _first = hub.connect(Some("wall"), ConnectionId::new()).unwrap();

        let conn = ConnectionId::new();
        let second = hub.connect(Some("wall"), conn).unwrap();
        assert_eq!(second.client_id(), conn.to_string());

        let conn = ConnectionId::new();
        let third = hub.connect(Some(""), conn).unwrap();
        assert_eq!(third.client_id(), conn.to_string());
        assert_eq!(hub.client_count(), 3);
    }

    #[test]
    fn test_subscribe_and_unsubscribe_ack() {
        let hub = Hub::new(HubConfig::default());
        let mut session = hub.connect(Some("c1"), ConnectionId::new()).unwrap();
        drain(&mut session);

        hub.handle_text("c1", r#"{"type":"subscribe","topic":"events"}"#);
        assert_eq!(hub.subscribers("events"), vec!["c1".to_string()]);
        let frames = texts(&mut session);
        assert_eq!(
            frames[0],
            json!({"type":"ack","topic":"system","payload":{"message":"Subscribed","topic":"events"}})
        );

        hub.handle_text("c1", r#"{"type":"unsubscribe","topic":"events"}"#);
        assert!(hub.subscribers("events").is_empty());
        assert_eq!(texts(&mut session)[0]["payload"]["message"], "Unsubscribed");
    }

    #[test]
    fn test_malformed_frame_gets_error_and_stays_open() {
        let hub = Hub::new(HubConfig::default());
        let mut session = hub.connect(Some("c1"), ConnectionId::new()).unwrap();
        drain(&mut session);

        hub.handle_text("c1", "{not json");
        let frames = texts(&mut session);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(hub.client_state("c1"), Some(ClientState::Open));
    }

    #[test]
    fn test_unknown_topic_gets_error() {
        let hub = Hub::new(HubConfig::default());
        let mut session = hub.connect(Some("c1"), ConnectionId::new()).unwrap();
        drain(&mut session);

        hub.handle_text("c1", r#"{"type":"command","topic":"ptz","payload":{}}"#);
        let frames = texts(&mut session);
        assert_eq!(frames[0]["type"], "error");
        assert!(frames[0]["payload"]["message"]
            .as_str()
            .unwrap()
            .contains("unknown topic: ptz"));
    }

    #[test]
    fn test_topic_handler_receives_client_and_payload() {
        let hub = Hub::new(HubConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hub.register_topic_handler("ptz", move |hub: &Hub, msg: &TopicMessage<'_>| {
            sink.lock().push((msg.client_id.to_string(), msg.payload.to_string()));
            hub.send_to_client(msg.client_id, &Envelope::new("result", "ptz", json!({"ok": true})));
        });
        assert!(hub.has_topic_handler("ptz"));

        let mut session = hub.connect(Some("c1"), ConnectionId::new()).unwrap();
        drain(&mut session);
        hub.handle_text("c1", r#"{"type":"move","topic":"ptz","payload":{"pan":10}}"#);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "c1");
        let payload: Value = serde_json::from_str(&seen[0].1).unwrap();
        assert_eq!(payload, json!({"pan": 10}));
        assert_eq!(texts(&mut session)[0]["type"], "result");
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let hub = Hub::new(HubConfig::default());
        hub.register_topic_handler("boom", |_: &Hub, _: &TopicMessage<'_>| panic!("handler bug"));
        let mut session = hub.connect(Some("c1"), ConnectionId::new()).unwrap();
        drain(&mut session);

        hub.handle_text("c1", r#"{"type":"go","topic":"boom"}"#);
        assert_eq!(texts(&mut session)[0]["payload"]["message"], "internal error");
        assert_eq!(hub.client_state("c1"), Some(ClientState::Open));
    }

    #[test]
    fn test_broadcast_counts_only_live_subscribers() {
        let hub = Hub::new(HubConfig::default());
        let mut live = Vec::new();
        let mut gone = Vec::new();
        for i in 0..7 {
            let id = format!("c{i}");
            let session = hub.connect(Some(&id), ConnectionId::new()).unwrap();
            assert!(hub.subscribe(&id, "events"));
            if i % 3 == 0 {
                gone.push(session);
            } else {
                live.push(session);
            }
        }
        // Peers whose socket task ended drop their receiver.
        let closed = gone.len();
        drop(gone);

        let delivered = hub.broadcast("events", &Envelope::event("events", json!({"n": 1})));
        assert_eq!(delivered, 7 - closed);

        for session in &mut live {
            let frames = texts(session);
            assert_eq!(frames.last().unwrap()["payload"]["n"], 1);
        }
    }

    #[test]
    fn test_broadcast_to_unknown_topic_is_zero() {
        let hub = Hub::new(HubConfig::default());
        let _session = hub.connect(Some("c1"), ConnectionId::new()).unwrap();
        assert_eq!(hub.broadcast("nobody", &Envelope::event("nobody", Value::Null)), 0);
    }

    #[test]
    fn test_disconnect_removes_from_every_topic() {
        let hub = Hub::new(HubConfig::default());
        let session = hub.connect(Some("c1"), ConnectionId::new()).unwrap();
        hub.subscribe("c1", "events");
        hub.subscribe("c1", "alarms");

        assert!(hub.disconnect(&session));
        assert!(hub.subscribers("events").is_empty());
        assert!(hub.subscribers("alarms").is_empty());
        assert_eq!(hub.client_state("c1"), None);
        assert!(!hub.disconnect(&session));
    }

    #[test]
    fn test_stale_session_does_not_remove_new_owner() {
        let hub = Hub::new(HubConfig::default());
        let old = hub.connect(Some("c1"), ConnectionId::new()).unwrap();
        assert!(hub.disconnect(&old));
        let _new = hub.connect(Some("c1"), ConnectionId::new()).unwrap();

        assert!(!hub.disconnect(&old));
        assert_eq!(hub.client_state("c1"), Some(ClientState::Open));
    }

    #[test]
    fn test_close_all_queues_going_away() {
        let hub = Hub::new(HubConfig::default());
        let mut a = hub.connect(Some("a"), ConnectionId::new()).unwrap();
        let _b = hub.connect(Some("b"), ConnectionId::new()).unwrap();

        assert_eq!(hub.close_all(CloseCode::GoingAway), 2);
        assert_eq!(hub.client_state("a"), Some(ClientState::Closing));
        let last = drain(&mut a).pop().unwrap();
        assert!(matches!(last, Outbound::Close { code: CloseCode::GoingAway, .. }));
        // Closing clients get no further deliveries.
        assert!(!hub.send_to_client("a", &Envelope::error("late")));
    }

    #[test]
    fn test_state_never_moves_backward() {
        let cell = AtomicU8::new(ClientState::Closing as u8);
        assert!(!ClientState::advance(&cell, ClientState::Open));
        assert_eq!(ClientState::load(&cell), ClientState::Closing);
        assert!(ClientState::advance(&cell, ClientState::Closed));
        assert!(!ClientState::advance(&cell, ClientState::Closed));
    }

    #[test]
    fn test_cleanup_idle() {
        let hub = Hub::new(HubConfig::default());
        let mut live = hub.connect(Some("live"), ConnectionId::new()).unwrap();
        let dead = hub.connect(Some("dead"), ConnectionId::new()).unwrap();
        drop(dead);

        assert_eq!(hub.cleanup_idle(Duration::from_secs(3600)), 0);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hub.cleanup_idle(Duration::from_millis(5)), 2);
        assert_eq!(hub.client_state("dead"), None);
        assert_eq!(hub.client_state("live"), Some(ClientState::Closing));
        assert!(matches!(
            drain(&mut live).pop(),
            Some(Outbound::Close { code: CloseCode::Normal, .. })
        ));
    }

    #[test]
    fn test_shutdown_refuses_new_clients() {
        let hub = Hub::new(HubConfig::default());
        let _a = hub.connect(Some("a"), ConnectionId::new()).unwrap();
        assert_eq!(hub.shutdown(), 1);
        assert_eq!(hub.shutdown(), 0);
        assert!(hub.is_closed());
        assert_eq!(
            hub.connect(None, ConnectionId::new()).unwrap_err(),
            WsError::HubClosed
        );
    }

    #[test]
    fn test_clients_stop_through_coordinator() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let hub = Hub::with_coordinator(HubConfig::default(), Arc::clone(&coordinator));
        let hub_handle = coordinator.register(
            "ws_hub",
            ComponentKind::WebSocketHub,
            Some(Arc::new(hub.clone())),
            30,
        );

        let mut session = hub.connect(Some("c1"), ConnectionId::new()).unwrap();
        hub.subscribe("c1", "events");
        assert_eq!(coordinator.len(), 2);

        assert!(coordinator.begin_shutdown());
        assert!(hub.is_closed());
        assert_eq!(coordinator.state(hub_handle), Some(ComponentState::Stopped));
        // The client stays registered until its socket task reports the close.
        assert_eq!(hub.client_state("c1"), Some(ClientState::Closing));
        assert!(matches!(
            drain(&mut session).pop(),
            Some(Outbound::Close { code: CloseCode::GoingAway, .. })
        ));

        assert!(hub.disconnect(&session));
        assert!(hub.subscribers("events").is_empty());
        assert!(coordinator.wait_for_all_stopped(Duration::from_secs(1)));
    }

    #[test]
    fn test_client_component_released_on_disconnect() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let hub = Hub::with_coordinator(HubConfig::default(), Arc::clone(&coordinator));
        let session = hub.connect(None, ConnectionId::new()).unwrap();
        assert_eq!(coordinator.len(), 1);

        assert!(hub.disconnect(&session));
        assert!(coordinator.is_empty());
    }

    #[test]
    fn test_dead_client_purged_when_coordinator_stops_it() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let hub = Hub::with_coordinator(HubConfig::default(), Arc::clone(&coordinator));
        let session = hub.connect(Some("c1"), ConnectionId::new()).unwrap();
        hub.subscribe("c1", "events");
        drop(session);

        coordinator.begin_shutdown();
        assert!(hub.subscribers("events").is_empty());
        assert_eq!(hub.client_count(), 0);
        assert!(coordinator.wait_for_all_stopped(Duration::from_millis(100)));
    }
}
