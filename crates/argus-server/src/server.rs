//! Server assembly and lifecycle.
//!
//! [`ServerBuilder`] collects routes and collaborators, [`Server::start`]
//! binds the listener and moves the event loop onto its own thread, and
//! [`RunningServer::stop`] brings it down again.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use argus_core::{
    ExecutionMode, Handler, HandlerRequest, HandlerResponse, Owner, ShutdownCoordinator, ShutdownSignal,
    Stoppable, Versioned,
};
use argus_router::{Router, ShadowPolicy};
use argus_sidecar::MediaProxy;
use argus_tasks::{PoolConfig, WorkerPool};
use argus_ws::{Hub, HubConfig, TopicHandler};
use http::Method;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::auth::{MemorySessionStore, SessionStore};
use crate::config::{AccessPolicy, ServerConfig};
use crate::dispatch::{Dispatcher, RouteTarget};
use crate::error::{ServerError, ServerResult};
use crate::event_loop::EventLoop;
use crate::registry::{ConnectionRegistry, ServerStats};
use crate::static_files::StaticFiles;

const LOOP_THREAD_NAME: &str = "argus-event-loop";

struct PendingRoute {
    method: Option<Method>,
    pattern: String,
    target: RouteTarget,
}

type TopicRegistration = Box<dyn FnOnce(&Hub) + Send>;

/// Builder for [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    shadow_policy: ShadowPolicy,
    routes: Vec<PendingRoute>,
    registry: Arc<ConnectionRegistry>,
    policy: Option<Arc<Versioned<AccessPolicy>>>,
    sessions: Option<Arc<dyn SessionStore>>,
    hub: Option<Hub>,
    hub_config: Option<HubConfig>,
    topic_handlers: Vec<TopicRegistration>,
    proxy: Option<MediaProxy>,
    pool: Option<Arc<WorkerPool>>,
    pool_config: Option<PoolConfig>,
    coordinator: Option<Arc<ShutdownCoordinator>>,
    owner: Option<Owner>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// Creates a builder with default settings and no routes.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            shadow_policy: ShadowPolicy::default(),
            routes: Vec::new(),
            registry: Arc::new(ConnectionRegistry::new()),
            policy: None,
            sessions: None,
            hub: None,
            hub_config: None,
            topic_handlers: Vec::new(),
            proxy: None,
            pool: None,
            pool_config: None,
            coordinator: None,
            owner: None,
        }
    }

    /// Sets the server configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an inline handler. Inline handlers run on the loop thread
    /// and must not block.
    #[must_use]
    pub fn route(self, method: Method, pattern: &str, handler: impl Handler) -> Self {
        self.handler(Some(method), pattern, handler, ExecutionMode::Inline)
    }

    /// Registers a handler that runs on the worker pool.
    #[must_use]
    pub fn worker_route(self, method: Method, pattern: &str, handler: impl Handler) -> Self {
        self.handler(Some(method), pattern, handler, ExecutionMode::Worker)
    }

    /// Registers a handler. `None` matches every method.
    #[must_use]
    pub fn handler(
        mut self,
        method: Option<Method>,
        pattern: &str,
        handler: impl Handler,
        mode: ExecutionMode,
    ) -> Self {
        self.routes.push(PendingRoute {
            method,
            pattern: pattern.to_string(),
            target: RouteTarget {
                handler: Arc::new(handler),
                mode,
            },
        });
        self
    }

    /// Registers `GET path` returning [`ServerStats`] as JSON.
    #[must_use]
    pub fn stats_route(self, path: &str) -> Self {
        let registry = Arc::clone(&self.registry);
        self.route(Method::GET, path, move |_req: &HandlerRequest, res: &mut HandlerResponse| {
            res.json(&registry.stats());
        })
    }

    /// Sets how overlapping route patterns are treated.
    #[must_use]
    pub fn shadow_policy(mut self, policy: ShadowPolicy) -> Self {
        self.shadow_policy = policy;
        self
    }

    /// Sets a fixed access policy.
    #[must_use]
    pub fn access_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = Some(Arc::new(Versioned::new(policy)));
        self
    }

    /// Shares an access policy cell that can be replaced while running.
    #[must_use]
    pub fn shared_policy(mut self, policy: Arc<Versioned<AccessPolicy>>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sets the session store. Defaults to an empty [`MemorySessionStore`].
    #[must_use]
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    /// Uses an existing hub for the WebSocket endpoint.
    #[must_use]
    pub fn hub(mut self, hub: Hub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Configures the hub created when none is given.
    #[must_use]
    pub fn hub_config(mut self, config: HubConfig) -> Self {
        self.hub_config = Some(config);
        self
    }

    /// Registers a topic handler on the hub.
    #[must_use]
    pub fn topic_handler(mut self, topic: impl Into<String>, handler: impl TopicHandler) -> Self {
        let topic = topic.into();
        self.topic_handlers
            .push(Box::new(move |hub: &Hub| hub.register_topic_handler(topic, handler)));
        self
    }

    /// Forwards the proxy's prefix to a companion service.
    #[must_use]
    pub fn proxy(mut self, proxy: MediaProxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Uses a shared worker pool. The server does not shut it down.
    #[must_use]
    pub fn worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Configures the pool created when worker routes exist and no pool
    /// was given. That pool is shut down with the server.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = Some(config);
        self
    }

    /// Registers WebSocket clients of a created hub with `coordinator`.
    #[must_use]
    pub fn coordinator(mut self, coordinator: Arc<ShutdownCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Attaches a value every handler can reach through
    /// [`HandlerRequest::owner`].
    #[must_use]
    pub fn owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Validates the configuration and builds the route table.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration, a rejected route
    /// pattern, or a worker pool that cannot be created.
    pub fn build(self) -> ServerResult<Server> {
        self.config.validate()?;

        let mut router = Router::with_shadow_policy(self.shadow_policy);
        let mut has_worker_routes = false;
        for route in self.routes {
            has_worker_routes |= route.target.mode == ExecutionMode::Worker;
            router.insert(route.method, &route.pattern, route.target)?;
        }

        let (pool, owned_pool) = match self.pool {
            Some(pool) => (Some(pool), None),
            None if has_worker_routes => {
                let config = self
                    .pool_config
                    .unwrap_or_else(|| PoolConfig::new().with_thread_name("argus-worker"));
                let pool = Arc::new(WorkerPool::new(config)?);
                (Some(Arc::clone(&pool)), Some(pool))
            }
            None => (None, None),
        };

        let hub = match self.hub {
            Some(hub) => hub,
            None => {
                let config = self.hub_config.unwrap_or_default();
                match self.coordinator {
                    Some(coordinator) => Hub::with_coordinator(config, coordinator),
                    None => Hub::new(config),
                }
            }
        };
        for register in self.topic_handlers {
            register(&hub);
        }

        let static_files = self.config.static_root.as_ref().map(|root| {
            let files = StaticFiles::new(root);
            match &self.config.spa_index {
                Some(index) => files.spa_fallback(index.clone()),
                None => files,
            }
        });

        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(Versioned::new(AccessPolicy::default())));
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        debug!(routes = router.len(), websocket = %self.config.ws_path, "server built");

        Ok(Server {
            dispatcher: Arc::new(Dispatcher {
                config: self.config,
                router,
                policy,
                sessions,
                registry: self.registry,
                hub,
                proxy: self.proxy,
                pool,
                static_files,
                owner: self.owner,
                ws_tasks: Mutex::new(JoinSet::new()),
            }),
            owned_pool,
        })
    }
}

/// A configured server that has not started yet.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    owned_pool: Option<Arc<WorkerPool>>,
}

impl Server {
    /// Creates a builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The hub behind the WebSocket endpoint.
    pub fn hub(&self) -> &Hub {
        &self.dispatcher.hub
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.dispatcher.registry
    }

    /// The access policy cell.
    pub fn policy(&self) -> &Arc<Versioned<AccessPolicy>> {
        &self.dispatcher.policy
    }

    #[cfg(test)]
    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Binds `addr` and starts the event loop on its own thread.
    ///
    /// Returns once the listener accepts connections.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the address cannot be bound and
    /// [`ServerError::Runtime`] when the loop thread cannot start.
    pub fn start(self, addr: &str) -> ServerResult<RunningServer> {
        let bind_error = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };
        let std_listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = std_listener.local_addr().map_err(bind_error)?;

        let stop = ShutdownSignal::new();
        let registry = Arc::clone(&self.dispatcher.registry);
        let interval = self.dispatcher.config.poll_interval();
        let dispatcher = self.dispatcher;
        let loop_stop = stop.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let thread = thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match TcpListener::from_std(std_listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.to_string()));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    EventLoop::new(listener, dispatcher, loop_stop).run(interval).await;
                });
            })
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(ServerError::Runtime(message)),
            Err(_) => return Err(ServerError::Runtime("event loop thread exited".to_string())),
        }
        info!(addr = %local_addr, "server listening");

        Ok(RunningServer {
            local_addr,
            stop,
            registry,
            thread: Mutex::new(Some(thread)),
            owned_pool: self.owned_pool,
            stopped: AtomicBool::new(false),
        })
    }
}

/// A started server. Dropping it stops the server.
pub struct RunningServer {
    local_addr: SocketAddr,
    stop: ShutdownSignal,
    registry: Arc<ConnectionRegistry>,
    thread: Mutex<Option<JoinHandle<()>>>,
    owned_pool: Option<Arc<WorkerPool>>,
    stopped: AtomicBool,
}

impl RunningServer {
    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current statistics.
    pub fn stats(&self) -> ServerStats {
        self.registry.stats()
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stops the server and waits for the loop thread to finish.
    ///
    /// Safe to call more than once. Called from the loop thread itself it
    /// only sets the stop flag and returns `false`.
    pub fn stop(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return true;
        }
        if self.stop.trigger() {
            info!(addr = %self.local_addr, "server stopping");
        }

        let handle = {
            let mut slot = self.thread.lock();
            match slot.as_ref() {
                Some(handle) if handle.thread().id() == thread::current().id() => return false,
                _ => slot.take(),
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("event loop thread panicked");
            }
        }

        if let Some(pool) = &self.owned_pool {
            let dropped = pool.shutdown();
            if dropped > 0 {
                warn!(jobs = dropped, "queued worker jobs dropped");
            }
        }
        self.stopped.store(true, Ordering::SeqCst);
        true
    }
}

impl Stoppable for RunningServer {
    fn stop(&self) -> bool {
        Self::stop(self)
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.stop();
    }
}
