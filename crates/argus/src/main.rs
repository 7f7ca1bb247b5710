//! The `argus` server binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use argus::config::{ArgusConfig, ConfigLoader, ConfigWatcher, ENV_PREFIX};
use argus::core::{ComponentKind, ShutdownCoordinator, ShutdownSignal, Stoppable, Versioned};
use argus::server::{MemorySessionStore, Server, SessionStore};
use argus::sidecar::MediaProxy;
use argus::tasks::WorkerPool;
use argus::ws::Hub;
use clap::Parser;
use tracing::{error, info, warn};

const HUB_PRIORITY: i32 = 30;
const LISTENER_PRIORITY: i32 = 20;
const POOL_PRIORITY: i32 = 10;

#[derive(Debug, Parser)]
#[command(name = "argus", version, about = "Argus NVR web server")]
struct Cli {
    /// Configuration file (TOML or JSON).
    #[arg(short, long, default_value = "argus.toml")]
    config: PathBuf,

    /// Do not reload the access policy when the file changes.
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .with_dotenv()
        .with_optional_file(&cli.config)?
        .with_env_prefix(ENV_PREFIX)
        .load()
        .with_context(|| format!("loading {}", cli.config.display()))?;
    argus::telemetry::init_telemetry(&config.telemetry)?;
    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "argus starting");

    run(cli, config).await
}

async fn run(cli: Cli, config: ArgusConfig) -> anyhow::Result<()> {
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let pool = Arc::new(WorkerPool::new(config.workers.pool_config())?);
    let hub = Hub::with_coordinator(config.websocket.hub_config(), Arc::clone(&coordinator));
    let policy = Arc::new(Versioned::new(config.access_policy()));
    let sessions = Arc::new(MemorySessionStore::new());

    let mut builder = Server::builder()
        .config(config.server.clone())
        .shared_policy(Arc::clone(&policy))
        .session_store(Arc::clone(&sessions) as Arc<dyn SessionStore>)
        .hub(hub.clone())
        .worker_pool(Arc::clone(&pool));
    if config.proxy.enabled {
        builder = builder.proxy(MediaProxy::new(config.proxy.clone())?);
    }
    let server = argus::routes::install(builder, &policy, &sessions).build()?;
    let running = Arc::new(server.start(&config.server.bind)?);
    info!(addr = %running.local_addr(), "listening");

    let hub_owner: Arc<dyn Stoppable> = Arc::new(hub.clone());
    let listener_owner: Arc<dyn Stoppable> = Arc::clone(&running) as Arc<dyn Stoppable>;
    let pool_owner: Arc<dyn Stoppable> = Arc::clone(&pool) as Arc<dyn Stoppable>;
    coordinator.register("websocket-hub", ComponentKind::WebSocketHub, Some(hub_owner), HUB_PRIORITY);
    coordinator.register("http-listener", ComponentKind::HttpListener, Some(listener_owner), LISTENER_PRIORITY);
    coordinator.register("worker-pool", ComponentKind::WorkerPool, Some(pool_owner), POOL_PRIORITY);

    tokio::spawn(housekeeping(
        hub,
        Arc::clone(&sessions),
        config.websocket.hub_config().idle_timeout,
        config.websocket.cleanup_interval(),
        coordinator.subscribe(),
    ));

    if cli.no_watch || !cli.config.exists() {
        info!("configuration watcher disabled");
    } else {
        let watcher = ConfigWatcher::new(&cli.config, Arc::clone(&policy)).with_env_prefix(ENV_PREFIX);
        let stop = coordinator.subscribe();
        tokio::spawn(async move {
            if let Err(e) = watcher.run(stop).await {
                warn!(error = %e, "configuration watcher failed");
            }
        });
    }

    wait_for_signal(coordinator.subscribe()).await;

    let timeout = config.server.shutdown_timeout();
    let shutdown = Arc::clone(&coordinator);
    let clean = tokio::task::spawn_blocking(move || {
        shutdown.begin_shutdown();
        shutdown.wait_for_all_stopped(timeout)
    })
    .await?;

    if clean {
        info!("shutdown complete");
    } else {
        error!(timeout_secs = timeout.as_secs(), "components still running at shutdown timeout");
    }
    Ok(())
}

/// Drops idle WebSocket clients and expired sessions until shutdown.
async fn housekeeping(
    hub: Hub,
    sessions: Arc<MemorySessionStore>,
    idle_timeout: Duration,
    interval: Duration,
    stop: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = stop.wait() => break,
            _ = ticker.tick() => {
                let idle = hub.cleanup_idle(idle_timeout);
                let expired = sessions.purge_expired();
                if idle > 0 || expired > 0 {
                    info!(idle_clients = idle, expired_sessions = expired, "housekeeping");
                }
            }
        }
    }
}

async fn wait_for_signal(stop: ShutdownSignal) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("interrupt received, shutting down"),
        () = terminate => info!("SIGTERM received, shutting down"),
        () = stop.wait() => info!("shutdown requested"),
    }
}
