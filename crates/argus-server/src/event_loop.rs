//! The single-threaded accept loop and per-connection tasks.
//!
//! The loop is polled in bounded steps so that the stop flag is observed
//! within one poll interval. Teardown happens on the loop thread, in order:
//! stop accepting, ask every connection to close, send WebSocket close
//! frames, wait a grace period, force whatever is left, let the closes
//! settle, wait out the WebSocket tasks, then abort the remaining tasks.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use argus_core::{ConnectionId, ShutdownSignal};
use argus_ws::CloseCode;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::dispatch::{ConnContext, Dispatcher};
use crate::registry::CloseSignal;

/// Result of one [`EventLoop::poll_once`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A connection was accepted and its task spawned.
    Accepted(ConnectionId),
    /// Nothing arrived within the timeout.
    Idle,
    /// The stop flag is set or the listener is gone.
    Stopped,
}

enum Event {
    Stop,
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Idle,
}

/// Accepts connections and owns every connection task.
pub struct EventLoop {
    listener: Option<TcpListener>,
    dispatcher: Arc<Dispatcher>,
    stop: ShutdownSignal,
    tasks: JoinSet<()>,
}

impl EventLoop {
    pub(crate) fn new(listener: TcpListener, dispatcher: Arc<Dispatcher>, stop: ShutdownSignal) -> Self {
        Self {
            listener: Some(listener),
            dispatcher,
            stop,
            tasks: JoinSet::new(),
        }
    }

    /// Address of the listener, `None` once it was closed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Number of connection tasks still running, upgraded WebSocket
    /// connections included.
    pub fn task_count(&self) -> usize {
        self.tasks.len() + self.dispatcher.ws_tasks.lock().len()
    }

    /// Waits at most `timeout` for one connection.
    pub async fn poll_once(&mut self, timeout: Duration) -> PollOutcome {
        self.reap();

        let Some(listener) = &self.listener else {
            tokio::time::sleep(timeout).await;
            self.reap();
            return PollOutcome::Stopped;
        };
        if self.stop.is_triggered() {
            return PollOutcome::Stopped;
        }

        let event = tokio::select! {
            biased;
            () = self.stop.wait() => Event::Stop,
            accepted = listener.accept() => Event::Accept(accepted),
            () = tokio::time::sleep(timeout) => Event::Idle,
        };

        match event {
            Event::Stop => PollOutcome::Stopped,
            Event::Idle => PollOutcome::Idle,
            Event::Accept(Ok((stream, peer))) => PollOutcome::Accepted(self.spawn_connection(stream, peer)),
            Event::Accept(Err(e)) => {
                warn!(error = %e, "accept failed");
                PollOutcome::Idle
            }
        }
    }

    fn reap(&mut self) {
        let mut ws_tasks = self.dispatcher.ws_tasks.lock();
        while let Some(result) = self.tasks.try_join_next().or_else(|| ws_tasks.try_join_next()) {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!(error = %e, "connection task panicked");
                }
            }
        }
    }

    fn spawn_connection(&mut self, stream: TcpStream, peer: SocketAddr) -> ConnectionId {
        let guard = self.dispatcher.registry.register(peer);
        let ctx = ConnContext::new(guard);
        let id = ctx.id;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection_id = %id, error = %e, "set_nodelay failed");
        }

        let io = TokioIo::new(TrackedStream {
            inner: stream,
            close: Arc::clone(&ctx.close),
        });
        let header_timeout = self.dispatcher.config.header_read_timeout();
        let dispatcher = Arc::clone(&self.dispatcher);
        let close = Arc::clone(&ctx.close);
        let task_ctx = ctx.clone();

        self.tasks.spawn(async move {
            let service = service_fn(move |req| {
                let dispatcher = Arc::clone(&dispatcher);
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(dispatcher.handle(req, ctx).await) }
            });
            let conn = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(header_timeout)
                .serve_connection(io, service)
                .with_upgrades();
            tokio::pin!(conn);

            let mut draining = false;
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            debug!(connection_id = %id, error = %e, "connection error");
                        }
                        break;
                    }
                    () = close.closing(), if !draining => {
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    () = close.forced() => {
                        debug!(connection_id = %id, "connection force-closed");
                        break;
                    }
                }
            }
            drop(task_ctx);
        });
        id
    }

    /// Polls until stopped, then tears every connection down.
    pub async fn run(mut self, interval: Duration) {
        if let Some(addr) = self.local_addr() {
            info!(%addr, "event loop started");
        }
        while self.poll_once(interval).await != PollOutcome::Stopped {}
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.listener = None;
        let config = &self.dispatcher.config;
        let (grace, settle) = (config.close_grace(), config.settle());

        let closing = self.dispatcher.registry.mark_all_closing();
        let ws_closed = self.dispatcher.hub.close_all(CloseCode::GoingAway);
        info!(connections = closing, websocket = ws_closed, "listener closed, draining connections");

        tokio::time::sleep(grace).await;

        let forced = self.dispatcher.registry.force_close_all();
        if forced > 0 {
            warn!(connections = forced, "connections force-closed after grace period");
        }
        self.poll_once(settle).await;

        // Forced WebSocket tasks exit on their own; give them the settle
        // period to remove their clients from the hub.
        let mut ws_tasks = std::mem::take(&mut *self.dispatcher.ws_tasks.lock());
        let drained = tokio::time::timeout(settle, async { while ws_tasks.join_next().await.is_some() {} }).await;
        if drained.is_err() {
            debug!(websocket = ws_tasks.len(), "WebSocket tasks still running after settle");
        }

        let remaining = self.tasks.len() + ws_tasks.len();
        ws_tasks.shutdown().await;
        self.tasks.shutdown().await;
        info!(aborted = remaining, "event loop stopped");
    }
}

/// A TCP stream that resets the connection when dropped after a forced
/// close.
struct TrackedStream {
    inner: TcpStream,
    close: Arc<CloseSignal>,
}

impl AsyncRead for TrackedStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if self.close.is_forced() {
            if let Err(e) = self.inner.set_linger(Some(Duration::ZERO)) {
                debug!(error = %e, "set_linger failed");
            }
        }
    }
}
