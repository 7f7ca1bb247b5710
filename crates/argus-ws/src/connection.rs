//! Per-client connection task.
//!
//! Reads frames from the socket into the hub and writes whatever the hub
//! queued for the client, until either side closes or the server aborts the
//! connection.

use std::future::Future;
use std::sync::Arc;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use tungstenite::protocol::frame::coding::CloseCode as FrameCloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

use crate::hub::{ClientSession, Hub, Outbound};
use crate::message::Envelope;

/// Why a connection task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame or the stream ended.
    PeerClosed,
    /// The server sent a close frame.
    ServerClosed,
    /// The hub dropped the client.
    Removed,
    /// The server forced the connection shut.
    Aborted,
    /// Reading or writing the socket failed.
    TransportError,
}

/// Receives the payload size of each data frame a connection moves.
pub trait FrameMeter: Send + Sync {
    /// A frame of `bytes` arrived from the client.
    fn inbound(&self, bytes: usize);
    /// A frame of `bytes` was written to the client.
    fn outbound(&self, bytes: usize);
}

impl FrameMeter for () {
    fn inbound(&self, _bytes: usize) {}
    fn outbound(&self, _bytes: usize) {}
}

impl<T: FrameMeter + ?Sized> FrameMeter for Arc<T> {
    fn inbound(&self, bytes: usize) {
        (**self).inbound(bytes);
    }

    fn outbound(&self, bytes: usize) {
        (**self).outbound(bytes);
    }
}

/// Removes the client from the hub when dropped, so a cancelled task
/// leaves no subscriptions behind.
struct Registration {
    hub: Hub,
    session: ClientSession,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.disconnect(&self.session);
    }
}

/// Drives one client until the connection ends, then removes it from the
/// hub.
///
/// `abort` completes when the server wants the socket gone without a close
/// handshake; it also cuts short the wait for the peer's close reply. The
/// client is removed even when the task is dropped before it finishes.
pub async fn serve_client<S, M, F>(
    hub: Hub,
    session: ClientSession,
    socket: WebSocketStream<S>,
    meter: M,
    abort: F,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: FrameMeter,
    F: Future<Output = ()>,
{
    let (mut sink, mut stream) = socket.split();
    let client_id = session.client_id().to_string();
    let mut client = Registration { hub, session };
    let hub = client.hub.clone();
    tokio::pin!(abort);

    let reason = loop {
        tokio::select! {
            () = &mut abort => break CloseReason::Aborted,
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    meter.inbound(text.len());
                    hub.handle_text(&client_id, text.as_str());
                }
                Some(Ok(Message::Binary(data))) => {
                    meter.inbound(data.len());
                    hub.touch(&client_id);
                    hub.send_to_client(&client_id, &Envelope::error("binary frames are not supported"));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => hub.touch(&client_id),
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
                Some(Err(e)) => {
                    debug!(client_id = %client_id, error = %e, "WebSocket read failed");
                    break CloseReason::TransportError;
                }
            },
            outbound = client.session.next_outbound() => match outbound {
                Some(Outbound::Text(text)) => {
                    let len = text.len();
                    if let Err(e) = sink.send(Message::text(text)).await {
                        debug!(client_id = %client_id, error = %e, "WebSocket write failed");
                        break CloseReason::TransportError;
                    }
                    meter.outbound(len);
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: FrameCloseCode::from(code.as_u16()),
                        reason: reason.into(),
                    };
                    if sink.send(Message::Close(Some(frame))).await.is_ok() {
                        let wait = tokio::time::timeout(hub.config().close_timeout, await_peer_close(&mut stream));
                        tokio::select! {
                            () = &mut abort => break CloseReason::Aborted,
                            answered = wait => {
                                if answered.is_err() {
                                    debug!(client_id = %client_id, "peer did not answer close");
                                }
                            }
                        }
                    }
                    break CloseReason::ServerClosed;
                }
                None => break CloseReason::Removed,
            },
        }
    };

    drop(client);
    debug!(client_id = %client_id, ?reason, "connection task finished");
    reason
}

async fn await_peer_close<St>(stream: &mut St)
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(Ok(message)) = stream.next().await {
        if message.is_close() {
            break;
        }
    }
}
