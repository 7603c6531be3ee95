//! WebSocket channel and its event loop.
//!
//! Every socket, dialed or accepted, is served by one tokio task that:
//!
//! - Reads frames from the peer and turns them into [`ChannelEvent`]s
//! - Writes messages posted through [`SocketSink`] in post order
//! - Watches the host invalidation flag
//! - Emits exactly one [`ChannelEvent::Disconnected`] when it stops

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ChannelName;
use crate::protocol::{Frame, Message};

use super::{ChannelEvent, ChannelHandle, ChannelSink, DisconnectReason, HOST_INVALIDATED_REASON};

// ============================================================================
// SocketCommand
// ============================================================================

/// Internal commands for the socket loop.
enum SocketCommand {
    /// Write one serialized frame.
    Post(String),
    /// Close the socket.
    Close,
}

// ============================================================================
// SocketSink
// ============================================================================

/// Write half of a WebSocket channel.
///
/// Posting serializes the message and queues it for the socket task, so it
/// never waits on the network.
pub struct SocketSink {
    /// Channel name, for logging.
    name: ChannelName,
    /// Commands for the socket loop.
    command_tx: mpsc::UnboundedSender<SocketCommand>,
    /// Cleared when the loop stops.
    active: Arc<AtomicBool>,
}

impl ChannelSink for SocketSink {
    fn post(&self, message: &Message) -> Result<()> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let json = Frame::Message(message.clone()).to_json()?;
        self.command_tx
            .send(SocketCommand::Post(json))
            .map_err(|_| Error::ConnectionClosed)?;

        trace!(channel = %self.name, id = %message.id, "Message queued for socket");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let _ = self.command_tx.send(SocketCommand::Close);
    }
}

// ============================================================================
// Spawn
// ============================================================================

/// Spawns the event loop for an established socket.
///
/// The handshake must already be complete; from here on only message
/// frames are expected.
pub(crate) fn spawn_channel<S>(
    ws_stream: WebSocketStream<S>,
    name: ChannelName,
    invalidation: watch::Receiver<bool>,
) -> ChannelHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let active = Arc::new(AtomicBool::new(true));

    tokio::spawn(run_event_loop(
        ws_stream,
        name.clone(),
        command_rx,
        events_tx,
        Arc::clone(&active),
        invalidation,
    ));

    ChannelHandle {
        name: name.clone(),
        sink: Arc::new(SocketSink {
            name,
            command_tx,
            active,
        }),
        events: events_rx,
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Event loop that handles WebSocket I/O for one channel.
async fn run_event_loop<S>(
    ws_stream: WebSocketStream<S>,
    name: ChannelName,
    mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    active: Arc<AtomicBool>,
    mut invalidation: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let reason = if *invalidation.borrow() {
        DisconnectReason::HostInvalidated
    } else {
        loop {
            tokio::select! {
                // Incoming frames from the peer
                message = ws_read.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            handle_incoming_frame(&name, &text, &events_tx);
                        }

                        Some(Ok(WsMessage::Close(frame))) => {
                            debug!(channel = %name, "WebSocket closed by remote");
                            break close_reason(frame.as_ref());
                        }

                        Some(Err(e)) => {
                            error!(channel = %name, error = %e, "WebSocket error");
                            break DisconnectReason::Error(e.to_string());
                        }

                        None => {
                            debug!(channel = %name, "WebSocket stream ended");
                            break DisconnectReason::Closed;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                // Posts from the relay
                command = command_rx.recv() => {
                    match command {
                        Some(SocketCommand::Post(json)) => {
                            if let Err(e) = ws_write.send(WsMessage::Text(json.into())).await {
                                warn!(channel = %name, error = %e, "Failed to write frame");
                                break DisconnectReason::Error(e.to_string());
                            }
                        }

                        Some(SocketCommand::Close) | None => {
                            debug!(channel = %name, "Closing channel");
                            let _ = ws_write.close().await;
                            break DisconnectReason::Closed;
                        }
                    }
                }

                // Host teardown
                changed = invalidation.changed() => {
                    if changed.is_err() {
                        debug!(channel = %name, "Host dropped; closing channel");
                        let _ = ws_write.close().await;
                        break DisconnectReason::Closed;
                    }
                    if *invalidation.borrow() {
                        let frame = CloseFrame {
                            code: CloseCode::Away,
                            reason: HOST_INVALIDATED_REASON.into(),
                        };
                        let _ = ws_write.send(WsMessage::Close(Some(frame))).await;
                        break DisconnectReason::HostInvalidated;
                    }
                }
            }
        }
    };

    active.store(false, Ordering::SeqCst);
    let _ = events_tx.send(ChannelEvent::Disconnected(reason.clone()));

    debug!(channel = %name, %reason, "Socket loop terminated");
}

/// Handles one text frame from the peer.
fn handle_incoming_frame(
    name: &ChannelName,
    text: &str,
    events_tx: &mpsc::UnboundedSender<ChannelEvent>,
) {
    match Frame::from_json(text) {
        Ok(Frame::Message(message)) => {
            let _ = events_tx.send(ChannelEvent::Message(message));
        }
        Ok(Frame::Hello { name: declared }) => {
            warn!(channel = %name, %declared, "Unexpected hello after handshake");
        }
        Err(e) => {
            warn!(channel = %name, error = %e, "Failed to parse incoming frame");
        }
    }
}

/// Maps a close frame to a disconnect reason.
fn close_reason(frame: Option<&CloseFrame>) -> DisconnectReason {
    match frame {
        Some(frame) if frame.reason.as_str() == HOST_INVALIDATED_REASON => {
            DisconnectReason::HostInvalidated
        }
        _ => DisconnectReason::Closed,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_mapping() {
        assert_eq!(close_reason(None), DisconnectReason::Closed);

        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert_eq!(close_reason(Some(&normal)), DisconnectReason::Closed);

        let invalidated = CloseFrame {
            code: CloseCode::Away,
            reason: HOST_INVALIDATED_REASON.into(),
        };
        assert_eq!(
            close_reason(Some(&invalidated)),
            DisconnectReason::HostInvalidated
        );
    }

    #[test]
    fn test_garbage_frame_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let name = ChannelName::from_raw("panel:1");

        handle_incoming_frame(&name, "not json", &tx);
        handle_incoming_frame(&name, r#"{"frame":"hello","name":"panel:2"}"#, &tx);

        assert!(rx.try_recv().is_err());
    }
}
