//! WebSocket server for hub-side accepts.
//!
//! # Connection Flow
//!
//! 1. Hub binds a TCP listener to `localhost:0` (random port) or a fixed port
//! 2. A context dials `ws://127.0.0.1:{port}`
//! 3. The socket is upgraded to WebSocket
//! 4. The context sends a `hello` frame with its channel name
//! 5. The hub receives a [`ChannelHandle`] and starts routing

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::ChannelName;
use crate::protocol::Frame;

use super::ChannelHandle;
use super::connection::spawn_channel;

// ============================================================================
// Constants
// ============================================================================

/// Timeout for the `hello` handshake (30s).
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Accept Loop
// ============================================================================

/// Background task that accepts sockets until `accepted_tx` is dropped
/// or the host is invalidated.
pub(crate) async fn accept_loop(
    listener: Arc<TcpListener>,
    accepted_tx: mpsc::UnboundedSender<ChannelHandle>,
    invalidation: watch::Receiver<bool>,
) {
    debug!("Accept loop started");

    let mut host_down = invalidation.clone();
    if *host_down.borrow_and_update() {
        return;
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let accepted_tx = accepted_tx.clone();
                        let invalidation = invalidation.clone();
                        tokio::spawn(async move {
                            match handle_connection(stream, addr, invalidation).await {
                                Ok(handle) => {
                                    if accepted_tx.send(handle).is_err() {
                                        debug!(?addr, "Hub stopped listening; dropping channel");
                                    }
                                }
                                Err(e) => warn!(error = %e, ?addr, "Connection handling failed"),
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }

            () = accepted_tx.closed() => {
                debug!("Accept loop shutting down");
                break;
            }

            changed = host_down.changed() => {
                if changed.is_err() || *host_down.borrow() {
                    debug!("Host invalidated; accept loop shutting down");
                    break;
                }
            }
        }
    }

    debug!("Accept loop terminated");
}

/// Upgrades one TCP connection and completes the handshake.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    invalidation: watch::Receiver<bool>,
) -> Result<ChannelHandle> {
    debug!(?addr, "New TCP connection");

    let mut ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::transport(format!("WebSocket upgrade failed: {e}")))?;

    let name = timeout(HANDSHAKE_TIMEOUT, read_hello(&mut ws_stream))
        .await
        .map_err(|_| Error::connection_timeout(HANDSHAKE_TIMEOUT.as_millis() as u64))??;

    info!(channel = %name, ?addr, "Channel handshake completed");

    Ok(spawn_channel(ws_stream, name, invalidation))
}

/// Reads frames until the `hello` frame arrives.
pub(crate) async fn read_hello<S>(ws_stream: &mut WebSocketStream<S>) -> Result<ChannelName>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = ws_stream.next().await {
        match message? {
            WsMessage::Text(text) => {
                return match Frame::from_json(&text)? {
                    Frame::Hello { name } => {
                        // Reject names the router cannot address.
                        name.context()?;
                        Ok(name)
                    }
                    Frame::Message(_) => Err(Error::protocol("message frame before hello")),
                };
            }
            WsMessage::Close(_) => return Err(Error::ConnectionClosed),
            _ => {}
        }
    }

    Err(Error::ConnectionClosed)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_timeout() {
        assert_eq!(HANDSHAKE_TIMEOUT.as_secs(), 30);
    }
}
