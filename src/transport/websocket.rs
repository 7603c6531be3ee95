//! WebSocket host.
//!
//! One type serves both sides: the hub binds a listener with
//! [`WebSocketHost::bind`], other contexts point at the hub with
//! [`WebSocketHost::dialer`].
//!
//! # Example
//!
//! ```ignore
//! use std::net::{IpAddr, Ipv4Addr};
//! use context_relay::transport::WebSocketHost;
//!
//! let hub_host = WebSocketHost::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
//! let tab_host = WebSocketHost::dialer(&hub_host.ws_url())?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::ChannelName;
use crate::protocol::Frame;

use super::connection::spawn_channel;
use super::server::accept_loop;
use super::{ChannelHandle, Host};

// ============================================================================
// Constants
// ============================================================================

/// Timeout for dialing the hub.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// WebSocketHost
// ============================================================================

/// Channel host backed by WebSocket connections on localhost.
pub struct WebSocketHost {
    /// Hub endpoint.
    endpoint: Url,
    /// Bound listener (hub side only).
    listener: Option<Arc<TcpListener>>,
    /// Set to `true` when the host is torn down.
    invalidation: watch::Sender<bool>,
}

impl fmt::Debug for WebSocketHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketHost")
            .field("endpoint", &self.endpoint.as_str())
            .field("listening", &self.listener.is_some())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

impl WebSocketHost {
    /// Creates a host that dials the hub at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `url` is not a `ws://` or `wss://` URL.
    pub fn dialer(url: &str) -> Result<Self> {
        let endpoint =
            Url::parse(url).map_err(|e| Error::config(format!("Invalid hub URL {url}: {e}")))?;

        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "Hub URL must use ws:// or wss://, got {}",
                endpoint.scheme()
            )));
        }

        Ok(Self {
            endpoint,
            listener: None,
            invalidation: watch::Sender::new(false),
        })
    }

    /// Binds a hub listener to the specified address and port.
    ///
    /// Use port 0 to let the OS assign a random available port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let addr = listener.local_addr()?;
        let endpoint = Url::parse(&format!("ws://{addr}"))
            .map_err(|e| Error::config(format!("Invalid bound address {addr}: {e}")))?;

        debug!(port = addr.port(), "WebSocket hub bound");

        Ok(Self {
            endpoint,
            listener: Some(Arc::new(listener)),
            invalidation: watch::Sender::new(false),
        })
    }

    /// Returns the hub WebSocket URL.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        self.endpoint.to_string()
    }

    /// Returns the hub port, if known.
    #[inline]
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.endpoint.port()
    }

    /// Returns `true` once the host was torn down.
    #[inline]
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        *self.invalidation.borrow()
    }

    /// Tears the host down.
    ///
    /// Every open channel closes with the host-invalidated reason and all
    /// later opens fail with [`Error::HostInvalidated`].
    pub fn invalidate(&self) {
        if !self.invalidation.send_replace(true) {
            info!(endpoint = %self.endpoint, "WebSocket host invalidated");
        }
    }
}

#[async_trait]
impl Host for WebSocketHost {
    async fn open_channel(&self, name: &ChannelName) -> Result<ChannelHandle> {
        if self.is_invalidated() {
            return Err(Error::HostInvalidated);
        }

        let (mut ws_stream, _) = timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.endpoint.as_str()),
        )
        .await
        .map_err(|_| Error::connection_timeout(CONNECT_TIMEOUT.as_millis() as u64))?
        .map_err(|e| Error::transport(format!("Dial {} failed: {e}", self.endpoint)))?;

        let hello = Frame::Hello { name: name.clone() }.to_json()?;
        ws_stream.send(WsMessage::Text(hello.into())).await?;

        debug!(channel = %name, endpoint = %self.endpoint, "WebSocket channel opened");

        Ok(spawn_channel(
            ws_stream,
            name.clone(),
            self.invalidation.subscribe(),
        ))
    }

    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<ChannelHandle>> {
        if self.is_invalidated() {
            return Err(Error::HostInvalidated);
        }

        let listener = self
            .listener
            .clone()
            .ok_or_else(|| Error::config("This host was not bound; use WebSocketHost::bind"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(listener, tx, self.invalidation.subscribe()));

        info!(endpoint = %self.endpoint, "WebSocket hub listening");
        Ok(rx)
    }

    fn is_invalidated(&self) -> bool {
        WebSocketHost::is_invalidated(self)
    }
}

// ============================================================================
// Tests
// ============================================================================
