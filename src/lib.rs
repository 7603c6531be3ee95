//! Context Relay - Message routing between isolated execution contexts.
//!
//! This library connects the contexts of a browser-extension-style
//! application (one background hub, one side panel, many tabs) through a
//! hub-and-spoke message relay.
//!
//! # Architecture
//!
//! The relay follows a hub-and-spoke model:
//!
//! - **Hub**: Accepts channels from every other context and routes between them
//! - **Panel / Tabs**: Keep one channel to the hub, queue while it is down
//!
//! Key design principles:
//!
//! - Each [`Relay`] owns one event loop task holding all transport state
//! - Messages carry a unique id; every context dispatches an id at most once
//! - Sends never fail because the hub is missing; they are queued in order
//! - A torn-down host is terminal for the instance (no reconnect storms)
//!
//! # Quick Start
//!
//! ```no_run
//! use context_relay::transport::MemoryHost;
//! use context_relay::{ContextId, MessageType, Relay, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let host = MemoryHost::new();
//!
//!     // The hub routes; the panel talks to it.
//!     let hub = Relay::builder().host(host.clone()).identity(ContextId::Hub).build()?;
//!     let panel = Relay::builder().host(host).identity(ContextId::Panel).build()?;
//!
//!     let _sub = hub.subscribe(MessageType::Ping, |message| {
//!         println!("ping from {}", message.source);
//!     });
//!
//!     panel.send(MessageType::Ping, serde_json::json!({}), None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`relay`] | [`Relay`] handle, routing, queueing, dedup |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Context ids, message ids, channel names |
//! | [`protocol`] | Message envelope and wire frames |
//! | [`settings`] | Settings store and log verbosity |
//! | [`transport`] | Host trait with in-memory and WebSocket hosts |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// [`ContextId`] replaces string addressing; newtypes keep message ids and
/// channel names apart.
pub mod identifiers;

/// Message envelope and wire frames.
pub mod protocol;

/// Message relay.
///
/// Use [`Relay::builder()`] to create a relay instance.
pub mod relay;

/// Settings store and log verbosity.
pub mod settings;

/// Host channel transports.
///
/// The [`transport::Host`] trait plus in-memory and WebSocket hosts.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Relay types
pub use relay::{
    ConnectionState, Relay, RelayBuilder, RelayConfig, SendOutcome, Subscription, Topic,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ChannelName, ContextId, MessageId, TabId};

// Protocol types
pub use protocol::{Message, MessageType};
