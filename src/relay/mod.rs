//! Message relay between execution contexts.
//!
//! One [`Relay`] runs per context. The hub accepts channels and routes;
//! the panel and tabs keep one channel to the hub, queue while it is down
//! and reconnect on loss.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`Relay`] handle and event loop |
//! | `builder` | [`RelayBuilder`] |
//! | `config` | [`RelayConfig`] timing knobs |
//! | `dispatcher` | Handler registry and fan-out |
//! | `dedup` | TTL set of processed message ids |
//! | `queue` | Outbound queue awaiting a channel |
//! | `registry` | Hub-side channel table |
//! | `router` | Hub routing decision |
//! | `lifecycle` | Connection state machine |

// ============================================================================
// Submodules
// ============================================================================

/// Builder for relay instances.
pub mod builder;

/// Timing configuration.
pub mod config;

/// Relay handle and event loop.
pub mod core;

/// Processed-id window.
pub mod dedup;

/// Handler registry.
pub mod dispatcher;

/// Connection state machine.
pub mod lifecycle;

/// Pending outbound queue.
pub mod queue;

/// Live channels.
pub mod registry;

/// Hub routing.
pub mod router;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::RelayBuilder;
pub use config::RelayConfig;
pub use core::{Relay, SendOutcome};
pub use dispatcher::{Dispatcher, Handler, Subscription, Topic};
pub use lifecycle::ConnectionState;
