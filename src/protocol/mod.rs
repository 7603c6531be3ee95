//! Relay protocol message types.
//!
//! This module defines the message format shared by every context.
//!
//! # Protocol Overview
//!
//! | Type | Purpose |
//! |------|---------|
//! | `Message` | Typed, addressed payload relayed between contexts |
//! | `MessageType` | Known message kinds; decides the payload shape |
//! | `Frame` | Socket framing used by stream-based hosts |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Handshake and message frames |
//! | `kind` | Message kind enum |
//! | `message` | Message struct and JSON wire form |

// ============================================================================
// Submodules
// ============================================================================

/// Socket frames.
pub mod frame;

/// Message kinds.
pub mod kind;

/// Message struct.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use frame::Frame;
pub use kind::MessageType;
pub use message::Message;
