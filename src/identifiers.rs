//! Type-safe identifiers for relay entities.
//!
//! Newtype wrappers and sum types replace the string-prefix addressing
//! (`"content-<id>"`) that relay channels are usually keyed by.
//!
//! | Type | Wire form | Example |
//! |------|-----------|---------|
//! | [`ContextId`] | lowercase tag | `hub`, `panel`, `tab-7`, `unassigned` |
//! | [`TabId`] | unsigned integer | `7` |
//! | [`MessageId`] | non-empty string, UUID v4 when generated | `1b4e28ba-2fa1-11d2-883f-0016d3cca427` |
//! | [`ChannelName`] | `<context>:<millis>` | `tab-7:1700000000123` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Prefix of a tab context in its string form.
const TAB_PREFIX: &str = "tab-";

/// Separator between context and timestamp in a channel name.
const CHANNEL_NAME_SEPARATOR: char = ':';

// ============================================================================
// TabId
// ============================================================================

/// Browser tab identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(u32);

impl TabId {
    /// Creates a tab id.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw tab id.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ContextId
// ============================================================================

/// Logical identity of an execution context.
///
/// At most one identity is active per relay instance. `Tab` values are
/// created as tabs appear and never reused across different tabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ContextId {
    /// The coordinating context that accepts every other channel.
    Hub,
    /// The single UI panel.
    Panel,
    /// The interaction context of one browser tab.
    Tab(TabId),
    /// No identity adopted yet.
    #[default]
    Unassigned,
}

impl ContextId {
    /// Creates a tab context.
    #[inline]
    #[must_use]
    pub const fn tab(id: u32) -> Self {
        Self::Tab(TabId::new(id))
    }

    /// Returns `true` for the hub.
    #[inline]
    #[must_use]
    pub const fn is_hub(&self) -> bool {
        matches!(self, Self::Hub)
    }

    /// Returns `true` when no identity has been adopted.
    #[inline]
    #[must_use]
    pub const fn is_unassigned(&self) -> bool {
        matches!(self, Self::Unassigned)
    }

    /// Returns the tab id for tab contexts.
    #[inline]
    #[must_use]
    pub const fn tab_id(&self) -> Option<TabId> {
        match self {
            Self::Tab(tab_id) => Some(*tab_id),
            _ => None,
        }
    }

    /// Returns `true` if a message addressed to `target` belongs to `self`.
    ///
    /// `Tab(n)` only matches the same `n`. `Unassigned` matches nothing,
    /// not even itself.
    #[inline]
    #[must_use]
    pub fn matches(&self, target: &ContextId) -> bool {
        match (self, target) {
            (Self::Hub, Self::Hub) | (Self::Panel, Self::Panel) => true,
            (Self::Tab(a), Self::Tab(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub => f.write_str("hub"),
            Self::Panel => f.write_str("panel"),
            Self::Tab(tab_id) => write!(f, "{TAB_PREFIX}{tab_id}"),
            Self::Unassigned => f.write_str("unassigned"),
        }
    }
}

impl FromStr for ContextId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hub" => Ok(Self::Hub),
            "panel" => Ok(Self::Panel),
            "unassigned" => Ok(Self::Unassigned),
            other => other
                .strip_prefix(TAB_PREFIX)
                .and_then(|raw| raw.parse::<u32>().ok())
                .map(Self::tab)
                .ok_or_else(|| Error::invalid_context_id(other)),
        }
    }
}

impl TryFrom<String> for ContextId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ContextId> for String {
    fn from(value: ContextId) -> Self {
        value.to_string()
    }
}

// ============================================================================
// MessageId
// ============================================================================

/// Unique identifier of one message instance.
///
/// Any non-empty string is accepted from peers. Locally created messages
/// use UUID v4 text. Clones share one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(Arc<str>);

impl MessageId {
    /// Generates a fresh random id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::protocol("empty message id"));
        }
        Ok(Self(s.into()))
    }
}

impl TryFrom<String> for MessageId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.0.to_string()
    }
}

// ============================================================================
// ChannelName
// ============================================================================

/// Declared name of a transport channel.
///
/// Combines the dialing context with the time of the attempt so successive
/// reconnects of the same context never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    /// Creates a name for `context` stamped with the current time.
    #[must_use]
    pub fn for_context(context: ContextId) -> Self {
        Self::with_millis(context, now_millis())
    }

    /// Creates a name for `context` with an explicit timestamp.
    #[must_use]
    pub fn with_millis(context: ContextId, millis: u64) -> Self {
        Self(format!("{context}{CHANNEL_NAME_SEPARATOR}{millis}"))
    }

    /// Wraps a raw name received from a host.
    #[inline]
    #[must_use]
    pub fn from_raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recovers the context that declared this name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContextId`] if the context part is malformed.
    pub fn context(&self) -> Result<ContextId> {
        let context = self
            .0
            .rsplit_once(CHANNEL_NAME_SEPARATOR)
            .map_or(self.0.as_str(), |(context, _)| context);
        context.parse()
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Time
// ============================================================================

/// Milliseconds since the Unix epoch.
#[inline]
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================
