//! Known message kinds.
//!
//! The kind of a message decides the shape of its payload. Kinds are grouped
//! by the consumer that owns them; the relay itself only interprets
//! [`MessageType::Ping`] and [`MessageType::Pong`] in diagnostics.
//!
//! | Group | Kinds |
//! |-------|-------|
//! | Liveness | `PING`, `PONG` |
//! | Lifecycle | `CONTEXT_READY`, `TAB_ACTIVATED`, `TAB_CLOSED`, `PANEL_OPENED`, `PANEL_CLOSED` |
//! | Inspection | `INSPECT_START`, `INSPECT_STOP`, `ELEMENT_HOVERED`, `ELEMENT_SELECTED` |
//! | Styles | `STYLE_CHANGED`, `STYLE_RESET` |
//! | Tags | `TAG_INJECT`, `TAG_REMOVE` |
//! | Capture | `SCREENSHOT_REQUEST`, `SCREENSHOT_RESULT` |
//! | Export | `EXPORT_PDF`, `EXPORT_SLIDES`, `EXPORT_RESULT` |
//! | Settings | `SETTINGS_CHANGED` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// MessageType
// ============================================================================

/// Kind of a relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Liveness check.
    Ping,
    /// Liveness answer.
    Pong,

    /// A context finished setting up and can receive messages.
    ContextReady,
    /// A tab became the active tab.
    TabActivated,
    /// A tab was closed.
    TabClosed,
    /// The panel was opened.
    PanelOpened,
    /// The panel was closed.
    PanelClosed,

    /// Element picking started.
    InspectStart,
    /// Element picking stopped.
    InspectStop,
    /// Pointer moved over an element.
    ElementHovered,
    /// An element was picked.
    ElementSelected,

    /// A style property was edited.
    StyleChanged,
    /// Style edits were reverted.
    StyleReset,

    /// Inject a tag into the page.
    TagInject,
    /// Remove an injected tag.
    TagRemove,

    /// Capture a screenshot.
    ScreenshotRequest,
    /// Captured screenshot data.
    ScreenshotResult,

    /// Export the page as PDF.
    ExportPdf,
    /// Export the page as slides.
    ExportSlides,
    /// Export finished.
    ExportResult,

    /// A persisted setting changed.
    SettingsChanged,
}

impl MessageType {
    /// Every known kind, in declaration order.
    pub const ALL: [MessageType; 21] = [
        Self::Ping,
        Self::Pong,
        Self::ContextReady,
        Self::TabActivated,
        Self::TabClosed,
        Self::PanelOpened,
        Self::PanelClosed,
        Self::InspectStart,
        Self::InspectStop,
        Self::ElementHovered,
        Self::ElementSelected,
        Self::StyleChanged,
        Self::StyleReset,
        Self::TagInject,
        Self::TagRemove,
        Self::ScreenshotRequest,
        Self::ScreenshotResult,
        Self::ExportPdf,
        Self::ExportSlides,
        Self::ExportResult,
        Self::SettingsChanged,
    ];

    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::ContextReady => "CONTEXT_READY",
            Self::TabActivated => "TAB_ACTIVATED",
            Self::TabClosed => "TAB_CLOSED",
            Self::PanelOpened => "PANEL_OPENED",
            Self::PanelClosed => "PANEL_CLOSED",
            Self::InspectStart => "INSPECT_START",
            Self::InspectStop => "INSPECT_STOP",
            Self::ElementHovered => "ELEMENT_HOVERED",
            Self::ElementSelected => "ELEMENT_SELECTED",
            Self::StyleChanged => "STYLE_CHANGED",
            Self::StyleReset => "STYLE_RESET",
            Self::TagInject => "TAG_INJECT",
            Self::TagRemove => "TAG_REMOVE",
            Self::ScreenshotRequest => "SCREENSHOT_REQUEST",
            Self::ScreenshotResult => "SCREENSHOT_RESULT",
            Self::ExportPdf => "EXPORT_PDF",
            Self::ExportSlides => "EXPORT_SLIDES",
            Self::ExportResult => "EXPORT_RESULT",
            Self::SettingsChanged => "SETTINGS_CHANGED",
        }
    }

    /// Returns `true` for high-frequency kinds that are logged at trace level.
    #[inline]
    #[must_use]
    pub const fn is_chatty(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::ElementHovered)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================
