//! Settings collaborator and log verbosity.
//!
//! The relay itself reads no settings. Hosts keep user preferences in a
//! [`SettingsStore`]; [`watch_log_level`] follows its `logLevel` key and
//! hands every change to a callback, typically a `tracing-subscriber`
//! reload handle.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use context_relay::settings::{LOG_LEVEL_KEY, MemorySettings, watch_log_level};
//!
//! # async fn example() {
//! let settings = Arc::new(MemorySettings::new());
//! let _watcher = watch_log_level(Arc::clone(&settings), |level| {
//!     println!("log level is now {level}");
//! });
//! settings.set(LOG_LEVEL_KEY, "debug");
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{debug, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Settings key holding the log verbosity.
pub const LOG_LEVEL_KEY: &str = "logLevel";

/// Buffered change notifications per subscriber.
const CHANGE_CAPACITY: usize = 64;

// ============================================================================
// SettingsStore
// ============================================================================

/// Key-value settings with change notification.
pub trait SettingsStore: Send + Sync + 'static {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Option<Value>;

    /// Subscribes to changes. Each notification carries the changed key.
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

// ============================================================================
// MemorySettings
// ============================================================================

struct SettingsInner {
    values: RwLock<FxHashMap<String, Value>>,
    changes: broadcast::Sender<String>,
}

/// In-process [`SettingsStore`].
///
/// Clones share the same values.
#[derive(Clone)]
pub struct MemorySettings {
    inner: Arc<SettingsInner>,
}

impl fmt::Debug for MemorySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySettings")
            .field("keys", &self.inner.values.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySettings {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(SettingsInner {
                values: RwLock::new(FxHashMap::default()),
                changes,
            }),
        }
    }

    /// Stores `value` under `key`.
    ///
    /// Subscribers are notified only if the value changed.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();

        let changed = {
            let mut values = self.inner.values.write();
            let changed = values.get(&key) != Some(&value);
            if changed {
                values.insert(key.clone(), value);
            }
            changed
        };

        if changed {
            debug!(%key, "Setting changed");
            let _ = self.inner.changes.send(key);
        }
    }

    /// Removes `key`. Returns the previous value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let previous = self.inner.values.write().remove(key);
        if previous.is_some() {
            let _ = self.inner.changes.send(key.to_string());
        }
        previous
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.inner.values.read().get(key).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.changes.subscribe()
    }
}

// ============================================================================
// LogLevel
// ============================================================================

/// Log verbosity stored under [`LOG_LEVEL_KEY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Lifecycle milestones.
    #[default]
    Info,
    /// Routing decisions.
    Debug,
    /// Per-message detail.
    Trace,
}

impl LogLevel {
    /// Returns the lowercase name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// Reads the level from a settings value.
    ///
    /// A missing or unparsable value yields the default level.
    #[must_use]
    pub fn from_setting(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::default(),
            Some(Value::String(raw)) => raw.parse().unwrap_or_else(|e: Error| {
                warn!(error = %e, "Ignoring invalid log level");
                Self::default()
            }),
            Some(other) => {
                warn!(value = %other, "Ignoring non-string log level");
                Self::default()
            }
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(Error::config(format!("unknown log level '{s}'"))),
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

// ============================================================================
// Watcher
// ============================================================================

/// Applies the stored log level now and on every change.
///
/// `apply` runs once with the current level, then whenever `logLevel`
/// changes to a different level. Abort the returned handle to stop
/// watching.
pub fn watch_log_level<S, F>(store: Arc<S>, apply: F) -> JoinHandle<()>
where
    S: SettingsStore + ?Sized,
    F: Fn(LogLevel) + Send + 'static,
{
    // Subscribe before the first read so no change slips between them.
    let mut changes = store.subscribe();
    let mut current = LogLevel::from_setting(store.get(LOG_LEVEL_KEY).as_ref());
    apply(current);

    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(key) if key == LOG_LEVEL_KEY => {}
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Settings notifications lagged; re-reading");
                }
                Err(RecvError::Closed) => break,
            }

            let level = LogLevel::from_setting(store.get(LOG_LEVEL_KEY).as_ref());
            if level != current {
                debug!(from = %current, to = %level, "Log level changed");
                current = level;
                apply(level);
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(assert_ok!("DEBUG".parse::<LogLevel>()), LogLevel::Debug);
        assert_eq!(assert_ok!(" Trace ".parse::<LogLevel>()), LogLevel::Trace);
        assert_eq!(assert_ok!("warning".parse::<LogLevel>()), LogLevel::Warn);
        assert_err!("loud".parse::<LogLevel>());
    }

    #[test]
    fn test_level_filter_conversion() {
        assert_eq!(LevelFilter::from(LogLevel::Error), LevelFilter::ERROR);
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
    }

    #[test]
    fn test_from_setting_falls_back_to_default() {
        assert_eq!(LogLevel::from_setting(None), LogLevel::Info);
        assert_eq!(LogLevel::from_setting(Some(&json!("nope"))), LogLevel::Info);
        assert_eq!(LogLevel::from_setting(Some(&json!(3))), LogLevel::Info);
        assert_eq!(LogLevel::from_setting(Some(&json!("warn"))), LogLevel::Warn);
    }

    #[test]
    fn test_serde_lowercase() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&LogLevel::Debug)?, r#""debug""#);
        assert_eq!(serde_json::from_str::<LogLevel>(r#""error""#)?, LogLevel::Error);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_notifies_only_on_change() -> anyhow::Result<()> {
        let settings = MemorySettings::new();
        let mut changes = settings.subscribe();

        settings.set("theme", "dark");
        settings.set("theme", "dark");
        settings.set("theme", "light");

        assert_eq!(changes.recv().await?, "theme");
        assert_eq!(changes.recv().await?, "theme");
        assert!(changes.try_recv().is_err());
        assert_eq!(settings.get("theme"), Some(json!("light")));
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_applies_initial_and_changes() -> anyhow::Result<()> {
        let settings = Arc::new(MemorySettings::new());
        settings.set(LOG_LEVEL_KEY, "warn");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = watch_log_level(Arc::clone(&settings), move |level| {
            let _ = tx.send(level);
        });
        assert_eq!(rx.recv().await, Some(LogLevel::Warn));

        settings.set("unrelated", true);
        settings.set(LOG_LEVEL_KEY, "TRACE");
        let level = timeout(Duration::from_secs(1), rx.recv()).await?;
        assert_eq!(level, Some(LogLevel::Trace));

        settings.remove(LOG_LEVEL_KEY);
        let level = timeout(Duration::from_secs(1), rx.recv()).await?;
        assert_eq!(level, Some(LogLevel::Info));

        watcher.abort();
        Ok(())
    }
}
