//! Error types for the chainplugin pipeline.

use thiserror::Error;

use crate::types::{BlockId, NotificationKind};

/// Errors that can occur while building, executing or running plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Source error: {0}")]
    Source(String),

    #[error("Live feed lagged, {skipped} notifications were dropped")]
    Lagged { skipped: u64 },

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Invalid chain segment: {0}")]
    InvalidSegment(String),

    #[error("No {kind} handler registered")]
    MissingHandler { kind: NotificationKind },

    #[error("A {kind} handler was registered more than once")]
    DuplicateHandler { kind: NotificationKind },

    #[error("Plugin '{id}' is already running")]
    DuplicatePlugin { id: String },

    #[error("Plugin '{id}' starts at block {start} which is ahead of head {head}")]
    StartAheadOfHead { id: String, start: BlockId, head: BlockId },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Plugin '{id}' failed: {source}")]
    PluginFailed {
        id: String,
        #[source]
        source: Box<PluginError>,
    },

    #[error("{0}")]
    Other(String),
}

impl PluginError {
    /// Shorthand for a failure raised inside a middleware or terminal handler.
    pub fn handler(handler: impl Into<String>, reason: impl ToString) -> Self {
        Self::Handler {
            handler: handler.into(),
            reason: reason.to_string(),
        }
    }

    /// Attach the id of the registration whose run loop produced this error.
    pub fn for_plugin(self, id: impl Into<String>) -> Self {
        match self {
            already @ Self::PluginFailed { .. } => already,
            other => Self::PluginFailed {
                id: id.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns `true` for registration / build-time mistakes (as opposed to
    /// runtime failures of the source or of handler code).
    pub fn is_config(&self) -> bool {
        match self {
            Self::MissingHandler { .. }
            | Self::DuplicateHandler { .. }
            | Self::DuplicatePlugin { .. }
            | Self::StartAheadOfHead { .. }
            | Self::InvalidConfig(_) => true,
            Self::PluginFailed { source, .. } => source.is_config(),
            _ => false,
        }
    }

    /// The id of the failing plugin, if this error came out of a run loop.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::PluginFailed { id, .. } => Some(id),
            Self::DuplicatePlugin { id } | Self::StartAheadOfHead { id, .. } => Some(id),
            _ => None,
        }
    }
}
