//! chainplugin-core: building blocks for plugins that react to chain
//! commits, reverts and reorgs.
//!
//! # Architecture
//!
//! ```text
//! PluginBuilder ──build()──▶ PluginChain ─┐
//!                                         ├─▶ PluginExecutor::execute(notification) ─▶ BlockId
//! ContextFactory ──snapshot()──▶ Snapshot ┘
//!
//! PluginChain = [Middleware, Middleware, ...] ─▶ on_commit | on_revert | on_reorg
//! ```
//!
//! Driving executors from a [`NotificationSource`] (backfill, live delivery,
//! watermark tracking) lives in `chainplugin-runtime`.

pub mod context;
pub mod error;
pub mod executor;
pub mod layers;
pub mod middleware;
pub mod source;
pub mod types;

pub use context::{NotificationContext, Snapshot};
pub use error::PluginError;
pub use executor::PluginExecutor;
pub use layers::{KindFilter, TracingMiddleware};
pub use middleware::{
    CommitHandler, Middleware, Next, PluginBuilder, PluginChain, ReorgHandler, RevertHandler,
};
pub use source::{ContextFactory, NotificationSource, NotificationStream};
pub use types::{BlockId, ChainBlock, ChainSegment, ChainTypes, Notification, NotificationKind};
