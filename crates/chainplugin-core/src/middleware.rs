//! Middleware and terminal handler traits, the plugin builder, and the
//! compiled chain.
//!
//! A plugin is an onion: middleware registered first is the outermost layer,
//! the terminal handler matching the notification kind is the core.
//!
//! ```text
//! ┌ metrics ─────────────────────────────┐
//! │ ┌ filter ────────────────────────┐   │
//! │ │      on_commit / on_revert /   │   │
//! │ │      on_reorg                  │   │
//! │ └────────────────────────────────┘   │
//! └──────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::NotificationContext;
use crate::error::PluginError;
use crate::types::{ChainSegment, ChainTypes, Notification, NotificationKind};

// ─── Traits ──────────────────────────────────────────────────────────────────

/// A cross-cutting step wrapped around a plugin's handlers.
///
/// Call `next.run(ctx)` at most once. Returning without calling it drops the
/// notification for every inner layer, including the terminal handler.
#[async_trait]
pub trait Middleware<T: ChainTypes>: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut NotificationContext<'_, T>,
        next: Next<'_, T>,
    ) -> Result<(), PluginError>;
}

/// Terminal handler for committed segments.
#[async_trait]
pub trait CommitHandler<T: ChainTypes>: Send + Sync {
    async fn on_commit(
        &self,
        ctx: &mut NotificationContext<'_, T>,
        chain: &ChainSegment<T>,
    ) -> Result<(), PluginError>;
}

/// Terminal handler for reverted segments.
#[async_trait]
pub trait RevertHandler<T: ChainTypes>: Send + Sync {
    async fn on_revert(
        &self,
        ctx: &mut NotificationContext<'_, T>,
        chain: &ChainSegment<T>,
    ) -> Result<(), PluginError>;
}

/// Terminal handler for reorgs. Sees both sides of the reorg at once.
#[async_trait]
pub trait ReorgHandler<T: ChainTypes>: Send + Sync {
    async fn on_reorg(
        &self,
        ctx: &mut NotificationContext<'_, T>,
        reverted: &ChainSegment<T>,
        committed: &ChainSegment<T>,
    ) -> Result<(), PluginError>;
}

// ─── Compiled chain ──────────────────────────────────────────────────────────

struct Terminal<T: ChainTypes> {
    commit: Arc<dyn CommitHandler<T>>,
    revert: Arc<dyn RevertHandler<T>>,
    reorg: Arc<dyn ReorgHandler<T>>,
}

impl<T: ChainTypes> Terminal<T> {
    async fn dispatch(&self, ctx: &mut NotificationContext<'_, T>) -> Result<(), PluginError> {
        match ctx.notification() {
            Notification::Commit { chain } => self.commit.on_commit(ctx, chain).await,
            Notification::Revert { chain } => self.revert.on_revert(ctx, chain).await,
            Notification::Reorg {
                reverted,
                committed,
            } => self.reorg.on_reorg(ctx, reverted, committed).await,
        }
    }
}

/// A plugin's middleware stack and handlers, fixed at build time.
///
/// Cloning is cheap; clones share the same layers.
pub struct PluginChain<T: ChainTypes> {
    layers: Arc<[Arc<dyn Middleware<T>>]>,
    terminal: Arc<Terminal<T>>,
}

impl<T: ChainTypes> PluginChain<T> {
    pub fn builder() -> PluginBuilder<T> {
        PluginBuilder::new()
    }

    /// Number of middleware layers around the handlers.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Run the whole chain for the notification held by `ctx`.
    pub async fn run(&self, ctx: &mut NotificationContext<'_, T>) -> Result<(), PluginError> {
        Next {
            remaining: &self.layers,
            terminal: &self.terminal,
        }
        .run(ctx)
        .await
    }
}

impl<T: ChainTypes> Clone for PluginChain<T> {
    fn clone(&self) -> Self {
        Self {
            layers: Arc::clone(&self.layers),
            terminal: Arc::clone(&self.terminal),
        }
    }
}

impl<T: ChainTypes> fmt::Debug for PluginChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginChain")
            .field("depth", &self.layers.len())
            .finish_non_exhaustive()
    }
}

/// The rest of the chain after the current middleware.
///
/// Consumed by `run`, so a layer cannot continue twice.
pub struct Next<'a, T: ChainTypes> {
    remaining: &'a [Arc<dyn Middleware<T>>],
    terminal: &'a Terminal<T>,
}

impl<'a, T: ChainTypes> Next<'a, T> {
    pub async fn run(self, ctx: &mut NotificationContext<'_, T>) -> Result<(), PluginError> {
        match self.remaining.split_first() {
            Some((layer, rest)) => {
                let next = Next {
                    remaining: rest,
                    terminal: self.terminal,
                };
                layer.handle(ctx, next).await
            }
            None => self.terminal.dispatch(ctx).await,
        }
    }

    /// Layers still to run before the terminal handler.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Fluent builder for a [`PluginChain`].
///
/// # Example
///
/// ```rust,ignore
/// let chain = PluginBuilder::new()
///     .with(TracingMiddleware::new("balances"))
///     .with(KindFilter::only([NotificationKind::Commit, NotificationKind::Reorg]))
///     .on_commit(BalanceWriter::new(db.clone()))
///     .on_revert(BalanceWriter::new(db.clone()))
///     .on_reorg(BalanceWriter::new(db))
///     .build()?;
/// ```
pub struct PluginBuilder<T: ChainTypes> {
    layers: Vec<Arc<dyn Middleware<T>>>,
    commit: Option<Arc<dyn CommitHandler<T>>>,
    revert: Option<Arc<dyn RevertHandler<T>>>,
    reorg: Option<Arc<dyn ReorgHandler<T>>>,
    duplicate: Option<NotificationKind>,
}

impl<T: ChainTypes> PluginBuilder<T> {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            commit: None,
            revert: None,
            reorg: None,
            duplicate: None,
        }
    }

    /// Append a middleware layer. Earlier layers wrap later ones.
    pub fn with(self, middleware: impl Middleware<T> + 'static) -> Self {
        self.with_arc(Arc::new(middleware))
    }

    /// Append a shared middleware layer.
    pub fn with_arc(mut self, middleware: Arc<dyn Middleware<T>>) -> Self {
        self.layers.push(middleware);
        self
    }

    pub fn on_commit(self, handler: impl CommitHandler<T> + 'static) -> Self {
        self.on_commit_arc(Arc::new(handler))
    }

    pub fn on_commit_arc(mut self, handler: Arc<dyn CommitHandler<T>>) -> Self {
        if self.commit.replace(handler).is_some() {
            self.duplicate.get_or_insert(NotificationKind::Commit);
        }
        self
    }

    pub fn on_revert(self, handler: impl RevertHandler<T> + 'static) -> Self {
        self.on_revert_arc(Arc::new(handler))
    }

    pub fn on_revert_arc(mut self, handler: Arc<dyn RevertHandler<T>>) -> Self {
        if self.revert.replace(handler).is_some() {
            self.duplicate.get_or_insert(NotificationKind::Revert);
        }
        self
    }

    pub fn on_reorg(self, handler: impl ReorgHandler<T> + 'static) -> Self {
        self.on_reorg_arc(Arc::new(handler))
    }

    pub fn on_reorg_arc(mut self, handler: Arc<dyn ReorgHandler<T>>) -> Self {
        if self.reorg.replace(handler).is_some() {
            self.duplicate.get_or_insert(NotificationKind::Reorg);
        }
        self
    }

    /// Register one value as the handler for all three kinds.
    pub fn handlers<H>(self, handler: H) -> Self
    where
        H: CommitHandler<T> + RevertHandler<T> + ReorgHandler<T> + 'static,
    {
        let handler = Arc::new(handler);
        self.on_commit_arc(handler.clone())
            .on_revert_arc(handler.clone())
            .on_reorg_arc(handler)
    }

    /// Compile the chain. Requires exactly one handler per notification kind.
    pub fn build(self) -> Result<PluginChain<T>, PluginError> {
        if let Some(kind) = self.duplicate {
            return Err(PluginError::DuplicateHandler { kind });
        }
        let commit = self.commit.ok_or(PluginError::MissingHandler {
            kind: NotificationKind::Commit,
        })?;
        let revert = self.revert.ok_or(PluginError::MissingHandler {
            kind: NotificationKind::Revert,
        })?;
        let reorg = self.reorg.ok_or(PluginError::MissingHandler {
            kind: NotificationKind::Reorg,
        })?;
        Ok(PluginChain {
            layers: self.layers.into(),
            terminal: Arc::new(Terminal {
                commit,
                revert,
                reorg,
            }),
        })
    }
}

impl<T: ChainTypes> Default for PluginBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
