//! Ready-made middleware.

use std::collections::HashSet;
use std::time::Instant;

use async_trait::async_trait;

use crate::context::NotificationContext;
use crate::error::PluginError;
use crate::middleware::{Middleware, Next};
use crate::types::{ChainTypes, NotificationKind};

/// Lets only the listed notification kinds through to inner layers.
#[derive(Debug, Clone)]
pub struct KindFilter {
    allowed: HashSet<NotificationKind>,
}

impl KindFilter {
    pub fn only(kinds: impl IntoIterator<Item = NotificationKind>) -> Self {
        Self {
            allowed: kinds.into_iter().collect(),
        }
    }

    /// Commits only: reverts and reorgs stop here.
    pub fn commits() -> Self {
        Self::only([NotificationKind::Commit])
    }

    pub fn allows(&self, kind: NotificationKind) -> bool {
        self.allowed.contains(&kind)
    }
}

#[async_trait]
impl<T: ChainTypes> Middleware<T> for KindFilter {
    async fn handle(
        &self,
        ctx: &mut NotificationContext<'_, T>,
        next: Next<'_, T>,
    ) -> Result<(), PluginError> {
        if !self.allows(ctx.kind()) {
            tracing::trace!(kind = %ctx.kind(), "Notification filtered");
            return Ok(());
        }
        next.run(ctx).await
    }
}

/// Logs each notification on the way in and out at `debug`.
#[derive(Debug, Clone)]
pub struct TracingMiddleware {
    name: String,
}

impl TracingMiddleware {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl<T: ChainTypes> Middleware<T> for TracingMiddleware {
    async fn handle(
        &self,
        ctx: &mut NotificationContext<'_, T>,
        next: Next<'_, T>,
    ) -> Result<(), PluginError> {
        let kind = ctx.kind();
        let tip = ctx.tip();
        tracing::debug!(plugin = %self.name, %kind, tip = tip.number, "Notification received");

        let started = Instant::now();
        next.run(ctx).await?;

        tracing::debug!(
            plugin = %self.name,
            %kind,
            checkpoint = ctx.current_checkpoint().number,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Notification handled"
        );
        Ok(())
    }
}
