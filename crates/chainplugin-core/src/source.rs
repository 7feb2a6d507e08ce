//! Traits for the collaborators a plugin run consumes: the notification feed
//! and the snapshot factory.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::context::Snapshot;
use crate::error::PluginError;
use crate::types::{ChainTypes, Notification};

/// An ordered stream of notifications.
pub type NotificationStream<T> =
    Pin<Box<dyn Stream<Item = Result<Notification<T>, PluginError>> + Send>>;

/// Where notifications come from.
///
/// Implementations own ordering and contiguity: the pipeline forwards what it
/// receives without re-validating it.
#[async_trait]
pub trait NotificationSource<T: ChainTypes>: Send + Sync {
    /// Historical notifications covering blocks `from..=to`, in order. The
    /// stream ends once `to` has been delivered.
    async fn replay_range(&self, from: u64, to: u64) -> Result<NotificationStream<T>, PluginError>;

    /// Live notifications from now on. Open-ended.
    async fn subscribe(&self) -> Result<NotificationStream<T>, PluginError>;
}

/// Captures the chain position and read handles for a plugin run.
#[async_trait]
pub trait ContextFactory<T: ChainTypes>: Send + Sync {
    async fn snapshot(&self) -> Result<Snapshot<T>, PluginError>;
}

#[async_trait]
impl<T: ChainTypes, S: NotificationSource<T> + ?Sized> NotificationSource<T> for std::sync::Arc<S> {
    async fn replay_range(&self, from: u64, to: u64) -> Result<NotificationStream<T>, PluginError> {
        (**self).replay_range(from, to).await
    }

    async fn subscribe(&self) -> Result<NotificationStream<T>, PluginError> {
        (**self).subscribe().await
    }
}

#[async_trait]
impl<T: ChainTypes, F: ContextFactory<T> + ?Sized> ContextFactory<T> for std::sync::Arc<F> {
    async fn snapshot(&self) -> Result<Snapshot<T>, PluginError> {
        (**self).snapshot().await
    }
}
