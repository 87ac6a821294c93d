//! Collaborator interfaces consumed by the core
//!
//! The hosted backend, the auth provider, the profile store and the live
//! change feed are reached only through these traits. `rest` and `realtime`
//! implement them over HTTP/WebSocket, `memory` implements them in-process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::Result;
use crate::message::{
    Channel, ChangeEvent, MessageRow, NewChannel, NewMessage, SenderProfile, SentReceipt,
    TypingRecord,
};
use crate::types::{ChannelId, ChannelKind, MessageId, UserId};

/// Relational backend: `channels`, `messages`, `typing_indicators`
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Look up a channel by its unique (name, kind)
    async fn find_channel(&self, name: &str, kind: ChannelKind) -> Result<Option<Channel>>;

    /// Create a channel; `ChatError::Conflict` if (name, kind) already exists
    async fn create_channel(&self, channel: &NewChannel) -> Result<Channel>;

    /// Most recent non-deleted messages of a channel, at most `limit`
    async fn load_messages(&self, channel_id: ChannelId, limit: usize) -> Result<Vec<MessageRow>>;

    /// Persist a message; `ChatError::Conflict` if its id already exists
    async fn insert_message(&self, message: &NewMessage) -> Result<SentReceipt>;

    /// Fetch one message by id, deleted or not
    async fn find_message(&self, id: MessageId) -> Result<Option<MessageRow>>;

    /// Set `is_deleted` on a message
    async fn soft_delete_message(&self, id: MessageId) -> Result<()>;

    /// Insert or refresh the (channel, user) typing row
    async fn upsert_typing(&self, record: &TypingRecord) -> Result<()>;

    async fn clear_typing(&self, channel_id: ChannelId, user_id: UserId) -> Result<()>;
}

/// Supplies the current actor
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<UserId>;

    /// Whether the actor's session is still accepted by the backend
    async fn session_valid(&self) -> bool;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, id: UserId) -> Result<Option<SenderProfile>>;
}

/// Lifecycle status reported by a live feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Subscribed,
    Closed,
    ChannelError(String),
}

impl SubscriptionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, SubscriptionStatus::Subscribed)
    }
}

/// Item delivered by a feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Status(SubscriptionStatus),
    Change(ChangeEvent),
}

/// An open change feed scoped to one channel
///
/// Dropping the stream (or calling [`FeedStream::close`]) tells the
/// producer to stop.
#[derive(Debug)]
pub struct FeedStream {
    pub events: mpsc::Receiver<FeedItem>,
    close: Option<oneshot::Sender<()>>,
}

impl FeedStream {
    pub fn new(events: mpsc::Receiver<FeedItem>, close: oneshot::Sender<()>) -> Self {
        Self {
            events,
            close: Some(close),
        }
    }

    pub async fn next(&mut self) -> Option<FeedItem> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }
}

impl Drop for FeedStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Live change feed
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a feed delivering changes for `channel_id` only
    async fn open(&self, channel_id: ChannelId) -> Result<FeedStream>;
}

/// Fetch a profile within `timeout`, substituting a placeholder on any failure
pub async fn profile_or_placeholder(
    profiles: &Arc<dyn ProfileStore>,
    id: UserId,
    timeout: Duration,
) -> SenderProfile {
    match tokio::time::timeout(timeout, profiles.get_profile(id)).await {
        Ok(Ok(Some(profile))) => profile,
        Ok(Ok(None)) => SenderProfile::placeholder(id),
        Ok(Err(e)) => {
            debug!("Profile fetch for {} failed: {}", id, e);
            SenderProfile::placeholder(id)
        }
        Err(_) => {
            debug!("Profile fetch for {} timed out", id);
            SenderProfile::placeholder(id)
        }
    }
}
