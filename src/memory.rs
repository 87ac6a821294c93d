//! In-process backend
//!
//! Implements every collaborator trait over in-memory tables, with fault
//! scripting so tests (and the binary's `--local` mode) can simulate
//! timeouts, policy rejections, unreachable networks and stale feed events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::backend::{
    AuthProvider, ChangeFeed, ChatBackend, FeedItem, FeedStream, ProfileStore, SubscriptionStatus,
};
use crate::error::{ChatError, Result};
use crate::message::{
    Channel, ChangeEvent, MessageRow, NewChannel, NewMessage, SenderProfile, SentReceipt,
    TypingRecord,
};
use crate::types::{ChannelId, ChannelKind, MessageId, UserId};

/// Feed channel buffer size
const FEED_BUFFER_SIZE: usize = 256;

/// Scripted outcome for the next call of an operation
#[derive(Debug, Clone)]
pub enum Fault {
    Fail(ChatError),
    /// Never respond; the caller's timeout decides
    Hang,
}

#[derive(Default)]
struct Tables {
    channels: Vec<Channel>,
    messages: Vec<MessageRow>,
    typing: HashMap<(ChannelId, UserId), TypingRecord>,
    profiles: HashMap<UserId, SenderProfile>,
    feeds: Vec<(ChannelId, mpsc::Sender<FeedItem>)>,
    last_timestamp: Option<DateTime<Utc>>,
    unreachable: bool,
    lookup_faults: VecDeque<Fault>,
    history_faults: VecDeque<Fault>,
    insert_faults: VecDeque<Fault>,
    open_faults: VecDeque<Fault>,
    create_races: u32,
    insert_attempts: u32,
    open_attempts: u32,
}

impl Tables {
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn live_feeds(&mut self, channel_id: ChannelId) -> Vec<mpsc::Sender<FeedItem>> {
        self.feeds.retain(|(_, tx)| !tx.is_closed());
        self.feeds
            .iter()
            .filter(|(id, _)| *id == channel_id)
            .map(|(_, tx)| tx.clone())
            .collect()
    }
}

/// In-memory chat backend, shareable across the core's components
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the lock only happens in a failing test
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pop the scripted fault for an operation, honouring reachability
    async fn check(&self, pick: fn(&mut Tables) -> &mut VecDeque<Fault>) -> Result<()> {
        let fault = {
            let mut tables = self.lock();
            if tables.unreachable {
                return Err(ChatError::Network("backend unreachable".to_string()));
            }
            pick(&mut *tables).pop_front()
        };
        match fault {
            None => Ok(()),
            Some(Fault::Fail(e)) => Err(e),
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn broadcast(&self, channel_id: ChannelId, item: FeedItem) {
        let feeds = self.lock().live_feeds(channel_id);
        for tx in feeds {
            if tx.try_send(item.clone()).is_err() {
                debug!("Dropping feed item for {}: receiver full or gone", channel_id);
            }
        }
    }

    // -- Fault scripting --

    /// Make every call fail with a network error (and drop open feeds)
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
        if !reachable {
            self.drop_feeds();
        }
    }

    pub fn fail_lookups(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().lookup_faults.extend(faults);
    }

    pub fn fail_history(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().history_faults.extend(faults);
    }

    pub fn fail_inserts(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().insert_faults.extend(faults);
    }

    pub fn fail_feed_opens(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().open_faults.extend(faults);
    }

    /// Simulate another client creating the channel between our lookup and create
    pub fn race_next_create(&self) {
        self.lock().create_races += 1;
    }

    /// Deliver a raw change to every feed of `channel_id`
    pub fn push_event(&self, channel_id: ChannelId, event: ChangeEvent) {
        self.broadcast(channel_id, FeedItem::Change(event));
    }

    /// Report CLOSED on every open feed and end them
    pub fn drop_feeds(&self) {
        let feeds: Vec<_> = std::mem::take(&mut self.lock().feeds);
        for (_, tx) in feeds {
            let _ = tx.try_send(FeedItem::Status(SubscriptionStatus::Closed));
        }
    }

    // -- Seeding and inspection --

    pub fn add_profile(&self, profile: SenderProfile) {
        self.lock().profiles.insert(profile.id, profile);
    }

    pub fn seed_channel(&self, name: &str, kind: ChannelKind) -> Channel {
        let mut tables = self.lock();
        let channel = Channel {
            id: ChannelId::new(),
            name: name.to_string(),
            kind,
            description: None,
            created_by: None,
            created_at: Some(tables.next_timestamp()),
        };
        tables.channels.push(channel.clone());
        channel
    }

    pub fn seed_message(&self, channel_id: ChannelId, sender_id: UserId, content: &str) -> MessageRow {
        let mut tables = self.lock();
        let row = MessageRow {
            id: MessageId::new(),
            channel_id,
            sender_id,
            content: content.to_string(),
            created_at: tables.next_timestamp(),
            is_deleted: false,
        };
        tables.messages.push(row.clone());
        row
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.lock().channels.clone()
    }

    pub fn messages_in(&self, channel_id: ChannelId) -> Vec<MessageRow> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .cloned()
            .collect()
    }

    pub fn typing_rows(&self) -> Vec<TypingRecord> {
        self.lock().typing.values().cloned().collect()
    }

    /// Number of insert calls received, including failed ones
    pub fn insert_attempts(&self) -> u32 {
        self.lock().insert_attempts
    }

    /// Number of feed open calls received, including failed ones
    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    /// Feeds whose receiver is still alive
    pub fn open_feed_count(&self) -> usize {
        let mut tables = self.lock();
        tables.feeds.retain(|(_, tx)| !tx.is_closed());
        tables.feeds.len()
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    async fn find_channel(&self, name: &str, kind: ChannelKind) -> Result<Option<Channel>> {
        self.check(|t| &mut t.lookup_faults).await?;
        Ok(self
            .lock()
            .channels
            .iter()
            .find(|c| c.name == name && c.kind == kind)
            .cloned())
    }

    async fn create_channel(&self, new: &NewChannel) -> Result<Channel> {
        self.check(|t| &mut t.lookup_faults).await?;
        let mut tables = self.lock();
        if tables.create_races > 0 {
            tables.create_races -= 1;
            let created_at = tables.next_timestamp();
            tables.channels.push(Channel {
                id: ChannelId::new(),
                name: new.name.clone(),
                kind: new.kind,
                description: None,
                created_by: None,
                created_at: Some(created_at),
            });
        }
        if tables
            .channels
            .iter()
            .any(|c| c.name == new.name && c.kind == new.kind)
        {
            return Err(ChatError::Conflict);
        }
        let channel = Channel {
            id: ChannelId::new(),
            name: new.name.clone(),
            kind: new.kind,
            description: new.description.clone(),
            created_by: Some(new.created_by),
            created_at: Some(tables.next_timestamp()),
        };
        tables.channels.push(channel.clone());
        Ok(channel)
    }

    async fn load_messages(&self, channel_id: ChannelId, limit: usize) -> Result<Vec<MessageRow>> {
        self.check(|t| &mut t.history_faults).await?;
        let mut rows: Vec<MessageRow> = self
            .lock()
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id && !m.is_deleted)
            .cloned()
            .collect();
        // newest first, like an `order=created_at.desc&limit=N` query
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<SentReceipt> {
        self.lock().insert_attempts += 1;
        self.check(|t| &mut t.insert_faults).await?;
        let row = {
            let mut tables = self.lock();
            if tables.messages.iter().any(|m| m.id == message.id) {
                return Err(ChatError::Conflict);
            }
            let row = MessageRow {
                id: message.id,
                channel_id: message.channel_id,
                sender_id: message.sender_id,
                content: message.content.clone(),
                created_at: tables.next_timestamp(),
                is_deleted: false,
            };
            tables.messages.push(row.clone());
            row
        };
        let receipt = SentReceipt {
            id: row.id,
            created_at: row.created_at,
        };
        self.broadcast(row.channel_id, FeedItem::Change(ChangeEvent::Insert(row)));
        Ok(receipt)
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<MessageRow>> {
        let tables = self.lock();
        if tables.unreachable {
            return Err(ChatError::Network("backend unreachable".to_string()));
        }
        Ok(tables.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn soft_delete_message(&self, id: MessageId) -> Result<()> {
        let row = {
            let mut tables = self.lock();
            if tables.unreachable {
                return Err(ChatError::Network("backend unreachable".to_string()));
            }
            let Some(row) = tables.messages.iter_mut().find(|m| m.id == id) else {
                return Ok(());
            };
            row.is_deleted = true;
            row.clone()
        };
        self.broadcast(row.channel_id, FeedItem::Change(ChangeEvent::Update(row)));
        Ok(())
    }

    async fn upsert_typing(&self, record: &TypingRecord) -> Result<()> {
        {
            let mut tables = self.lock();
            if tables.unreachable {
                return Err(ChatError::Network("backend unreachable".to_string()));
            }
            tables
                .typing
                .insert((record.channel_id, record.user_id), record.clone());
        }
        self.broadcast(record.channel_id, FeedItem::Change(ChangeEvent::Typing(record.clone())));
        Ok(())
    }

    async fn clear_typing(&self, channel_id: ChannelId, user_id: UserId) -> Result<()> {
        let removed = {
            let mut tables = self.lock();
            if tables.unreachable {
                return Err(ChatError::Network("backend unreachable".to_string()));
            }
            tables.typing.remove(&(channel_id, user_id)).is_some()
        };
        if removed {
            self.broadcast(
                channel_id,
                FeedItem::Change(ChangeEvent::TypingCleared { channel_id, user_id }),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryBackend {
    async fn get_profile(&self, id: UserId) -> Result<Option<SenderProfile>> {
        Ok(self.lock().profiles.get(&id).cloned())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn open(&self, channel_id: ChannelId) -> Result<FeedStream> {
        self.lock().open_attempts += 1;
        self.check(|t| &mut t.open_faults).await?;
        let (tx, rx) = mpsc::channel(FEED_BUFFER_SIZE);
        let (close_tx, _close_rx) = oneshot::channel();
        let _ = tx.try_send(FeedItem::Status(SubscriptionStatus::Subscribed));
        self.lock().feeds.push((channel_id, tx));
        Ok(FeedStream::new(rx, close_tx))
    }
}

/// Auth provider with a fixed actor
#[derive(Debug, Clone)]
pub struct StaticAuth {
    user: Option<UserId>,
}

impl StaticAuth {
    pub fn signed_in(user: UserId) -> Self {
        Self { user: Some(user) }
    }

    pub fn anonymous() -> Self {
        Self { user: None }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    fn current_user(&self) -> Option<UserId> {
        self.user
    }

    async fn session_valid(&self) -> bool {
        self.user.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(channel_id: ChannelId) -> NewMessage {
        NewMessage {
            id: MessageId::new(),
            channel_id,
            sender_id: UserId::new(),
            content: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_broadcasts_to_channel_feed_only() {
        let backend = MemoryBackend::new();
        let a = backend.seed_channel("a", ChannelKind::Public);
        let b = backend.seed_channel("b", ChannelKind::Public);
        let mut feed_a = backend.open(a.id).await.unwrap();
        let mut feed_b = backend.open(b.id).await.unwrap();

        backend.insert_message(&draft(a.id)).await.unwrap();

        assert_eq!(
            feed_a.next().await,
            Some(FeedItem::Status(SubscriptionStatus::Subscribed))
        );
        assert!(matches!(
            feed_a.next().await,
            Some(FeedItem::Change(ChangeEvent::Insert(_)))
        ));
        assert_eq!(
            feed_b.next().await,
            Some(FeedItem::Status(SubscriptionStatus::Subscribed))
        );
        assert!(feed_b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("a", ChannelKind::Public);
        let msg = draft(channel.id);
        backend.insert_message(&msg).await.unwrap();
        assert_eq!(backend.insert_message(&msg).await, Err(ChatError::Conflict));
        assert_eq!(backend.messages_in(channel.id).len(), 1);
        assert_eq!(backend.insert_attempts(), 2);
    }

    #[tokio::test]
    async fn test_scripted_fault_consumed_once() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("a", ChannelKind::Public);
        backend.fail_inserts([Fault::Fail(ChatError::Permission("rls".into()))]);
        assert!(backend.insert_message(&draft(channel.id)).await.is_err());
        assert!(backend.insert_message(&draft(channel.id)).await.is_ok());
    }

    #[tokio::test]
    async fn test_history_newest_first_without_deleted() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("a", ChannelKind::Public);
        let sender = UserId::new();
        let first = backend.seed_message(channel.id, sender, "one");
        let second = backend.seed_message(channel.id, sender, "two");
        backend.soft_delete_message(first.id).await.unwrap();

        let rows = backend.load_messages(channel.id, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, second.id);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_pruned() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("a", ChannelKind::Public);
        let feed = backend.open(channel.id).await.unwrap();
        assert_eq!(backend.open_feed_count(), 1);
        drop(feed);
        assert_eq!(backend.open_feed_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_fails_everything() {
        let backend = MemoryBackend::new();
        backend.set_reachable(false);
        assert!(matches!(
            backend.find_channel("a", ChannelKind::Public).await,
            Err(ChatError::Network(_))
        ));
        assert!(backend.open(ChannelId::new()).await.is_err());
    }
}
