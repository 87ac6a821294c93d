//! RealtimeSubscriber: one live change feed per active channel
//!
//! A [`Subscription`] is an owned resource. Whoever holds it is responsible
//! for calling [`Subscription::unsubscribe`] before subscribing to the next
//! channel; after `unsubscribe` returns, the forwarding task is gone and no
//! further events from the old feed can be emitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{profile_or_placeholder, ChangeFeed, FeedItem, FeedStream, ProfileStore, SubscriptionStatus};
use crate::error::{ChatError, Result};
use crate::message::{ChangeEvent, Message, MessageRow, SenderProfile, TypingRecord};
use crate::types::{ChannelId, MessageId, UserId};

/// Event emitted into the session, already shaped for the store
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// New or edited message from another user
    Inserted(Message),
    /// Message soft-deleted
    Deleted(MessageId),
    Typing(TypingRecord),
    TypingCleared(UserId),
    Status(SubscriptionStatus),
}

/// A feed event tagged with the subscription that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEnvelope {
    pub channel_id: ChannelId,
    pub generation: u64,
    pub event: FeedEvent,
}

pub struct RealtimeSubscriber {
    feed: Arc<dyn ChangeFeed>,
    profiles: Arc<dyn ProfileStore>,
    local_user: Option<UserId>,
    open_timeout: Duration,
    profile_timeout: Duration,
}

impl RealtimeSubscriber {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        profiles: Arc<dyn ProfileStore>,
        local_user: Option<UserId>,
        open_timeout: Duration,
        profile_timeout: Duration,
    ) -> Self {
        Self {
            feed,
            profiles,
            local_user,
            open_timeout,
            profile_timeout,
        }
    }

    /// Open the feed for `channel_id` and forward its events into `sink`
    ///
    /// `generation` is copied onto every envelope so the receiver can drop
    /// anything that was already queued when the subscription was replaced.
    pub async fn subscribe(
        &self,
        channel_id: ChannelId,
        generation: u64,
        sink: mpsc::Sender<FeedEnvelope>,
    ) -> Result<Subscription> {
        let stream = match tokio::time::timeout(self.open_timeout, self.feed.open(channel_id)).await {
            Ok(result) => result?,
            Err(_) => return Err(ChatError::Timeout(self.open_timeout)),
        };

        info!("Subscribed to {} (generation {})", channel_id, generation);

        let forwarder = Forwarder {
            channel_id,
            generation,
            local_user: self.local_user,
            profiles: Arc::clone(&self.profiles),
            profile_timeout: self.profile_timeout,
            profile_cache: HashMap::new(),
            sink,
        };
        let task = tokio::spawn(forwarder.run(stream));

        Ok(Subscription {
            channel_id,
            generation,
            task: Some(task),
        })
    }
}

/// Handle to a running feed subscription
#[derive(Debug)]
pub struct Subscription {
    channel_id: ChannelId,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the forwarding task is still running
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Tear the feed down and wait until forwarding has stopped
    pub async fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        debug!("Unsubscribed from {} (generation {})", self.channel_id, self.generation);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Forwarder {
    channel_id: ChannelId,
    generation: u64,
    local_user: Option<UserId>,
    profiles: Arc<dyn ProfileStore>,
    profile_timeout: Duration,
    profile_cache: HashMap<UserId, SenderProfile>,
    sink: mpsc::Sender<FeedEnvelope>,
}

impl Forwarder {
    async fn run(mut self, mut stream: FeedStream) {
        let mut last_status = None;

        while let Some(item) = stream.next().await {
            let event = match item {
                FeedItem::Status(status) => {
                    last_status = Some(status.clone());
                    Some(FeedEvent::Status(status))
                }
                FeedItem::Change(change) => self.translate(change).await,
            };
            if let Some(event) = event {
                if !self.emit(event).await {
                    debug!("Session gone, ending feed for {}", self.channel_id);
                    return;
                }
            }
        }

        // Stream ended without telling us why
        if !matches!(
            last_status,
            Some(SubscriptionStatus::Closed) | Some(SubscriptionStatus::ChannelError(_))
        ) {
            warn!("Feed for {} ended unexpectedly", self.channel_id);
            self.emit(FeedEvent::Status(SubscriptionStatus::Closed)).await;
        }
    }

    async fn emit(&self, event: FeedEvent) -> bool {
        self.sink
            .send(FeedEnvelope {
                channel_id: self.channel_id,
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }

    async fn translate(&mut self, change: ChangeEvent) -> Option<FeedEvent> {
        if change.channel_id() != self.channel_id {
            warn!(
                "Dropping change for {} on feed of {}",
                change.channel_id(),
                self.channel_id
            );
            return None;
        }

        match change {
            ChangeEvent::Insert(row) => {
                if Some(row.sender_id) == self.local_user {
                    // The optimistic copy already represents it
                    debug!("Skipping echo of own message {}", row.id);
                    return None;
                }
                Some(self.shape(row).await)
            }
            ChangeEvent::Update(row) => Some(self.shape(row).await),
            ChangeEvent::Typing(record) => {
                if Some(record.user_id) == self.local_user {
                    return None;
                }
                Some(FeedEvent::Typing(record))
            }
            ChangeEvent::TypingCleared { user_id, .. } => Some(FeedEvent::TypingCleared(user_id)),
        }
    }

    async fn shape(&mut self, row: MessageRow) -> FeedEvent {
        if row.is_deleted {
            return FeedEvent::Deleted(row.id);
        }
        let profile = self.profile(row.sender_id).await;
        FeedEvent::Inserted(Message::from(row).with_sender(profile))
    }

    async fn profile(&mut self, id: UserId) -> SenderProfile {
        if let Some(profile) = self.profile_cache.get(&id) {
            return profile.clone();
        }
        let profile = profile_or_placeholder(&self.profiles, id, self.profile_timeout).await;
        self.profile_cache.insert(id, profile.clone());
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatBackend;
    use crate::memory::{Fault, MemoryBackend};
    use crate::message::NewMessage;
    use crate::types::ChannelKind;
    use chrono::Utc;

    fn subscriber(backend: &MemoryBackend, local_user: UserId) -> RealtimeSubscriber {
        RealtimeSubscriber::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Some(local_user),
            Duration::from_secs(8),
            Duration::from_secs(3),
        )
    }

    fn draft(channel_id: ChannelId, sender_id: UserId, content: &str) -> NewMessage {
        NewMessage {
            id: MessageId::new(),
            channel_id,
            sender_id,
            content: content.to_string(),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<FeedEnvelope>) -> FeedEvent {
        rx.recv().await.expect("feed closed").event
    }

    #[tokio::test]
    async fn test_foreign_insert_emitted_with_profile() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("general", ChannelKind::Public);
        let me = UserId::new();
        let bob = UserId::new();
        backend.add_profile(SenderProfile {
            id: bob,
            display_name: "Bob".to_string(),
            avatar_ref: Some("bob.png".to_string()),
        });

        let (tx, mut rx) = mpsc::channel(16);
        let _sub = subscriber(&backend, me).subscribe(channel.id, 1, tx).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            FeedEvent::Status(SubscriptionStatus::Subscribed)
        );

        backend.insert_message(&draft(channel.id, bob, "hi")).await.unwrap();
        match next_event(&mut rx).await {
            FeedEvent::Inserted(msg) => {
                assert_eq!(msg.content, "hi");
                assert_eq!(msg.display_name(), "Bob");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_own_echo_ignored() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("general", ChannelKind::Public);
        let me = UserId::new();
        let bob = UserId::new();

        let (tx, mut rx) = mpsc::channel(16);
        let _sub = subscriber(&backend, me).subscribe(channel.id, 1, tx).await.unwrap();
        next_event(&mut rx).await;

        backend.insert_message(&draft(channel.id, me, "mine")).await.unwrap();
        backend.insert_message(&draft(channel.id, bob, "theirs")).await.unwrap();

        match next_event(&mut rx).await {
            FeedEvent::Inserted(msg) => assert_eq!(msg.content, "theirs"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_soft_delete_becomes_deleted_event() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("general", ChannelKind::Public);
        let row = backend.seed_message(channel.id, UserId::new(), "oops");

        let (tx, mut rx) = mpsc::channel(16);
        let _sub = subscriber(&backend, UserId::new())
            .subscribe(channel.id, 7, tx)
            .await
            .unwrap();
        next_event(&mut rx).await;

        backend.soft_delete_message(row.id).await.unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.generation, 7);
        assert_eq!(envelope.event, FeedEvent::Deleted(row.id));
    }

    #[tokio::test]
    async fn test_typing_from_others_only() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("general", ChannelKind::Public);
        let me = UserId::new();
        let bob = UserId::new();
        let now = Utc::now();
        let record = |user_id| TypingRecord {
            channel_id: channel.id,
            user_id,
            started_at: now,
            expires_at: now + chrono::Duration::seconds(10),
        };

        let (tx, mut rx) = mpsc::channel(16);
        let _sub = subscriber(&backend, me).subscribe(channel.id, 1, tx).await.unwrap();
        next_event(&mut rx).await;

        backend.upsert_typing(&record(me)).await.unwrap();
        backend.upsert_typing(&record(bob)).await.unwrap();
        assert_eq!(next_event(&mut rx).await, FeedEvent::Typing(record(bob)));
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_feed_and_stops_events() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("general", ChannelKind::Public);
        let (tx, mut rx) = mpsc::channel(16);
        let sub = subscriber(&backend, UserId::new())
            .subscribe(channel.id, 1, tx)
            .await
            .unwrap();
        next_event(&mut rx).await;
        assert!(sub.is_active());

        sub.unsubscribe().await;
        assert_eq!(backend.open_feed_count(), 0);

        backend.insert_message(&draft(channel.id, UserId::new(), "late")).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_feed_reports_closed() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("general", ChannelKind::Public);
        let (tx, mut rx) = mpsc::channel(16);
        let _sub = subscriber(&backend, UserId::new())
            .subscribe(channel.id, 1, tx)
            .await
            .unwrap();
        next_event(&mut rx).await;

        backend.drop_feeds();
        assert_eq!(
            next_event(&mut rx).await,
            FeedEvent::Status(SubscriptionStatus::Closed)
        );
    }

    #[tokio::test]
    async fn test_foreign_channel_change_dropped() {
        let backend = MemoryBackend::new();
        let channel = backend.seed_channel("general", ChannelKind::Public);
        let other = backend.seed_channel("random", ChannelKind::Public);
        let (tx, mut rx) = mpsc::channel(16);
        let _sub = subscriber(&backend, UserId::new())
            .subscribe(channel.id, 1, tx)
            .await
            .unwrap();
        next_event(&mut rx).await;

        let stray = backend.seed_message(other.id, UserId::new(), "stray");
        backend.push_event(channel.id, ChangeEvent::Insert(stray));
        let wanted = backend.seed_message(channel.id, UserId::new(), "wanted");
        backend.push_event(channel.id, ChangeEvent::Insert(wanted.clone()));

        match next_event(&mut rx).await {
            FeedEvent::Inserted(msg) => assert_eq!(msg.id, wanted.id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout() {
        let backend = MemoryBackend::new();
        backend.fail_feed_opens([Fault::Hang]);
        let (tx, _rx) = mpsc::channel(16);
        let result = subscriber(&backend, UserId::new())
            .subscribe(ChannelId::new(), 1, tx)
            .await;
        assert_eq!(result.err(), Some(ChatError::Timeout(Duration::from_secs(8))));
    }
}
