//! TypingIndicatorTracker: ephemeral "user is typing" records
//!
//! Records expire on their own: anything with `expires_at <= now` is treated
//! as absent whether or not the clear write ever reached the backend. A
//! local idle timer clears our own record early, and sending a message
//! clears it immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::ChatBackend;
use crate::connection::{ConnectionState, Phase};
use crate::error::{ChatError, Result};
use crate::message::TypingRecord;
use crate::types::{ChannelId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingPolicy {
    /// Lifetime of a published record
    pub ttl: Duration,
    /// Inactivity after which our own record is cleared
    pub idle_clear: Duration,
}

impl Default for TypingPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            idle_clear: Duration::from_secs(3),
        }
    }
}

/// Typing records keyed by (channel, user)
#[derive(Debug, Clone, Default)]
pub struct TypingSet {
    records: HashMap<(ChannelId, UserId), TypingRecord>,
}

impl TypingSet {
    pub fn upsert(&mut self, record: TypingRecord) {
        self.records.insert((record.channel_id, record.user_id), record);
    }

    pub fn remove(&mut self, channel_id: ChannelId, user_id: UserId) -> bool {
        self.records.remove(&(channel_id, user_id)).is_some()
    }

    /// Users with a live record in `channel_id`, sorted
    pub fn active(&self, channel_id: ChannelId, now: DateTime<Utc>) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .records
            .values()
            .filter(|r| r.channel_id == channel_id && r.is_live(now))
            .map(|r| r.user_id)
            .collect();
        users.sort();
        users
    }

    /// Drop expired records, returning how many were removed
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.is_live(now));
        before - self.records.len()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct TypingIndicatorTracker {
    backend: Arc<dyn ChatBackend>,
    policy: TypingPolicy,
    write_timeout: Duration,
    records: Arc<Mutex<TypingSet>>,
    idle_clear: Option<JoinHandle<()>>,
    last_published: Option<(ChannelId, UserId, Instant)>,
    connection: Option<watch::Receiver<ConnectionState>>,
}

impl TypingIndicatorTracker {
    pub fn new(backend: Arc<dyn ChatBackend>, policy: TypingPolicy, write_timeout: Duration) -> Self {
        Self {
            backend,
            policy,
            write_timeout,
            records: Arc::new(Mutex::new(TypingSet::default())),
            idle_clear: None,
            last_published: None,
            connection: None,
        }
    }

    /// Reject typing notifications while the connection is not ONLINE
    pub fn with_connection(mut self, connection: watch::Receiver<ConnectionState>) -> Self {
        self.connection = Some(connection);
        self
    }

    fn records(&self) -> MutexGuard<'_, TypingSet> {
        lock(&self.records)
    }

    /// Record that `user_id` is typing in `channel_id` and publish it
    pub fn notify_typing(&mut self, channel_id: ChannelId, user_id: UserId) -> Result<()> {
        if let Some(connection) = &self.connection {
            if connection.borrow().phase != Phase::Online {
                return Err(ChatError::Network("offline".to_string()));
            }
        }

        let now = Utc::now();
        let record = TypingRecord {
            channel_id,
            user_id,
            started_at: now,
            expires_at: now + ttl_delta(self.policy.ttl),
        };
        self.records().upsert(record.clone());

        // Keystrokes inside one idle window only restart the timer
        let fresh = match self.last_published {
            Some((c, u, at)) => c != channel_id || u != user_id || at.elapsed() >= self.policy.idle_clear,
            None => true,
        };
        if fresh {
            self.last_published = Some((channel_id, user_id, Instant::now()));
            let backend = Arc::clone(&self.backend);
            let timeout = self.write_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, backend.upsert_typing(&record)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Typing publish failed: {}", e),
                    Err(_) => debug!("Typing publish timed out"),
                }
            });
        }

        self.restart_idle_timer(channel_id, user_id);
        Ok(())
    }

    /// Clear our own record now (message sent, channel left)
    pub fn clear(&mut self, channel_id: ChannelId, user_id: UserId) {
        if let Some(task) = self.idle_clear.take() {
            task.abort();
        }
        self.last_published = None;
        if self.records().remove(channel_id, user_id) {
            spawn_clear(Arc::clone(&self.backend), self.write_timeout, channel_id, user_id);
        }
    }

    /// Record from another user, seen on the live feed
    pub fn observe(&self, record: TypingRecord) {
        if record.is_live(Utc::now()) {
            self.records().upsert(record);
        }
    }

    pub fn observe_cleared(&self, channel_id: ChannelId, user_id: UserId) {
        self.records().remove(channel_id, user_id);
    }

    pub fn active(&self, channel_id: ChannelId, now: DateTime<Utc>) -> Vec<UserId> {
        self.records().active(channel_id, now)
    }

    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        self.records().prune(now)
    }

    /// Forget every record (channel switch)
    pub fn reset(&mut self) {
        if let Some(task) = self.idle_clear.take() {
            task.abort();
        }
        self.last_published = None;
        self.records().clear();
    }

    fn restart_idle_timer(&mut self, channel_id: ChannelId, user_id: UserId) {
        if let Some(task) = self.idle_clear.take() {
            task.abort();
        }
        let idle = self.policy.idle_clear;
        let records = Arc::clone(&self.records);
        let backend = Arc::clone(&self.backend);
        let timeout = self.write_timeout;
        self.idle_clear = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if lock(&records).remove(channel_id, user_id) {
                debug!("Typing idle in {}, clearing", channel_id);
                spawn_clear(backend, timeout, channel_id, user_id);
            }
        }));
    }
}

impl Drop for TypingIndicatorTracker {
    fn drop(&mut self) {
        if let Some(task) = self.idle_clear.take() {
            task.abort();
        }
    }
}

fn ttl_delta(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(10))
}

fn lock(records: &Mutex<TypingSet>) -> MutexGuard<'_, TypingSet> {
    match records.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn spawn_clear(backend: Arc<dyn ChatBackend>, timeout: Duration, channel_id: ChannelId, user_id: UserId) {
    tokio::spawn(async move {
        if let Ok(Err(e)) = tokio::time::timeout(timeout, backend.clear_typing(channel_id, user_id)).await {
            debug!("Typing clear failed: {}", e);
        }
    });
}
