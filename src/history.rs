//! HistoryLoader: the ordered message backlog of a resolved channel
//!
//! A failed load never blocks channel activation: it yields an empty list
//! together with the error, and the channel stays usable read-only until
//! the load is retried.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::{profile_or_placeholder, ChatBackend, ProfileStore};
use crate::error::ChatError;
use crate::message::{Message, SenderProfile};
use crate::types::{ChannelId, UserId};

/// Outcome of a history load
#[derive(Debug, Clone, Default)]
pub struct HistoryLoad {
    /// Ascending by (created_at, id), deduplicated, non-deleted
    pub messages: Vec<Message>,
    /// The backend had no rows beyond the ones returned
    pub complete: bool,
    pub error: Option<ChatError>,
}

impl HistoryLoad {
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

pub struct HistoryLoader {
    backend: Arc<dyn ChatBackend>,
    profiles: Arc<dyn ProfileStore>,
    timeout: Duration,
    profile_timeout: Duration,
}

impl HistoryLoader {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        profiles: Arc<dyn ProfileStore>,
        timeout: Duration,
        profile_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            profiles,
            timeout,
            profile_timeout,
        }
    }

    /// Load the latest `limit` messages of a channel
    pub async fn load(&self, channel_id: ChannelId, limit: usize) -> HistoryLoad {
        let rows = match tokio::time::timeout(self.timeout, self.backend.load_messages(channel_id, limit)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!("History load for {} failed: {}", channel_id, e);
                return HistoryLoad {
                    error: Some(e),
                    ..HistoryLoad::default()
                };
            }
            Err(_) => {
                warn!("History load for {} timed out", channel_id);
                return HistoryLoad {
                    error: Some(ChatError::Timeout(self.timeout)),
                    ..HistoryLoad::default()
                };
            }
        };

        let complete = rows.len() < limit;
        let mut seen = HashSet::new();
        let mut messages: Vec<Message> = rows
            .into_iter()
            .filter(|row| !row.is_deleted && row.channel_id == channel_id)
            .filter(|row| seen.insert(row.id))
            .map(Message::from)
            .collect();
        messages.sort_by_key(|m| m.sort_key());
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }

        let profiles = self.fetch_profiles(&messages).await;
        let messages = messages
            .into_iter()
            .map(|m| {
                let profile = profiles
                    .get(&m.sender_id)
                    .cloned()
                    .unwrap_or_else(|| SenderProfile::placeholder(m.sender_id));
                m.with_sender(profile)
            })
            .collect::<Vec<_>>();

        debug!("Loaded {} messages for {}", messages.len(), channel_id);
        HistoryLoad {
            messages,
            complete,
            error: None,
        }
    }

    async fn fetch_profiles(&self, messages: &[Message]) -> HashMap<UserId, SenderProfile> {
        let senders: HashSet<UserId> = messages.iter().map(|m| m.sender_id).collect();
        let mut profiles = HashMap::with_capacity(senders.len());
        for id in senders {
            let profile = profile_or_placeholder(&self.profiles, id, self.profile_timeout).await;
            profiles.insert(id, profile);
        }
        profiles
    }
}
