//! MessageStore: the merge point for history, live events and optimistic sends
//!
//! Every operation takes the full prior store by value and returns the full
//! next store, so handlers for events that complete in any order can only
//! ever observe whole states. Merging is keyed on message id and followed by
//! a full re-sort, which makes it commutative and idempotent.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::message::{Delivery, Message, SentReceipt};
use crate::types::MessageId;

/// Canonical, ordered, deduplicated message list of one channel session
///
/// Deleted ids are kept as tombstones for the lifetime of the store so a
/// stale insert echo cannot bring a deleted message back.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    entries: HashMap<MessageId, Message>,
    tombstones: HashSet<MessageId>,
    visible: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visible messages, ascending by (created_at, id)
    pub fn messages(&self) -> &[Message] {
        &self.visible
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.entries.get(&id)
    }

    pub fn is_tombstoned(&self, id: MessageId) -> bool {
        self.tombstones.contains(&id)
    }

    /// Fold a loaded backlog into the store
    pub fn merge_history(self, messages: Vec<Message>) -> Self {
        let mut next = self;
        for message in messages {
            next.upsert(message);
        }
        next.rebuild()
    }

    /// Fold a reloaded backlog into the store and drop what it no longer has
    ///
    /// A sent message newer than the oldest reloaded one (or any sent
    /// message, when the reload was `complete`) that the backend did not
    /// return was deleted while we were not listening, so it is tombstoned.
    /// Pending and failed copies are never touched.
    pub fn sync_history(self, messages: Vec<Message>, complete: bool) -> Self {
        let returned: HashSet<MessageId> = messages.iter().map(|m| m.id).collect();
        let oldest = messages.iter().map(|m| m.created_at).min();
        if !complete && oldest.is_none() {
            return self.merge_history(messages);
        }

        let mut next = self;
        let missing: Vec<MessageId> = next
            .entries
            .values()
            .filter(|m| m.delivery == Delivery::Sent && !returned.contains(&m.id))
            .filter(|m| complete || oldest.is_some_and(|oldest| m.created_at > oldest))
            .map(|m| m.id)
            .collect();
        for id in missing {
            debug!("Message {} gone after reload", id);
            next.entries.remove(&id);
            next.tombstones.insert(id);
        }
        next.merge_history(messages)
    }

    /// Fold one live (or edited) message into the store
    pub fn merge_insert(self, message: Message) -> Self {
        let mut next = self;
        next.upsert(message);
        next.rebuild()
    }

    /// Show a locally authored message before the backend confirms it
    pub fn add_optimistic(self, message: Message) -> Self {
        let mut next = self;
        if next.entries.contains_key(&message.id) || next.tombstones.contains(&message.id) {
            return next;
        }
        next.entries.insert(
            message.id,
            Message {
                delivery: Delivery::Pending,
                ..message
            },
        );
        next.rebuild()
    }

    /// Reconcile an optimistic copy with the persisted message
    pub fn confirm(self, local_id: MessageId, receipt: SentReceipt) -> Self {
        let mut next = self;
        let Some(mut local) = next.entries.remove(&local_id) else {
            return next;
        };
        if next.tombstones.contains(&receipt.id) {
            return next.rebuild();
        }
        if receipt.id != local_id {
            debug!("Message {} persisted as {}", local_id, receipt.id);
        }
        match next.entries.get_mut(&receipt.id) {
            // The server copy already arrived through the feed
            Some(existing) => {
                existing.delivery = Delivery::Sent;
                if existing.sender.is_none() {
                    existing.sender = local.sender.take();
                }
            }
            None => {
                local.id = receipt.id;
                local.created_at = receipt.created_at;
                local.delivery = Delivery::Sent;
                next.entries.insert(receipt.id, local);
            }
        }
        next.rebuild()
    }

    /// Mark an optimistic copy as failed; it stays visible for a manual retry
    pub fn mark_failed(self, local_id: MessageId) -> Self {
        let mut next = self;
        if let Some(message) = next.entries.get_mut(&local_id) {
            if message.delivery == Delivery::Pending {
                message.delivery = Delivery::Failed;
            }
        }
        next.rebuild()
    }

    /// Drop a local copy without tombstoning it (rollback)
    pub fn discard(self, id: MessageId) -> Self {
        let mut next = self;
        next.entries.remove(&id);
        next.rebuild()
    }

    /// Remove a soft-deleted message and remember its id
    pub fn merge_deletion(self, id: MessageId) -> Self {
        let mut next = self;
        next.entries.remove(&id);
        next.tombstones.insert(id);
        next.rebuild()
    }

    fn upsert(&mut self, incoming: Message) {
        if self.tombstones.contains(&incoming.id) {
            debug!("Ignoring message {}: deleted earlier", incoming.id);
            return;
        }
        if incoming.is_deleted {
            self.entries.remove(&incoming.id);
            self.tombstones.insert(incoming.id);
            return;
        }
        let merged = match self.entries.remove(&incoming.id) {
            None => incoming,
            Some(existing) => Message {
                // A server copy supersedes a local one; keep what we already know
                delivery: match (existing.delivery, incoming.delivery) {
                    (_, Delivery::Sent) | (Delivery::Sent, _) => Delivery::Sent,
                    (_, other) => other,
                },
                sender: incoming.sender.or(existing.sender),
                ..incoming
            },
        };
        self.entries.insert(merged.id, merged);
    }

    fn rebuild(mut self) -> Self {
        let mut visible: Vec<Message> = self
            .entries
            .values()
            .filter(|m| !m.is_deleted)
            .cloned()
            .collect();
        visible.sort_by_key(|m| m.sort_key());
        self.visible = visible;
        self
    }
}
