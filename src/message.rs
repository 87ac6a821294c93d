//! Chat data model
//!
//! One `Message` shape for every producer (history load, live insert,
//! optimistic send), plus the wire rows and change events exchanged with
//! the backend. Wire types use Serde with the backend's snake_case columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, ChannelKind, MessageId, UserId};

/// Display information about a message author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub id: UserId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl SenderProfile {
    /// Stand-in used when the profile is missing or could not be fetched
    pub fn placeholder(id: UserId) -> Self {
        Self {
            id,
            display_name: "Unknown".to_string(),
            avatar_ref: None,
        }
    }
}

/// Local delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Optimistic copy, not yet confirmed by the backend
    Pending,
    /// Persisted server-side
    #[default]
    Sent,
    /// All attempts failed; kept visible for a manual retry
    Failed,
}

/// A chat message as held by the store
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub sender: Option<SenderProfile>,
    pub delivery: Delivery,
}

impl Message {
    /// Optimistic local copy of an outgoing message
    pub fn optimistic(draft: &NewMessage, sender: Option<SenderProfile>, now: DateTime<Utc>) -> Self {
        Self {
            id: draft.id,
            channel_id: draft.channel_id,
            sender_id: draft.sender_id,
            content: draft.content.clone(),
            created_at: now,
            is_deleted: false,
            sender,
            delivery: Delivery::Pending,
        }
    }

    pub fn with_sender(mut self, sender: SenderProfile) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Name to show next to the message
    pub fn display_name(&self) -> &str {
        self.sender
            .as_ref()
            .map(|p| p.display_name.as_str())
            .unwrap_or("Unknown")
    }

    /// Store ordering key: created_at, ties broken by id
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            channel_id: row.channel_id,
            sender_id: row.sender_id,
            content: row.content,
            created_at: row.created_at,
            is_deleted: row.is_deleted,
            sender: None,
            delivery: Delivery::Sent,
        }
    }
}

/// `messages` table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

/// Insert payload for an outgoing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
}

/// What the backend reports after persisting a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentReceipt {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
}

/// `channels` table row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by: Option<UserId>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Insert payload for a lazily created channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewChannel {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    pub description: Option<String>,
    pub created_by: UserId,
}

/// `typing_indicators` row: someone is composing in a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingRecord {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TypingRecord {
    /// Records at or past their expiry are treated as absent
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A change delivered by the live feed for one channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// INSERT on `messages`
    Insert(MessageRow),
    /// UPDATE on `messages` (soft delete or edit)
    Update(MessageRow),
    /// INSERT/UPDATE on `typing_indicators`
    Typing(TypingRecord),
    /// DELETE on `typing_indicators`
    TypingCleared { channel_id: ChannelId, user_id: UserId },
}

impl ChangeEvent {
    /// Channel the change belongs to
    pub fn channel_id(&self) -> ChannelId {
        match self {
            ChangeEvent::Insert(row) | ChangeEvent::Update(row) => row.channel_id,
            ChangeEvent::Typing(record) => record.channel_id,
            ChangeEvent::TypingCleared { channel_id, .. } => *channel_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_message_row_deserialize() {
        let json = r#"{
            "id": "6f1c1a4e-1f4b-4a7e-9d2a-2b0c3f7e8a11",
            "channel_id": "0b7e2f6a-9c1d-4e3f-8a5b-6c7d8e9f0a1b",
            "sender_id": "1c2d3e4f-5a6b-4c7d-8e9f-0a1b2c3d4e5f",
            "content": "hello",
            "created_at": "2024-05-01T10:00:00+00:00"
        }"#;
        let row: MessageRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.content, "hello");
        assert!(!row.is_deleted);

        let msg = Message::from(row);
        assert_eq!(msg.delivery, Delivery::Sent);
        assert_eq!(msg.display_name(), "Unknown");
    }

    #[test]
    fn test_channel_kind_renamed_to_type() {
        let channel = NewChannel {
            name: "general".to_string(),
            kind: ChannelKind::Public,
            description: None,
            created_by: UserId::new(),
        };
        let json = serde_json::to_string(&channel).unwrap();
        assert!(json.contains("\"type\":\"public\""));
    }

    #[test]
    fn test_typing_record_expiry_boundary() {
        let now = Utc::now();
        let record = TypingRecord {
            channel_id: ChannelId::new(),
            user_id: UserId::new(),
            started_at: now,
            expires_at: now + Duration::seconds(10),
        };
        assert!(record.is_live(now + Duration::seconds(9)));
        assert!(!record.is_live(now + Duration::seconds(10)));
    }

    #[test]
    fn test_optimistic_copy_is_pending() {
        let draft = NewMessage {
            id: MessageId::new(),
            channel_id: ChannelId::new(),
            sender_id: UserId::new(),
            content: "hi".to_string(),
        };
        let msg = Message::optimistic(&draft, None, Utc::now());
        assert_eq!(msg.id, draft.id);
        assert_eq!(msg.delivery, Delivery::Pending);
    }
}
