//! Live change feed over the realtime WebSocket
//!
//! Each opened feed is its own socket joined to one Phoenix-style topic,
//! `realtime:messages:{channel_id}`, with postgres change filters scoped to
//! that channel. A background task pumps frames into the [`FeedStream`],
//! sends heartbeats, and leaves the topic when the stream is closed.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::backend::{ChangeFeed, FeedItem, FeedStream, SubscriptionStatus};
use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::message::ChangeEvent;
use crate::types::{ChannelId, UserId};

/// The server drops sockets that stay silent for longer than this
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Channel buffer size for decoded feed items
const FEED_BUFFER_SIZE: usize = 256;

const JOIN_REF: &str = "1";

/// Outgoing Phoenix frame
#[derive(Debug, Serialize)]
struct OutFrame<'a> {
    topic: &'a str,
    event: &'a str,
    payload: Value,
    #[serde(rename = "ref")]
    reference: String,
    join_ref: Option<&'a str>,
}

/// Incoming Phoenix frame
#[derive(Debug, Deserialize)]
struct InFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

/// Body of a `postgres_changes` event
#[derive(Debug, Deserialize)]
struct ChangeData {
    table: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Value,
    #[serde(default)]
    old_record: Value,
}

/// Key columns of a deleted typing row
#[derive(Debug, Deserialize)]
struct TypingKey {
    channel_id: Option<ChannelId>,
    user_id: UserId,
}

/// Topic and decoding state for one channel's feed
#[derive(Debug, Clone)]
pub struct FeedTopic {
    channel_id: ChannelId,
    topic: String,
}

impl FeedTopic {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            topic: format!("realtime:messages:{}", channel_id),
        }
    }

    pub fn name(&self) -> &str {
        &self.topic
    }

    /// Join request subscribing to this channel's rows only
    pub fn join_frame(&self, access_token: Option<&str>) -> String {
        let filter = format!("channel_id=eq.{}", self.channel_id);
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "INSERT", "schema": "public", "table": "messages", "filter": filter },
                    { "event": "UPDATE", "schema": "public", "table": "messages", "filter": filter },
                    { "event": "*", "schema": "public", "table": "typing_indicators", "filter": filter },
                ],
            },
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }
        encode(&self.topic, "phx_join", payload, JOIN_REF.to_string(), Some(JOIN_REF))
    }

    pub fn leave_frame(&self, reference: u64) -> String {
        encode(&self.topic, "phx_leave", json!({}), reference.to_string(), Some(JOIN_REF))
    }

    /// Decode one text frame into a feed item
    ///
    /// `Ok(None)` for frames that carry nothing for the session (other
    /// topics, heartbeat replies, unknown events).
    pub fn decode(&self, text: &str) -> Result<Option<FeedItem>> {
        let frame: InFrame =
            serde_json::from_str(text).map_err(|e| ChatError::Protocol(format!("bad frame: {}", e)))?;
        if frame.topic != self.topic {
            return Ok(None);
        }

        let item = match frame.event.as_str() {
            "phx_reply" => {
                if frame.reference.as_deref() != Some(JOIN_REF) {
                    return Ok(None);
                }
                match frame.payload["status"].as_str() {
                    Some("ok") => Some(FeedItem::Status(SubscriptionStatus::Subscribed)),
                    _ => Some(FeedItem::Status(SubscriptionStatus::ChannelError(reason(
                        &frame.payload["response"],
                    )))),
                }
            }
            "system" => match frame.payload["status"].as_str() {
                Some("error") => Some(FeedItem::Status(SubscriptionStatus::ChannelError(reason(
                    &frame.payload,
                )))),
                _ => None,
            },
            "phx_error" => Some(FeedItem::Status(SubscriptionStatus::ChannelError(
                "channel crashed".to_string(),
            ))),
            "phx_close" => Some(FeedItem::Status(SubscriptionStatus::Closed)),
            "postgres_changes" => self.decode_change(frame.payload)?.map(FeedItem::Change),
            _ => None,
        };
        Ok(item)
    }

    fn decode_change(&self, mut payload: Value) -> Result<Option<ChangeEvent>> {
        let data: ChangeData = serde_json::from_value(payload["data"].take())
            .map_err(|e| ChatError::Protocol(format!("bad change: {}", e)))?;

        let event = match (data.table.as_str(), data.kind.as_str()) {
            ("messages", "INSERT") => ChangeEvent::Insert(row(data.record)?),
            ("messages", "UPDATE") => ChangeEvent::Update(row(data.record)?),
            ("typing_indicators", "INSERT" | "UPDATE") => ChangeEvent::Typing(row(data.record)?),
            ("typing_indicators", "DELETE") => {
                let key: TypingKey = row(data.old_record)?;
                ChangeEvent::TypingCleared {
                    channel_id: key.channel_id.unwrap_or(self.channel_id),
                    user_id: key.user_id,
                }
            }
            (table, kind) => {
                debug!("Ignoring {} on {}", kind, table);
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

fn row<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ChatError::Protocol(format!("bad record: {}", e)))
}

fn reason(payload: &Value) -> String {
    payload["reason"]
        .as_str()
        .or_else(|| payload["message"].as_str())
        .unwrap_or("subscription rejected")
        .to_string()
}

fn encode(topic: &str, event: &str, payload: Value, reference: String, join_ref: Option<&str>) -> String {
    let frame = OutFrame {
        topic,
        event,
        payload,
        reference,
        join_ref,
    };
    // A struct of strings and a `Value` always serializes
    serde_json::to_string(&frame).unwrap_or_default()
}

fn heartbeat_frame(reference: u64) -> String {
    encode("phoenix", "heartbeat", json!({}), reference.to_string(), None)
}

/// [`ChangeFeed`] backed by the realtime WebSocket
#[derive(Debug, Clone)]
pub struct RealtimeFeed {
    url: String,
    access_token: Option<String>,
}

impl RealtimeFeed {
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            url: config.realtime_url(),
            access_token: config.access_token.clone(),
        }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn open(&self, channel_id: ChannelId) -> Result<FeedStream> {
        let topic = FeedTopic::new(channel_id);
        debug!("Connecting realtime feed for {}", topic.name());

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ChatError::Network(format!("realtime connect failed: {}", e)))?;
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        ws_sender
            .send(Message::Text(topic.join_frame(self.access_token.as_deref()).into()))
            .await
            .map_err(|e| ChatError::Network(format!("realtime join failed: {}", e)))?;

        let (events_tx, events_rx) = mpsc::channel(FEED_BUFFER_SIZE);
        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(pump(topic, ws_sender, ws_receiver, events_tx, close_rx));

        Ok(FeedStream::new(events_rx, close_tx))
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Move frames from the socket into the feed until either side goes away
async fn pump(
    topic: FeedTopic,
    mut ws_sender: futures_util::stream::SplitSink<WsStream, Message>,
    mut ws_receiver: futures_util::stream::SplitStream<WsStream>,
    events: mpsc::Sender<FeedItem>,
    mut close: oneshot::Receiver<()>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut reference: u64 = 1;

    let ending = loop {
        tokio::select! {
            _ = &mut close => {
                reference += 1;
                let _ = ws_sender.send(Message::Text(topic.leave_frame(reference).into())).await;
                debug!("Left {}", topic.name());
                break None;
            }
            _ = heartbeat.tick() => {
                reference += 1;
                if let Err(e) = ws_sender.send(Message::Text(heartbeat_frame(reference).into())).await {
                    warn!("Heartbeat on {} failed: {}", topic.name(), e);
                    break Some(SubscriptionStatus::ChannelError(e.to_string()));
                }
            }
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => match topic.decode(&text) {
                    Ok(Some(item)) => {
                        let terminal = matches!(
                            item,
                            FeedItem::Status(SubscriptionStatus::Closed | SubscriptionStatus::ChannelError(_))
                        );
                        if events.send(item).await.is_err() {
                            debug!("Feed reader gone for {}", topic.name());
                            break None;
                        }
                        if terminal {
                            break None;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Undecodable frame on {}: {}", topic.name(), e),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_sender.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Realtime socket for {} closed", topic.name());
                    break Some(SubscriptionStatus::Closed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Realtime socket error on {}: {}", topic.name(), e);
                    break Some(SubscriptionStatus::ChannelError(e.to_string()));
                }
            },
        }
    };

    if let Some(status) = ending {
        let _ = events.send(FeedItem::Status(status)).await;
    }
    let _ = ws_sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageRow, TypingRecord};

    fn topic() -> (ChannelId, FeedTopic) {
        let channel_id = ChannelId::new();
        (channel_id, FeedTopic::new(channel_id))
    }

    #[test]
    fn test_join_frame_scopes_to_channel() {
        let (channel_id, topic) = topic();
        let frame: Value = serde_json::from_str(&topic.join_frame(Some("jwt"))).unwrap();

        assert_eq!(frame["topic"], format!("realtime:messages:{}", channel_id));
        assert_eq!(frame["event"], "phx_join");
        assert_eq!(frame["ref"], "1");
        assert_eq!(frame["payload"]["access_token"], "jwt");
        let changes = frame["payload"]["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(changes.len(), 3);
        for change in changes {
            assert_eq!(change["filter"], format!("channel_id=eq.{}", channel_id));
        }
    }

    #[test]
    fn test_join_reply_statuses() {
        let (_, topic) = topic();
        let ok = json!({
            "topic": topic.name(), "event": "phx_reply", "ref": "1",
            "payload": { "status": "ok", "response": {} }
        });
        assert_eq!(
            topic.decode(&ok.to_string()).unwrap(),
            Some(FeedItem::Status(SubscriptionStatus::Subscribed))
        );

        let rejected = json!({
            "topic": topic.name(), "event": "phx_reply", "ref": "1",
            "payload": { "status": "error", "response": { "reason": "unauthorized" } }
        });
        assert_eq!(
            topic.decode(&rejected.to_string()).unwrap(),
            Some(FeedItem::Status(SubscriptionStatus::ChannelError("unauthorized".to_string())))
        );

        // heartbeat replies carry other refs
        let heartbeat = json!({
            "topic": topic.name(), "event": "phx_reply", "ref": "7",
            "payload": { "status": "ok", "response": {} }
        });
        assert_eq!(topic.decode(&heartbeat.to_string()).unwrap(), None);
    }

    #[test]
    fn test_message_insert_and_soft_delete() {
        let (channel_id, topic) = topic();
        let record = json!({
            "id": "6a1f9d2e-8a0b-4c6d-9e3f-1a2b3c4d5e6f",
            "channel_id": channel_id.to_string(),
            "sender_id": "0b4e7c1a-2d3f-4e5a-8b6c-7d8e9f0a1b2c",
            "content": "hello",
            "created_at": "2024-05-01T12:00:00.123456+00:00",
            "is_deleted": false
        });
        let insert = json!({
            "topic": topic.name(), "event": "postgres_changes", "ref": null,
            "payload": { "data": { "table": "messages", "type": "INSERT", "record": record } }
        });
        match topic.decode(&insert.to_string()).unwrap() {
            Some(FeedItem::Change(ChangeEvent::Insert(row))) => {
                assert_eq!(row.content, "hello");
                assert_eq!(row.channel_id, channel_id);
                assert!(!row.is_deleted);
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut deleted = record.clone();
        deleted["is_deleted"] = json!(true);
        let update = json!({
            "topic": topic.name(), "event": "postgres_changes",
            "payload": { "data": { "table": "messages", "type": "UPDATE", "record": deleted } }
        });
        assert!(matches!(
            topic.decode(&update.to_string()).unwrap(),
            Some(FeedItem::Change(ChangeEvent::Update(MessageRow { is_deleted: true, .. })))
        ));
    }

    #[test]
    fn test_typing_rows() {
        let (channel_id, topic) = topic();
        let user = "0b4e7c1a-2d3f-4e5a-8b6c-7d8e9f0a1b2c";
        let upsert = json!({
            "topic": topic.name(), "event": "postgres_changes",
            "payload": { "data": { "table": "typing_indicators", "type": "UPDATE", "record": {
                "channel_id": channel_id.to_string(),
                "user_id": user,
                "started_at": "2024-05-01T12:00:00Z",
                "expires_at": "2024-05-01T12:00:10Z"
            } } }
        });
        assert!(matches!(
            topic.decode(&upsert.to_string()).unwrap(),
            Some(FeedItem::Change(ChangeEvent::Typing(TypingRecord { .. })))
        ));

        // only the key survives a delete without full replica identity
        let delete = json!({
            "topic": topic.name(), "event": "postgres_changes",
            "payload": { "data": { "table": "typing_indicators", "type": "DELETE",
                "record": null, "old_record": { "user_id": user } } }
        });
        assert_eq!(
            topic.decode(&delete.to_string()).unwrap(),
            Some(FeedItem::Change(ChangeEvent::TypingCleared {
                channel_id,
                user_id: user.parse().unwrap(),
            }))
        );
    }

    #[test]
    fn test_lifecycle_and_foreign_frames() {
        let (_, topic) = topic();
        let close = json!({ "topic": topic.name(), "event": "phx_close", "payload": {} });
        assert_eq!(
            topic.decode(&close.to_string()).unwrap(),
            Some(FeedItem::Status(SubscriptionStatus::Closed))
        );

        let error = json!({ "topic": topic.name(), "event": "phx_error", "payload": {} });
        assert!(matches!(
            topic.decode(&error.to_string()).unwrap(),
            Some(FeedItem::Status(SubscriptionStatus::ChannelError(_)))
        ));

        let other = json!({ "topic": "realtime:messages:other", "event": "phx_close", "payload": {} });
        assert_eq!(topic.decode(&other.to_string()).unwrap(), None);

        assert!(topic.decode("not json").is_err());
    }

    #[test]
    fn test_heartbeat_and_leave_frames() {
        let (_, topic) = topic();
        let heartbeat: Value = serde_json::from_str(&heartbeat_frame(3)).unwrap();
        assert_eq!(heartbeat["topic"], "phoenix");
        assert_eq!(heartbeat["event"], "heartbeat");
        assert_eq!(heartbeat["ref"], "3");

        let leave: Value = serde_json::from_str(&topic.leave_frame(4)).unwrap();
        assert_eq!(leave["event"], "phx_leave");
        assert_eq!(leave["topic"], topic.name());
    }
}
