//! Realtime Chat Synchronization Core
//!
//! Client-side core of a channel-based chat application backed by a hosted
//! relational store with a live change feed.
//!
//! # Features
//! - Channel name resolution with idempotent get-or-create
//! - Ordered, deduplicated message history
//! - One live subscription per active channel, merged into a single store
//! - Sends with bounded retry and exponential backoff, shown optimistically
//! - Soft deletes that stale inserts cannot resurrect
//! - Ephemeral typing indicators with TTL
//! - Connection state machine with capped automatic reconnection
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatSession` is the central actor owning all chat state
//! - `ChatClient` handles send it commands and read `watch` views
//! - The backend, auth, profiles and live feed sit behind traits in
//!   `backend`, with HTTP/WebSocket (`rest`, `realtime`) and in-memory
//!   (`memory`) implementations
//!
//! # Example
//! ```ignore
//! use chat_sync::{ChatClient, ChatConfig, Services};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChatConfig::from_env();
//!     let client = ChatClient::spawn(Services::remote(&config)?, &config);
//!
//!     client.select_channel("general").await?;
//!     client.send_message("hello").await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod memory;
pub mod message;
pub mod realtime;
pub mod resolver;
pub mod rest;
pub mod sender;
pub mod session;
pub mod store;
pub mod subscriber;
pub mod types;
pub mod typing;

// Re-export main types for convenience
pub use backend::{AuthProvider, ChangeFeed, ChatBackend, ProfileStore, SubscriptionStatus};
pub use client::ChatClient;
pub use config::ChatConfig;
pub use connection::{ConnectionMonitor, ConnectionState, Phase, ReconnectPolicy};
pub use error::{ChatError, SendFailure};
pub use memory::{MemoryBackend, StaticAuth};
pub use message::{Channel, Delivery, Message, SenderProfile, SentReceipt};
pub use realtime::RealtimeFeed;
pub use rest::{RestBackend, SessionAuth};
pub use sender::{MessageSender, RetryPolicy};
pub use session::{ChatSession, ChatViews, Services, SessionCommand};
pub use store::MessageStore;
pub use types::{ChannelId, ChannelIdentity, ChannelKind, MessageId, UserId};
