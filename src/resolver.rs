//! ChannelResolver: channel name -> stable channel identity
//!
//! Idempotent get-or-create. A concurrent create by another client shows up
//! as a conflict and is resolved by looking the channel up again. Any other
//! failure degrades to a local-only identity named after the channel.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{AuthProvider, ChatBackend};
use crate::error::{ChatError, Result};
use crate::message::{Channel, NewChannel};
use crate::types::{ChannelIdentity, ChannelKind};

pub struct ChannelResolver {
    backend: Arc<dyn ChatBackend>,
    auth: Arc<dyn AuthProvider>,
    kind: ChannelKind,
    timeout: Duration,
}

impl ChannelResolver {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        auth: Arc<dyn AuthProvider>,
        kind: ChannelKind,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            auth,
            kind,
            timeout,
        }
    }

    /// Resolve `name`, falling back to a local identity on failure
    pub async fn resolve(&self, name: &str) -> ChannelIdentity {
        self.resolve_reporting(name).await.0
    }

    /// Like [`resolve`](Self::resolve), also handing back the error behind a
    /// local fallback
    pub async fn resolve_reporting(&self, name: &str) -> (ChannelIdentity, Option<ChatError>) {
        let name = name.trim();
        match self.try_resolve(name).await {
            Ok(channel) => (
                ChannelIdentity::Resolved {
                    id: channel.id,
                    name: channel.name,
                },
                None,
            ),
            Err(e) => {
                warn!("Could not resolve channel '{}', continuing locally: {}", name, e);
                (ChannelIdentity::Local(name.to_string()), Some(e))
            }
        }
    }

    /// Resolve `name`, reporting the failure instead of degrading
    pub async fn try_resolve(&self, name: &str) -> Result<Channel> {
        if name.is_empty() {
            return Err(ChatError::Validation("Channel name is empty".to_string()));
        }
        match tokio::time::timeout(self.timeout, self.get_or_create(name)).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Timeout(self.timeout)),
        }
    }

    async fn get_or_create(&self, name: &str) -> Result<Channel> {
        if let Some(channel) = self.backend.find_channel(name, self.kind).await? {
            debug!("Channel '{}' resolved to {}", name, channel.id);
            return Ok(channel);
        }

        let creator = self.auth.current_user().ok_or(ChatError::Auth)?;
        let new = NewChannel {
            name: name.to_string(),
            kind: self.kind,
            description: None,
            created_by: creator,
        };

        match self.backend.create_channel(&new).await {
            Ok(channel) => {
                info!("Created channel '{}' ({})", name, channel.id);
                Ok(channel)
            }
            Err(ChatError::Conflict) => {
                debug!("Channel '{}' created concurrently, looking it up again", name);
                self.backend
                    .find_channel(name, self.kind)
                    .await?
                    .ok_or_else(|| ChatError::Protocol(format!("channel '{}' conflicted but is missing", name)))
            }
            Err(e) => Err(e),
        }
    }
}
