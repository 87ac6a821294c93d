//! ChatClient handle
//!
//! Cheap, cloneable front end of a running [`ChatSession`]. Every method
//! sends one command to the actor and awaits its reply; state is read from
//! the watch channels in [`ChatViews`].

use tokio::sync::{mpsc, oneshot};

use crate::config::ChatConfig;
use crate::connection::ConnectionState;
use crate::error::{ChatError, Result, SendFailure};
use crate::message::Message;
use crate::session::{ChatSession, ChatViews, SendResult, Services, SessionCommand};
use crate::types::{ChannelIdentity, MessageId, UserId};

/// Channel buffer size for session commands
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Handle to a chat session
///
/// The session shuts down once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct ChatClient {
    commands: mpsc::Sender<SessionCommand>,
    views: ChatViews,
}

impl ChatClient {
    /// Start a session on the current tokio runtime
    pub fn spawn(services: Services, config: &ChatConfig) -> Self {
        let (commands, receiver) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let session = ChatSession::new(services, config, receiver);
        let views = session.views();
        tokio::spawn(session.run());
        Self { commands, views }
    }

    /// Send a command built around a reply channel and wait for the answer
    ///
    /// Returns an error if the session has shut down.
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ChatError::SessionClosed)?;
        response.await.map_err(|_| ChatError::SessionClosed)
    }

    /// Make `name` the active channel
    ///
    /// Resolution failures are not errors: the channel comes back as
    /// [`ChannelIdentity::Local`] and the cause is published on `last_error`.
    pub async fn select_channel(&self, name: &str) -> Result<ChannelIdentity> {
        let name = name.to_string();
        self.request(|reply| SessionCommand::SelectChannel { name, reply })
            .await
    }

    /// Send a message; resolves when it is persisted or has finally failed
    pub async fn send_message(&self, content: &str) -> SendResult {
        let content = content.to_string();
        self.request(|reply| SessionCommand::SendMessage { content, reply })
            .await
            .map_err(SendFailure::from)?
    }

    pub async fn retry_message(&self, id: MessageId) -> SendResult {
        self.request(|reply| SessionCommand::RetryMessage { id, reply })
            .await
            .map_err(SendFailure::from)?
    }

    pub async fn discard_message(&self, id: MessageId) -> Result<()> {
        self.request(|reply| SessionCommand::DiscardMessage { id, reply })
            .await
    }

    pub async fn delete_message(&self, id: MessageId) -> Result<()> {
        self.request(|reply| SessionCommand::DeleteMessage { id, reply })
            .await?
    }

    pub async fn notify_typing(&self) -> Result<()> {
        self.request(|reply| SessionCommand::NotifyTyping { reply })
            .await?
    }

    /// Report a platform reachability change
    pub async fn network_changed(&self, online: bool) -> Result<ConnectionState> {
        self.request(|reply| SessionCommand::NetworkChanged { online, reply })
            .await
    }

    /// Try to reconnect now, re-arming a retry loop that gave up
    pub async fn reconnect(&self) -> Result<ConnectionState> {
        self.request(|reply| SessionCommand::Reconnect { reply }).await
    }

    pub async fn reload_history(&self) -> Result<()> {
        self.request(|reply| SessionCommand::ReloadHistory { reply })
            .await?
    }

    pub fn views(&self) -> ChatViews {
        self.views.clone()
    }

    /// Snapshot of the active channel's messages
    pub fn messages(&self) -> Vec<Message> {
        self.views.messages.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.views.connection.borrow().clone()
    }

    pub fn typing_users(&self) -> Vec<UserId> {
        self.views.typing.borrow().clone()
    }

    pub fn active_channel(&self) -> Option<ChannelIdentity> {
        self.views.channel.borrow().clone()
    }

    pub fn last_error(&self) -> Option<ChatError> {
        self.views.last_error.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, StaticAuth};

    fn spawn_client() -> ChatClient {
        let services = Services::in_memory(MemoryBackend::new(), StaticAuth::signed_in(UserId::new()));
        ChatClient::spawn(services, &ChatConfig::default())
    }

    #[tokio::test]
    async fn test_client_starts_idle() {
        let client = spawn_client();

        assert!(client.messages().is_empty());
        assert!(client.typing_users().is_empty());
        assert!(client.active_channel().is_none());
        assert!(client.last_error().is_none());
        assert!(client.connection_state().is_online());
    }

    #[tokio::test]
    async fn test_commands_need_a_channel() {
        let client = spawn_client();

        let failure = client.send_message("hello").await.unwrap_err();
        assert!(matches!(failure.error, ChatError::Validation(_)));
        assert_eq!(failure.attempts, 0);
        assert!(client.notify_typing().await.is_err());
        assert!(client.reload_history().await.is_err());
    }

    #[tokio::test]
    async fn test_clones_share_one_session() {
        let client = spawn_client();
        let other = client.clone();

        let identity = client.select_channel("general").await.unwrap();
        assert_eq!(other.active_channel(), Some(identity));
    }
}
