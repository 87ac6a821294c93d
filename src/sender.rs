//! MessageSender: validated sends with bounded, backed-off retries
//!
//! Per send call:
//!
//! ```text
//! VALIDATING -> ATTEMPTING(n) -> SUCCESS
//!                             -> RETRYING -> ATTEMPTING(n + 1)
//!                             -> FAILED
//! ```
//!
//! Only timeouts and generic network errors are retried. RETRYING is never
//! entered after a fatal error, and a manual retry is always a fresh send.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{AuthProvider, ChatBackend};
use crate::connection::{ConnectionState, Phase};
use crate::error::{ChatError, Result, SendFailure};
use crate::message::{NewMessage, SentReceipt};
use crate::types::{ChannelIdentity, MessageId};

/// Growth factor between consecutive retry delays
const BACKOFF_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

/// Delay before retry number `retry` (0-based): `base * 1.5^retry`
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.mul_f64(BACKOFF_FACTOR.powi(retry as i32))
}

/// State of one send call
#[derive(Debug, Clone, PartialEq)]
pub enum SendPhase {
    Validating,
    Attempting(u32),
    Retrying { attempt: u32, delay: Duration },
    Success(SentReceipt),
    Failed { error: ChatError, attempts: u32 },
}

impl SendPhase {
    /// Next phase once attempt `attempt` (1-based) has produced `outcome`
    pub fn after_attempt(attempt: u32, outcome: Result<SentReceipt>, policy: &RetryPolicy) -> Self {
        match outcome {
            Ok(receipt) => SendPhase::Success(receipt),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                SendPhase::Retrying {
                    attempt,
                    delay: backoff_delay(policy.base_delay, attempt - 1),
                }
            }
            Err(error) => SendPhase::Failed {
                error,
                attempts: attempt,
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SendPhase::Success(_) | SendPhase::Failed { .. })
    }
}

pub struct MessageSender {
    backend: Arc<dyn ChatBackend>,
    auth: Arc<dyn AuthProvider>,
    policy: RetryPolicy,
    max_content_len: usize,
    connection: Option<watch::Receiver<ConnectionState>>,
}

impl MessageSender {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        auth: Arc<dyn AuthProvider>,
        policy: RetryPolicy,
        max_content_len: usize,
    ) -> Self {
        Self {
            backend,
            auth,
            policy,
            max_content_len,
            connection: None,
        }
    }

    /// Reject sends while the connection is not ONLINE
    pub fn with_connection(mut self, connection: watch::Receiver<ConnectionState>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Validate and send in one call
    pub async fn send(
        &self,
        channel: &ChannelIdentity,
        content: &str,
    ) -> std::result::Result<SentReceipt, SendFailure> {
        let draft = self.prepare(channel, content).await?;
        self.deliver(&draft).await
    }

    /// VALIDATING: check every precondition before touching the network
    pub async fn prepare(&self, channel: &ChannelIdentity, content: &str) -> Result<NewMessage> {
        debug!("Send phase {:?}", SendPhase::Validating);

        let sender_id = self.auth.current_user().ok_or(ChatError::Auth)?;
        if !self.auth.session_valid().await {
            return Err(ChatError::Auth);
        }

        let channel_id = channel.id().ok_or_else(|| {
            ChatError::Validation(format!(
                "#{} is not connected to the server",
                channel.name()
            ))
        })?;

        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::Validation("Message is empty".to_string()));
        }
        let len = content.chars().count();
        if len > self.max_content_len {
            return Err(ChatError::Validation(format!(
                "Message is too long ({} > {} characters)",
                len, self.max_content_len
            )));
        }

        if let Some(connection) = &self.connection {
            if connection.borrow().phase != Phase::Online {
                return Err(ChatError::Network("offline".to_string()));
            }
        }

        Ok(NewMessage {
            id: MessageId::new(),
            channel_id,
            sender_id,
            content: content.to_string(),
        })
    }

    /// ATTEMPTING / RETRYING until a terminal phase
    pub async fn deliver(&self, draft: &NewMessage) -> std::result::Result<SentReceipt, SendFailure> {
        let mut phase = SendPhase::Attempting(1);
        loop {
            debug!(message_id = %draft.id, "Send phase {:?}", phase);
            phase = match phase {
                SendPhase::Validating => SendPhase::Attempting(1),
                SendPhase::Attempting(attempt) => {
                    let outcome = self.attempt(draft).await;
                    if let Err(e) = &outcome {
                        warn!(message_id = %draft.id, attempt, "Send attempt failed: {}", e);
                    }
                    SendPhase::after_attempt(attempt, outcome, &self.policy)
                }
                SendPhase::Retrying { attempt, delay } => {
                    tokio::time::sleep(delay).await;
                    SendPhase::Attempting(attempt + 1)
                }
                SendPhase::Success(receipt) => {
                    info!("Message {} sent", receipt.id);
                    return Ok(receipt);
                }
                SendPhase::Failed { error, attempts } => {
                    return Err(SendFailure::new(error, attempts));
                }
            };
        }
    }

    async fn attempt(&self, draft: &NewMessage) -> Result<SentReceipt> {
        let timeout = self.policy.attempt_timeout;
        match tokio::time::timeout(timeout, self.backend.insert_message(draft)).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(ChatError::Conflict)) => {
                // An earlier attempt landed even though we never heard back
                debug!("Message {} already persisted", draft.id);
                self.persisted_receipt(draft).await
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ChatError::Timeout(timeout)),
        }
    }

    /// Receipt for a draft the backend already holds, stamped with its stored time
    async fn persisted_receipt(&self, draft: &NewMessage) -> Result<SentReceipt> {
        let timeout = self.policy.attempt_timeout;
        let row = tokio::time::timeout(timeout, self.backend.find_message(draft.id))
            .await
            .map_err(|_| ChatError::Timeout(timeout))??;
        match row {
            Some(row) if row.channel_id == draft.channel_id && row.sender_id == draft.sender_id => {
                Ok(SentReceipt {
                    id: row.id,
                    created_at: row.created_at,
                })
            }
            Some(_) => Err(ChatError::Protocol(format!(
                "message id {} already taken by another message",
                draft.id
            ))),
            None => Err(ChatError::Protocol(format!(
                "message {} reported as existing but not readable",
                draft.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, MemoryBackend, StaticAuth};
    use crate::types::{ChannelKind, UserId};
    use chrono::Utc;
    use tokio::time::Instant;

    fn sender(backend: &MemoryBackend, auth: StaticAuth) -> MessageSender {
        MessageSender::new(
            Arc::new(backend.clone()),
            Arc::new(auth),
            RetryPolicy::default(),
            20,
        )
    }

    fn resolved(backend: &MemoryBackend) -> ChannelIdentity {
        let channel = backend.seed_channel("general", ChannelKind::Public);
        ChannelIdentity::Resolved {
            id: channel.id,
            name: channel.name,
        }
    }

    #[test]
    fn test_backoff_delay_grows_by_half() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(2250));
    }

    #[test]
    fn test_transitions() {
        let policy = RetryPolicy::default();
        let timeout = || Err(ChatError::Timeout(Duration::from_secs(5)));

        assert_eq!(
            SendPhase::after_attempt(1, timeout(), &policy),
            SendPhase::Retrying {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert!(matches!(
            SendPhase::after_attempt(3, timeout(), &policy),
            SendPhase::Failed { attempts: 3, .. }
        ));
        assert!(matches!(
            SendPhase::after_attempt(1, Err(ChatError::Config("policy".into())), &policy),
            SendPhase::Failed { attempts: 1, .. }
        ));
        let receipt = SentReceipt {
            id: MessageId::new(),
            created_at: Utc::now(),
        };
        let success = SendPhase::after_attempt(2, Ok(receipt), &policy);
        assert!(success.is_terminal());
        assert!(!SendPhase::Attempting(1).is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_timeouts_then_success() {
        let backend = MemoryBackend::new();
        let channel = resolved(&backend);
        backend.fail_inserts([Fault::Hang, Fault::Hang]);

        let receipt = sender(&backend, StaticAuth::signed_in(UserId::new()))
            .send(&channel, "hello")
            .await
            .unwrap();

        assert_eq!(backend.insert_attempts(), 3);
        let stored = backend.messages_in(channel.id().unwrap());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, receipt.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_error_not_retried() {
        let backend = MemoryBackend::new();
        let channel = resolved(&backend);
        backend.fail_inserts([Fault::Fail(ChatError::Permission("rls".into()))]);

        let started = Instant::now();
        let failure = sender(&backend, StaticAuth::signed_in(UserId::new()))
            .send(&channel, "hello")
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert!(!failure.is_recoverable());
        assert_eq!(backend.insert_attempts(), 1);
        assert!(started.elapsed() < RetryPolicy::default().base_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust() {
        let backend = MemoryBackend::new();
        let channel = resolved(&backend);
        let network = || Fault::Fail(ChatError::Network("reset".into()));
        backend.fail_inserts([network(), network(), network(), network()]);

        let started = Instant::now();
        let failure = sender(&backend, StaticAuth::signed_in(UserId::new()))
            .send(&channel, "hello")
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 3);
        assert!(failure.is_recoverable());
        assert_eq!(backend.insert_attempts(), 3);
        // 1s + 1.5s of backoff between the three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2500));
        assert!(elapsed < Duration::from_millis(2600));
    }

    #[tokio::test]
    async fn test_conflict_counts_as_delivered() {
        let backend = MemoryBackend::new();
        let channel = resolved(&backend);
        let sender = sender(&backend, StaticAuth::signed_in(UserId::new()));
        let draft = sender.prepare(&channel, "hello").await.unwrap();

        backend.insert_message(&draft).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let receipt = sender.deliver(&draft).await.unwrap();
        assert_eq!(receipt.id, draft.id);
        let stored = backend.messages_in(draft.channel_id);
        assert_eq!(stored.len(), 1);
        assert_eq!(receipt.created_at, stored[0].created_at);
    }

    #[tokio::test]
    async fn test_validation_fails_fast() {
        let backend = MemoryBackend::new();
        let channel = resolved(&backend);
        let signed_in = sender(&backend, StaticAuth::signed_in(UserId::new()));

        let empty = signed_in.send(&channel, "   ").await.unwrap_err();
        assert!(matches!(empty.error, ChatError::Validation(_)));
        assert_eq!(empty.attempts, 0);

        let long = "x".repeat(21);
        let oversized = signed_in.send(&channel, &long).await.unwrap_err();
        assert!(matches!(oversized.error, ChatError::Validation(_)));

        let local = ChannelIdentity::Local("general".to_string());
        let unresolved = signed_in.send(&local, "hi").await.unwrap_err();
        assert!(matches!(unresolved.error, ChatError::Validation(_)));

        let anonymous = sender(&backend, StaticAuth::anonymous())
            .send(&channel, "hi")
            .await
            .unwrap_err();
        assert_eq!(anonymous.error, ChatError::Auth);

        assert_eq!(backend.insert_attempts(), 0);
    }

    #[tokio::test]
    async fn test_content_trimmed_and_multibyte_counted_by_char() {
        let backend = MemoryBackend::new();
        let channel = resolved(&backend);
        let draft = sender(&backend, StaticAuth::signed_in(UserId::new()))
            .prepare(&channel, "  ééééééééééééééééééé  ")
            .await
            .unwrap();
        assert_eq!(draft.content.chars().count(), 19);
    }

    #[tokio::test]
    async fn test_offline_rejected_without_attempt() {
        let backend = MemoryBackend::new();
        let channel = resolved(&backend);
        let (_tx, rx) = watch::channel(ConnectionState::offline());
        let sender = sender(&backend, StaticAuth::signed_in(UserId::new())).with_connection(rx);

        let failure = sender.send(&channel, "hi").await.unwrap_err();
        assert_eq!(failure.error, ChatError::Network("offline".to_string()));
        assert!(failure.is_recoverable());
        assert_eq!(backend.insert_attempts(), 0);
    }
}
