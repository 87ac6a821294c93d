//! Error types for the chat core
//!
//! Defines the error taxonomy shared by every component and the failure
//! report returned by a send. Uses thiserror for ergonomic error definitions.

use std::time::Duration;

use thiserror::Error;

/// Chat core errors
///
/// Cloneable so they can be published on watch channels and replayed to
/// callers waiting on the same operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// No authenticated actor, or the session is no longer valid
    #[error("Not authenticated")]
    Auth,

    /// Write rejected by access policy (fatal)
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Backend misconfiguration, e.g. a self-referential access policy (fatal)
    #[error("Backend misconfigured: {0}")]
    Config(String),

    /// No response within the operation budget
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Offline or unreachable
    #[error("Network error: {0}")]
    Network(String),

    /// Empty or oversized content, unresolved channel
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Unique constraint hit (channel or message already exists)
    #[error("Already exists")]
    Conflict,

    /// Response could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The session actor has shut down
    #[error("Chat session closed")]
    SessionClosed,
}

/// Coarse classification used by retry and presentation logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Permission,
    Config,
    Timeout,
    Network,
    Validation,
    Other,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Auth => ErrorKind::Auth,
            ChatError::Permission(_) => ErrorKind::Permission,
            ChatError::Config(_) => ErrorKind::Config,
            ChatError::Timeout(_) => ErrorKind::Timeout,
            ChatError::Network(_) => ErrorKind::Network,
            ChatError::Validation(_) => ErrorKind::Validation,
            ChatError::Conflict | ChatError::Protocol(_) | ChatError::SessionClosed => {
                ErrorKind::Other
            }
        }
    }

    /// Timeouts and generic network failures are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Network)
    }

    /// Retrying cannot change the outcome
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Permission | ErrorKind::Config)
    }

    /// Text suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Auth => "You need to sign in before chatting".to_string(),
            ChatError::Permission(_) => {
                "You don't have permission to post in this channel".to_string()
            }
            ChatError::Config(_) => {
                "Chat is misconfigured on the server; retrying will not help".to_string()
            }
            ChatError::Timeout(_) | ChatError::Network(_) => {
                "Connection problem, tap to retry".to_string()
            }
            ChatError::Validation(reason) => reason.clone(),
            ChatError::Conflict => "That already exists".to_string(),
            ChatError::Protocol(_) => "Unexpected response from the server".to_string(),
            ChatError::SessionClosed => "Chat has been closed".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

/// A send that reached a terminal FAILED state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct SendFailure {
    /// The error from the last attempt (or from validation)
    pub error: ChatError,
    /// Network attempts made; zero when validation failed
    pub attempts: u32,
}

impl SendFailure {
    pub fn new(error: ChatError, attempts: u32) -> Self {
        Self { error, attempts }
    }

    /// Whether a manual retry can reasonably succeed
    pub fn is_recoverable(&self) -> bool {
        self.error.is_transient()
    }
}

impl From<ChatError> for SendFailure {
    fn from(error: ChatError) -> Self {
        Self { error, attempts: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ChatError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(ChatError::Network("reset".into()).is_transient());
        assert!(!ChatError::Permission("rls".into()).is_transient());
        assert!(!ChatError::Validation("empty".into()).is_transient());
        assert!(!ChatError::Auth.is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ChatError::Permission("rls".into()).is_fatal());
        assert!(ChatError::Config("recursion".into()).is_fatal());
        assert!(!ChatError::Timeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn test_fatal_message_does_not_suggest_retry() {
        let msg = ChatError::Config("policy".into()).user_message();
        assert!(msg.contains("will not help"));
        assert!(!ChatError::Permission("x".into()).user_message().contains("retry"));
    }

    #[test]
    fn test_send_failure_recoverable() {
        let failure = SendFailure::new(ChatError::Timeout(Duration::from_secs(5)), 3);
        assert!(failure.is_recoverable());
        let failure: SendFailure = ChatError::Auth.into();
        assert_eq!(failure.attempts, 0);
        assert!(!failure.is_recoverable());
    }
}
