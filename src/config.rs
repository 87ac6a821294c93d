//! Client configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the client can start with zero
//! configuration against a local backend.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::connection::ReconnectPolicy;
use crate::sender::RetryPolicy;
use crate::typing::TypingPolicy;
use crate::types::{ChannelKind, UserId};

/// Per-operation network budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Channel lookup/create, history load, delete
    pub query: Duration,
    /// Sender profile fetch
    pub profile: Duration,
    /// Opening the live feed
    pub subscribe: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            query: Duration::from_secs(5),
            profile: Duration::from_secs(3),
            subscribe: Duration::from_secs(8),
        }
    }
}

/// Chat client configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Base URL of the hosted backend (REST under `/rest/v1`, feed under
    /// `/realtime/v1`).
    /// Env: `CHAT_BACKEND_URL`
    /// Default: `http://127.0.0.1:54321`
    pub backend_url: String,

    /// Public API key sent with every request.
    /// Env: `CHAT_API_KEY`
    pub api_key: String,

    /// Session access token of the signed-in user.
    /// Env: `CHAT_ACCESS_TOKEN`
    /// Default: none (sending is rejected with an auth error).
    pub access_token: Option<String>,

    /// Id of the signed-in user.
    /// Env: `CHAT_USER_ID`
    pub user_id: Option<UserId>,

    /// Kind used when resolving channel names.
    /// Env: `CHAT_CHANNEL_KIND` (public/private)
    /// Default: `public`
    pub channel_kind: ChannelKind,

    /// Number of messages loaded when a channel is opened.
    /// Env: `CHAT_HISTORY_LIMIT`
    /// Default: `50`
    pub history_limit: usize,

    /// Maximum message length in characters.
    /// Env: `CHAT_MAX_CONTENT_LEN`
    /// Default: `2000`
    pub max_content_len: usize,

    pub timeouts: Timeouts,

    /// Env: `CHAT_SEND_TIMEOUT_MS`, `CHAT_SEND_MAX_ATTEMPTS`, `CHAT_SEND_BASE_DELAY_MS`
    pub retry: RetryPolicy,

    /// Env: `CHAT_RECONNECT_INTERVAL_MS`, `CHAT_RECONNECT_MAX_ATTEMPTS`
    pub reconnect: ReconnectPolicy,

    pub typing: TypingPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:54321".to_string(),
            api_key: String::new(),
            access_token: None,
            user_id: None,
            channel_kind: ChannelKind::Public,
            history_limit: 50,
            max_content_len: 2000,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            typing: TypingPolicy::default(),
        }
    }
}

impl ChatConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("CHAT_BACKEND_URL") {
            config.backend_url = url.trim_end_matches('/').to_string();
        }

        if let Some(key) = lookup("CHAT_API_KEY") {
            config.api_key = key;
        }

        config.access_token = lookup("CHAT_ACCESS_TOKEN").filter(|t| !t.is_empty());

        if let Some(raw) = lookup("CHAT_USER_ID") {
            match raw.parse::<UserId>() {
                Ok(id) => config.user_id = Some(id),
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Invalid CHAT_USER_ID, ignoring");
                }
            }
        }

        if let Some(raw) = lookup("CHAT_CHANNEL_KIND") {
            match raw.parse::<ChannelKind>() {
                Ok(kind) => config.channel_kind = kind,
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Invalid CHAT_CHANNEL_KIND, using default");
                }
            }
        }

        if let Some(n) = parse_number::<usize, _>(&lookup, "CHAT_HISTORY_LIMIT") {
            config.history_limit = n;
        }
        if let Some(n) = parse_number::<usize, _>(&lookup, "CHAT_MAX_CONTENT_LEN") {
            config.max_content_len = n;
        }
        if let Some(ms) = parse_number(&lookup, "CHAT_SEND_TIMEOUT_MS") {
            config.retry.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_number::<u32, _>(&lookup, "CHAT_SEND_MAX_ATTEMPTS") {
            config.retry.max_attempts = n.max(1);
        }
        if let Some(ms) = parse_number(&lookup, "CHAT_SEND_BASE_DELAY_MS") {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(&lookup, "CHAT_RECONNECT_INTERVAL_MS") {
            config.reconnect.interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_number::<u32, _>(&lookup, "CHAT_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts = n.max(1);
        }

        config
    }

    /// WebSocket endpoint of the realtime feed
    pub fn realtime_url(&self) -> String {
        let base = if let Some(rest) = self.backend_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.backend_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.backend_url.clone()
        };
        format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", base, self.api_key)
    }
}

/// Parse a numeric variable; out-of-range values count as invalid
fn parse_number<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Invalid number, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ChatConfig::from_lookup(|_| None);
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect.interval, Duration::from_secs(5));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.typing.ttl, Duration::from_secs(10));
        assert!(config.access_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let user = UserId::new();
        let user_str = user.to_string();
        let config = ChatConfig::from_lookup(lookup_from(&[
            ("CHAT_BACKEND_URL", "https://demo.example.com/"),
            ("CHAT_USER_ID", user_str.as_str()),
            ("CHAT_CHANNEL_KIND", "private"),
            ("CHAT_SEND_MAX_ATTEMPTS", "5"),
            ("CHAT_RECONNECT_INTERVAL_MS", "250"),
        ]));
        assert_eq!(config.backend_url, "https://demo.example.com");
        assert_eq!(config.user_id, Some(user));
        assert_eq!(config.channel_kind, ChannelKind::Private);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.reconnect.interval, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ChatConfig::from_lookup(lookup_from(&[
            ("CHAT_HISTORY_LIMIT", "lots"),
            ("CHAT_USER_ID", "nobody"),
        ]));
        assert_eq!(config.history_limit, 50);
        assert!(config.user_id.is_none());
    }

    #[test]
    fn test_out_of_range_values_fall_back() {
        let config = ChatConfig::from_lookup(lookup_from(&[
            ("CHAT_SEND_MAX_ATTEMPTS", "4294967296"),
            ("CHAT_RECONNECT_MAX_ATTEMPTS", "99999999999"),
            ("CHAT_SEND_TIMEOUT_MS", "-1"),
        ]));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.retry.attempt_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_realtime_url_scheme() {
        let config = ChatConfig::from_lookup(lookup_from(&[
            ("CHAT_BACKEND_URL", "https://demo.example.com"),
            ("CHAT_API_KEY", "anon"),
        ]));
        assert_eq!(
            config.realtime_url(),
            "wss://demo.example.com/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }
}
