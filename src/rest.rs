//! HTTP backend over the hosted REST interface
//!
//! Tables are reached at `{backend_url}/rest/v1/{table}` with PostgREST
//! style filters (`column=eq.value`). Every request carries the public API
//! key and, when signed in, the session token as a bearer credential.
//! Failures are folded into [`ChatError`] so retry and presentation logic
//! never see transport details.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{AuthProvider, ChatBackend, ProfileStore};
use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::message::{
    Channel, MessageRow, NewChannel, NewMessage, SenderProfile, SentReceipt, TypingRecord,
};
use crate::types::{ChannelId, ChannelKind, MessageId, UserId};

/// Row-level security rejected the write
const PG_INSUFFICIENT_PRIVILEGE: &str = "42501";
/// A policy references its own table
const PG_INFINITE_RECURSION: &str = "42P17";
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Error body returned by the REST layer
#[derive(Debug, Default, Deserialize)]
struct ApiError {
    code: Option<String>,
    message: Option<String>,
}

/// `profiles` table row
#[derive(Debug, Deserialize)]
struct ProfileRow {
    id: UserId,
    display_name: Option<String>,
    username: Option<String>,
    avatar_url: Option<String>,
}

impl From<ProfileRow> for SenderProfile {
    fn from(row: ProfileRow) -> Self {
        let display_name = row
            .display_name
            .or(row.username)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string());
        Self {
            id: row.id,
            display_name,
            avatar_ref: row.avatar_url,
        }
    }
}

#[derive(Debug, Serialize)]
struct SoftDelete {
    is_deleted: bool,
}

/// Map a non-success response to the error taxonomy
///
/// Database error codes win over the HTTP status: the REST layer reports
/// an RLS rejection as 401 or 403 depending on whether a token was sent.
pub fn classify_status(status: StatusCode, body: &str, budget: Duration) -> ChatError {
    let api: ApiError = serde_json::from_str(body).unwrap_or_default();
    let message = api
        .message
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());

    match (api.code.as_deref(), status.as_u16()) {
        (Some(PG_INSUFFICIENT_PRIVILEGE), _) | (_, 403) => ChatError::Permission(message),
        (Some(PG_INFINITE_RECURSION), _) => ChatError::Config(message),
        (Some(PG_UNIQUE_VIOLATION), _) | (_, 409) => ChatError::Conflict,
        (_, 401) => ChatError::Auth,
        (_, 404) => ChatError::Config(format!("missing table or route: {}", message)),
        (_, 408) | (_, 504) => ChatError::Timeout(budget),
        (_, 500..=599) => ChatError::Network(message),
        (_, 400..=499) => ChatError::Validation(message),
        _ => ChatError::Protocol(format!("unexpected status {}", status)),
    }
}

/// Map a failure to get any response at all
pub fn classify_transport(error: &reqwest::Error, budget: Duration) -> ChatError {
    if error.is_timeout() {
        ChatError::Timeout(budget)
    } else if error.is_decode() {
        ChatError::Protocol(error.to_string())
    } else {
        ChatError::Network(error.to_string())
    }
}

/// Relational backend reached over HTTP
#[derive(Debug, Clone)]
pub struct RestBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    user_id: Option<UserId>,
    timeout: Duration,
}

impl RestBackend {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeouts.query)
            .build()
            .map_err(|e| ChatError::Config(format!("HTTP client: {}", e)))?;
        if HeaderValue::from_str(&config.api_key).is_err() {
            return Err(ChatError::Config("API key is not a valid header value".to_string()));
        }

        Ok(Self {
            http,
            base_url: config.backend_url.clone(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
            user_id: config.user_id,
            timeout: config.timeouts.query,
        })
    }

    /// Auth provider sharing this backend's HTTP client and credentials
    pub fn session_auth(&self) -> SessionAuth {
        SessionAuth {
            backend: self.clone(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.timeout))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = classify_status(status, &body, self.timeout);
        debug!(%status, "Request failed: {}", error);
        Err(error)
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        self.execute(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ChatError::Protocol(e.to_string()))
    }

    /// POST a row and read the stored representation back
    async fn insert_returning<B, T>(&self, table: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let builder = self
            .request(Method::POST, self.table_url(table))
            .header("Prefer", "return=representation")
            .json(body);
        let mut rows: Vec<T> = self.fetch(builder).await?;
        if rows.is_empty() {
            return Err(ChatError::Protocol(format!("insert into {} returned no row", table)));
        }
        Ok(rows.swap_remove(0))
    }
}

#[async_trait]
impl ChatBackend for RestBackend {
    async fn find_channel(&self, name: &str, kind: ChannelKind) -> Result<Option<Channel>> {
        let builder = self.request(Method::GET, self.table_url("channels")).query(&[
            ("select", "*".to_string()),
            ("name", format!("eq.{}", name)),
            ("type", format!("eq.{}", kind.as_str())),
            ("limit", "1".to_string()),
        ]);
        let rows: Vec<Channel> = self.fetch(builder).await?;
        Ok(rows.into_iter().next())
    }

    async fn create_channel(&self, channel: &NewChannel) -> Result<Channel> {
        self.insert_returning("channels", channel).await
    }

    async fn load_messages(&self, channel_id: ChannelId, limit: usize) -> Result<Vec<MessageRow>> {
        let builder = self.request(Method::GET, self.table_url("messages")).query(&[
            ("select", "*".to_string()),
            ("channel_id", format!("eq.{}", channel_id)),
            ("is_deleted", "eq.false".to_string()),
            ("order", "created_at.desc".to_string()),
            ("limit", limit.to_string()),
        ]);
        self.fetch(builder).await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<SentReceipt> {
        let row: MessageRow = self.insert_returning("messages", message).await?;
        Ok(SentReceipt {
            id: row.id,
            created_at: row.created_at,
        })
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<MessageRow>> {
        let builder = self.request(Method::GET, self.table_url("messages")).query(&[
            ("select", "*".to_string()),
            ("id", format!("eq.{}", id)),
            ("limit", "1".to_string()),
        ]);
        let rows: Vec<MessageRow> = self.fetch(builder).await?;
        Ok(rows.into_iter().next())
    }

    async fn soft_delete_message(&self, id: MessageId) -> Result<()> {
        let builder = self
            .request(Method::PATCH, self.table_url("messages"))
            .query(&[("id", format!("eq.{}", id))])
            .json(&SoftDelete { is_deleted: true });
        self.execute(builder).await?;
        Ok(())
    }

    async fn upsert_typing(&self, record: &TypingRecord) -> Result<()> {
        let builder = self
            .request(Method::POST, self.table_url("typing_indicators"))
            .query(&[("on_conflict", "channel_id,user_id")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(record);
        self.execute(builder).await?;
        Ok(())
    }

    async fn clear_typing(&self, channel_id: ChannelId, user_id: UserId) -> Result<()> {
        let builder = self
            .request(Method::DELETE, self.table_url("typing_indicators"))
            .query(&[
                ("channel_id", format!("eq.{}", channel_id)),
                ("user_id", format!("eq.{}", user_id)),
            ]);
        self.execute(builder).await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for RestBackend {
    async fn get_profile(&self, id: UserId) -> Result<Option<SenderProfile>> {
        let builder = self.request(Method::GET, self.table_url("profiles")).query(&[
            ("select", "id,display_name,username,avatar_url".to_string()),
            ("id", format!("eq.{}", id)),
            ("limit", "1".to_string()),
        ]);
        let rows: Vec<ProfileRow> = self.fetch(builder).await?;
        Ok(rows.into_iter().next().map(SenderProfile::from))
    }
}

/// Session-token auth checked against the auth service
#[derive(Debug, Clone)]
pub struct SessionAuth {
    backend: RestBackend,
}

#[async_trait]
impl AuthProvider for SessionAuth {
    fn current_user(&self) -> Option<UserId> {
        self.backend.access_token.as_ref().and(self.backend.user_id)
    }

    async fn session_valid(&self) -> bool {
        if self.current_user().is_none() {
            return false;
        }
        let url = format!("{}/auth/v1/user", self.backend.base_url);
        match self.backend.execute(self.backend.request(Method::GET, url)).await {
            Ok(_) => true,
            Err(ChatError::Auth) | Err(ChatError::Permission(_)) => {
                warn!("Session token rejected");
                false
            }
            Err(e) => {
                // Can't tell while the auth service is unreachable; let the write decide
                debug!("Session check inconclusive: {}", e);
                true
            }
        }
    }
}
