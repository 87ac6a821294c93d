//! Basic type definitions for the chat core
//!
//! Provides newtype wrappers for type safety:
//! - `ChannelId`, `MessageId`, `UserId`: UUID-based identities
//! - `ChannelKind`: public/private channel scope
//! - `ChannelIdentity`: a resolved channel or a degraded local-only name

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Stable channel identity, the join key for messages and subscriptions
    ChannelId
);

uuid_id!(
    /// Globally unique message identifier
    ///
    /// Generated client-side for outgoing messages so the optimistic copy
    /// and every retry of one send share the same id.
    MessageId
);

uuid_id!(
    /// Authenticated actor / message sender
    UserId
);

/// Channel scope. Names are unique per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Public,
    Private,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Public => "public",
            ChannelKind::Private => "private",
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(ChannelKind::Public),
            "private" => Ok(ChannelKind::Private),
            other => Err(format!("unknown channel kind '{}'", other)),
        }
    }
}

/// Result of resolving a channel name
///
/// `Local` is the degraded identity used when the backend could not be
/// reached: the pipeline keeps running, but nothing is loaded, subscribed
/// or sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelIdentity {
    Resolved { id: ChannelId, name: String },
    Local(String),
}

impl ChannelIdentity {
    /// The backend id, if the channel was resolved
    pub fn id(&self) -> Option<ChannelId> {
        match self {
            ChannelIdentity::Resolved { id, .. } => Some(*id),
            ChannelIdentity::Local(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ChannelIdentity::Resolved { name, .. } => name,
            ChannelIdentity::Local(name) => name,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ChannelIdentity::Local(_))
    }
}

impl std::fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelIdentity::Resolved { id, name } => write!(f, "#{} ({})", name, id),
            ChannelIdentity::Local(name) => write!(f, "#{} (local)", name),
        }
    }
}
