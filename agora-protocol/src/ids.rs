//! Identity types for the chat sync core.
//!
//! - `UserId`: opaque user identity issued by the identity provider
//! - `MessageId`: authoritative message id, or a temporary `local-` id
//! - `ClientKey`: client-minted idempotency key attached to every send
//! - `ConversationId`: group, sub-group, or canonical two-party private key
//! - `MutationKey`: BLAKE3 fingerprint of one logical mutation (dedup)

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix of temporary ids minted for optimistic messages.
pub const LOCAL_ID_PREFIX: &str = "local-";

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Opaque user identity. The core never interprets its contents.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Message identifier.
///
/// Authoritative ids come from the server and never change once assigned.
/// Temporary ids (`local-<uuid>`) exist only between an optimistic send and
/// its confirmation.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    /// Mint a fresh temporary id for an optimistic message.
    pub fn local() -> Self {
        MessageId(format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()))
    }

    /// True for temporary ids that the server has not confirmed yet.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// ClientKey
// ---------------------------------------------------------------------------

/// Idempotency key minted by the client for each send and echoed back by the
/// transport on the created message. Retries reuse the same key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(pub Uuid);

impl ClientKey {
    pub fn generate() -> Self {
        ClientKey(Uuid::new_v4())
    }
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientKey({})", &self.0.simple().to_string()[..8])
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ConversationId
// ---------------------------------------------------------------------------

/// Addressable message thread.
///
/// Private chats are keyed by both participants, sorted, so that each side
/// derives the same id: `private_between(a, b) == private_between(b, a)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationId {
    Group(String),
    SubGroup(String),
    Private(String),
}

impl ConversationId {
    pub fn group(id: impl Into<String>) -> Self {
        ConversationId::Group(id.into())
    }

    pub fn sub_group(id: impl Into<String>) -> Self {
        ConversationId::SubGroup(id.into())
    }

    /// Canonical two-party key, independent of argument order.
    pub fn private_between(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        ConversationId::Private(format!("{}_{}", first, second))
    }

    /// The raw key without the kind prefix, as used for push-room names.
    pub fn key(&self) -> &str {
        match self {
            ConversationId::Group(id)
            | ConversationId::SubGroup(id)
            | ConversationId::Private(id) => id,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            ConversationId::Group(_) => "group",
            ConversationId::SubGroup(_) => "sub_group",
            ConversationId::Private(_) => "private",
        }
    }
}

impl fmt::Debug for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationId({}:{})", self.kind_str(), self.key())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind_str(), self.key())
    }
}

// ---------------------------------------------------------------------------
// MutationKey
// ---------------------------------------------------------------------------

/// Fingerprint of one logical mutation: BLAKE3(domain || target || canonical bytes).
///
/// Two deliveries of the same event (command response and push broadcast)
/// produce the same key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationKey(pub [u8; 32]);

impl MutationKey {
    pub fn derive(target: &str, canonical: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"AGORA-MUT");
        hasher.update(&(target.len() as u64).to_le_bytes());
        hasher.update(target.as_bytes());
        hasher.update(canonical);
        MutationKey(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MutationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MutationKey({}..)", &self.to_hex()[..12])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
