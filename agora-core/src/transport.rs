//! Collaborator boundary.
//!
//! The core never talks to a network directly. An application shell supplies
//! these traits (HTTP + WebSocket, an in-process relay, or test doubles) and
//! wires them into a `Platform`.
//!
//! Credentials are requested fresh from the `CredentialProvider` for every
//! command and every push connect; the core never caches them.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use agora_protocol::{Command, CommandResponse, ConversationId, Message, PushEvent};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Offline, timed out, or the remote end is down.
    #[error("Network unavailable: {0}")]
    Unavailable(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    /// The target is in a terminal state (deleted for everyone).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Authenticated but not allowed (e.g. deleting someone else's message).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Bearer credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Credential(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> Result<Credential, TransportError>;
}

// ---------------------------------------------------------------------------
// Request/response transports
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HistoryTransport: Send + Sync {
    /// Most recent `limit` messages, newest first.
    async fn fetch_history(
        &self,
        credential: &Credential,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, TransportError>;

    /// Most recently pinned `limit` messages, newest first.
    async fn fetch_pinned(
        &self,
        credential: &Credential,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, TransportError>;
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn execute(
        &self,
        credential: &Credential,
        command: Command,
    ) -> Result<CommandResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// Push channel
// ---------------------------------------------------------------------------

/// Room management on an open push connection.
#[async_trait]
pub trait PushControl: Send + Sync {
    async fn join(&self, conversation: &ConversationId) -> Result<(), TransportError>;
    async fn leave(&self, conversation: &ConversationId) -> Result<(), TransportError>;
    async fn disconnect(&self);
}

/// One physical push connection. The event stream ends when the connection
/// drops.
pub struct PushConnection {
    pub events: mpsc::Receiver<PushEvent>,
    pub control: Arc<dyn PushControl>,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, credential: &Credential) -> Result<PushConnection, TransportError>;
}
