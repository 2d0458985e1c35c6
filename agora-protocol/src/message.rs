//! Message model.
//!
//! A `Message` carries everything needed to render it without further
//! lookups: denormalized sender profile, reply snippet, reactions, receipts,
//! and its local sync state. Messages are never removed from a store; deletion
//! for everyone turns them into tombstones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::ids::{ClientKey, ConversationId, MessageId, UserId};
use crate::limits::{reply_snippet, DELETED_PLACEHOLDER};

/// Reaction map: emoji → users who reacted with it.
pub type Reactions = BTreeMap<String, BTreeSet<UserId>>;

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

/// Discriminant of `MessageBody`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Location,
    Contact,
}

/// Opaque metadata attached to media by the external uploader.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Kind-specific payload. Media URIs and structured payloads are embedded
/// exactly as produced by their senders.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Image {
        uri: String,
        #[serde(default)]
        meta: MediaMeta,
    },
    File {
        uri: String,
        #[serde(default)]
        meta: MediaMeta,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Contact {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phone: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        MessageBody::Text { text: text.into() }
    }

    /// The body every tombstone carries.
    pub fn deleted_placeholder() -> Self {
        MessageBody::text(DELETED_PLACEHOLDER)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::Image { .. } => MessageKind::Image,
            MessageBody::File { .. } => MessageKind::File,
            MessageBody::Location { .. } => MessageKind::Location,
            MessageBody::Contact { .. } => MessageKind::Contact,
        }
    }

    /// One-line textual preview, used for reply snippets.
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text { text } => reply_snippet(text),
            MessageBody::Image { meta, .. } => {
                format!("[image] {}", meta.file_name.as_deref().unwrap_or(""))
                    .trim_end()
                    .to_string()
            }
            MessageBody::File { meta, .. } => {
                format!("[file] {}", meta.file_name.as_deref().unwrap_or(""))
                    .trim_end()
                    .to_string()
            }
            MessageBody::Location { name, .. } => match name {
                Some(name) => format!("[location] {}", reply_snippet(name)),
                None => "[location]".to_string(),
            },
            MessageBody::Contact { name, .. } => format!("[contact] {}", reply_snippet(name)),
        }
    }

    /// True when the body carries nothing worth sending.
    pub fn is_blank(&self) -> bool {
        match self {
            MessageBody::Text { text } => text.trim().is_empty(),
            MessageBody::Image { uri, .. } | MessageBody::File { uri, .. } => uri.is_empty(),
            MessageBody::Location { .. } => false,
            MessageBody::Contact { name, .. } => name.trim().is_empty(),
        }
    }
}

// ---------------------------------------------------------------------------
// Supporting records
// ---------------------------------------------------------------------------

/// Sender profile captured at creation time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SenderProfile {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Flat back-reference to another message in the same conversation.
///
/// `snippet` and `sender_name` are copied at send time so the reply still
/// renders after the referenced message is deleted or scrolled out.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReplyRef {
    pub id: MessageId,
    pub snippet: String,
    pub sender_name: String,
}

impl ReplyRef {
    pub fn to_message(target: &Message) -> Self {
        ReplyRef {
            id: target.id.clone(),
            snippet: target.body.preview(),
            sender_name: target.sender.name.clone(),
        }
    }
}

/// A previous body, kept when an edit replaces it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EditRecord {
    pub body: MessageBody,
    pub replaced_at: DateTime<Utc>,
}

/// Local action that an optimistic state is waiting on (or that failed).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PendingAction {
    Send,
    React,
    Pin,
    Edit,
    DeleteForSelf,
    DeleteForEveryone,
    MarkRead,
}

impl PendingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingAction::Send => "send",
            PendingAction::React => "react",
            PendingAction::Pin => "pin",
            PendingAction::Edit => "edit",
            PendingAction::DeleteForSelf => "delete_for_self",
            PendingAction::DeleteForEveryone => "delete_for_everyone",
            PendingAction::MarkRead => "mark_read",
        }
    }
}

/// Local synchronization state of a message.
///
/// `Pending(Send)`/`Failed(Send)` mean the message itself is unconfirmed.
/// Any other action means the message is confirmed but a mutation on it is
/// in flight or was rolled back.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(tag = "state", content = "action", rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Synced,
    Pending(PendingAction),
    Failed(PendingAction),
}

impl SyncState {
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncState::Pending(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SyncState::Failed(_))
    }
}

/// Per-viewer deletion view of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionState {
    None,
    DeletedForSelf,
    DeletedForEveryone,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<ClientKey>,
    pub conversation_id: ConversationId,
    pub sender: SenderProfile,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
    #[serde(default)]
    pub reactions: Reactions,
    #[serde(default)]
    pub pinned: bool,
    /// Tombstone flag. Terminal once set.
    #[serde(default)]
    pub deleted_for_everyone: bool,
    /// Viewers who deleted this message for themselves.
    #[serde(default)]
    pub hidden_for: BTreeSet<UserId>,
    #[serde(default)]
    pub delivered_to: BTreeSet<UserId>,
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edit_history: Vec<EditRecord>,
    /// Server revision, when the transport provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    /// Local only; never trusted from the wire.
    #[serde(skip)]
    pub sync: SyncState,
}

impl Message {
    /// Build a fresh authoritative-looking message (used by transports and tests).
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender: SenderProfile,
        body: MessageBody,
        created_at: DateTime<Utc>,
    ) -> Self {
        Message {
            id,
            client_key: None,
            conversation_id,
            sender,
            body,
            created_at,
            reply_to: None,
            reactions: Reactions::new(),
            pinned: false,
            deleted_for_everyone: false,
            hidden_for: BTreeSet::new(),
            delivered_to: BTreeSet::new(),
            read_by: BTreeSet::new(),
            edited_at: None,
            edit_history: Vec::new(),
            revision: None,
            sync: SyncState::Synced,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted_for_everyone
    }

    pub fn is_edited(&self) -> bool {
        self.edited_at.is_some()
    }

    pub fn deletion_state(&self, viewer: &UserId) -> DeletionState {
        if self.deleted_for_everyone {
            DeletionState::DeletedForEveryone
        } else if self.hidden_for.contains(viewer) {
            DeletionState::DeletedForSelf
        } else {
            DeletionState::None
        }
    }

    /// Hidden from `viewer`'s list (deleted for that viewer only).
    pub fn is_hidden_for(&self, viewer: &UserId) -> bool {
        self.hidden_for.contains(viewer)
    }

    pub fn has_reacted(&self, user: &UserId, emoji: &str) -> bool {
        self.reactions
            .get(emoji)
            .map(|users| users.contains(user))
            .unwrap_or(false)
    }

    /// Turn this message into a tombstone. Idempotent.
    pub fn tombstone(&mut self) {
        self.deleted_for_everyone = true;
        self.body = MessageBody::deleted_placeholder();
        self.reactions.clear();
        self.pinned = false;
    }

    /// Add or remove a single user's reaction. Empty emoji sets are dropped.
    pub fn set_reaction(&mut self, user: &UserId, emoji: &str, present: bool) {
        if present {
            self.reactions
                .entry(emoji.to_string())
                .or_default()
                .insert(user.clone());
        } else if let Some(users) = self.reactions.get_mut(emoji) {
            users.remove(user);
            if users.is_empty() {
                self.reactions.remove(emoji);
            }
        }
    }

    /// Record a receipt from `user`. Reading implies delivery.
    pub fn add_receipt(&mut self, user: &UserId, read: bool) -> bool {
        let delivered = self.delivered_to.insert(user.clone());
        let read = read && self.read_by.insert(user.clone());
        delivered || read
    }

    /// Sort key for conversation ordering.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
