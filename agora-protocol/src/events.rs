//! Wire types exchanged with the collaborators.
//!
//! - `PushEvent`: what the push channel (or a poll) delivers
//! - `Command`: one client-issued mutation, sent to the command transport
//! - `CommandResponse`: the transport's direct answer to a command
//!
//! Commands carry the desired end state (`present`, `pinned`) rather than a
//! toggle, so retrying any of them is harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClientKey, ConversationId, MessageId, MutationKey, UserId};
use crate::message::{Message, MessageBody};
use crate::patch::MessagePatch;

// ---------------------------------------------------------------------------
// Push events
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    MessageCreated {
        message: Message,
    },
    /// Reaction, pin, or edit.
    MessagePatched {
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    },
    /// Deletion for everyone. Deletions for one viewer are never broadcast.
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    TypingChanged {
        conversation_id: ConversationId,
        user: UserId,
        #[serde(default)]
        user_name: String,
        typing: bool,
    },
    MessagesRead {
        conversation_id: ConversationId,
        reader: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_to: Option<DateTime<Utc>>,
    },
    MessagesDelivered {
        conversation_id: ConversationId,
        recipient: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_to: Option<DateTime<Utc>>,
    },
}

impl PushEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            PushEvent::MessageCreated { message } => &message.conversation_id,
            PushEvent::MessagePatched { conversation_id, .. }
            | PushEvent::MessageDeleted { conversation_id, .. }
            | PushEvent::TypingChanged { conversation_id, .. }
            | PushEvent::MessagesRead { conversation_id, .. }
            | PushEvent::MessagesDelivered { conversation_id, .. } => conversation_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PushEvent::MessageCreated { .. } => "message_created",
            PushEvent::MessagePatched { .. } => "message_patched",
            PushEvent::MessageDeleted { .. } => "message_deleted",
            PushEvent::TypingChanged { .. } => "typing_changed",
            PushEvent::MessagesRead { .. } => "messages_read",
            PushEvent::MessagesDelivered { .. } => "messages_delivered",
        }
    }

    /// Dedup fingerprint, only for events that carry a server revision.
    ///
    /// Without a revision two legitimately distinct mutations can be
    /// byte-identical (pin, unpin, pin again), so those rely on idempotent
    /// application instead.
    pub fn mutation_key(&self) -> Option<MutationKey> {
        let target = match self {
            PushEvent::MessageCreated { message } if message.revision.is_some() => {
                message.id.as_str()
            }
            PushEvent::MessagePatched {
                message_id, patch, ..
            } if patch.revision.is_some() => message_id.as_str(),
            _ => return None,
        };
        let canonical = serde_json::to_vec(self).ok()?;
        Some(MutationKey::derive(target, &canonical))
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Send {
        conversation_id: ConversationId,
        client_key: ClientKey,
        body: MessageBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },
    React {
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
        present: bool,
    },
    Pin {
        conversation_id: ConversationId,
        message_id: MessageId,
        pinned: bool,
    },
    Edit {
        conversation_id: ConversationId,
        message_id: MessageId,
        body: MessageBody,
    },
    DeleteForSelf {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    DeleteForEveryone {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MarkRead {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_to: Option<DateTime<Utc>>,
    },
    SetTyping {
        conversation_id: ConversationId,
        typing: bool,
    },
}

impl Command {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Command::Send { conversation_id, .. }
            | Command::React { conversation_id, .. }
            | Command::Pin { conversation_id, .. }
            | Command::Edit { conversation_id, .. }
            | Command::DeleteForSelf { conversation_id, .. }
            | Command::DeleteForEveryone { conversation_id, .. }
            | Command::MarkRead { conversation_id, .. }
            | Command::SetTyping { conversation_id, .. } => conversation_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Send { .. } => "send",
            Command::React { .. } => "react",
            Command::Pin { .. } => "pin",
            Command::Edit { .. } => "edit",
            Command::DeleteForSelf { .. } => "delete_for_self",
            Command::DeleteForEveryone { .. } => "delete_for_everyone",
            Command::MarkRead { .. } => "mark_read",
            Command::SetTyping { .. } => "set_typing",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandResponse {
    Created { message: Message },
    Patched { message_id: MessageId, patch: MessagePatch },
    Deleted { message_id: MessageId },
    Ack,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
