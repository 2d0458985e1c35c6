//! Partial message updates.
//!
//! A `MessagePatch` is what a `message_patched` push event, a command
//! response, or an optimistic local action carries. Every field is optional;
//! absent fields leave the message untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::message::{Message, MessageBody, Reactions};

/// One user's reaction set to an explicit state. Applying it twice is harmless.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReactionDelta {
    pub user: UserId,
    pub emoji: String,
    pub present: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MessagePatch {
    /// New body (edit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<MessageBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    /// Full authoritative reaction map; replaces the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Reactions>,
    /// Single-user reaction change, applied after `reactions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<ReactionDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    /// Hide the message for this viewer only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_for: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

impl MessagePatch {
    pub fn edit(body: MessageBody, edited_at: DateTime<Utc>) -> Self {
        MessagePatch {
            body: Some(body),
            edited_at: Some(edited_at),
            ..Default::default()
        }
    }

    pub fn reaction(user: UserId, emoji: impl Into<String>, present: bool) -> Self {
        MessagePatch {
            reaction: Some(ReactionDelta {
                user,
                emoji: emoji.into(),
                present,
            }),
            ..Default::default()
        }
    }

    pub fn reactions(reactions: Reactions) -> Self {
        MessagePatch {
            reactions: Some(reactions),
            ..Default::default()
        }
    }

    pub fn pinned(pinned: bool) -> Self {
        MessagePatch {
            pinned: Some(pinned),
            ..Default::default()
        }
    }

    pub fn hide_for(viewer: UserId) -> Self {
        MessagePatch {
            hide_for: Some(viewer),
            ..Default::default()
        }
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }

    /// True if the patch touches content that a tombstone freezes.
    pub fn touches_content(&self) -> bool {
        self.body.is_some()
            || self.reactions.is_some()
            || self.reaction.is_some()
            || matches!(self.pinned, Some(true))
    }

    pub(crate) fn is_hide_only(&self) -> bool {
        self.hide_for.is_some()
            && self.body.is_none()
            && self.reactions.is_none()
            && self.reaction.is_none()
            && self.pinned.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_none()
            && self.edited_at.is_none()
            && self.reactions.is_none()
            && self.reaction.is_none()
            && self.pinned.is_none()
            && self.hide_for.is_none()
    }

    /// Apply onto `msg` without any store-level checks. Returns whether the
    /// message changed. Edits push the replaced body into the edit history.
    pub fn apply_to(&self, msg: &mut Message, history_cap: usize) -> bool {
        let before = msg.clone();

        if let Some(body) = &self.body {
            if *body != msg.body {
                let replaced_at = self.edited_at.unwrap_or(msg.created_at);
                msg.edit_history.push(crate::message::EditRecord {
                    body: std::mem::replace(&mut msg.body, body.clone()),
                    replaced_at,
                });
                if msg.edit_history.len() > history_cap {
                    let excess = msg.edit_history.len() - history_cap;
                    msg.edit_history.drain(..excess);
                }
            }
        }
        if let Some(edited_at) = self.edited_at {
            msg.edited_at = Some(edited_at);
        }
        if let Some(reactions) = &self.reactions {
            msg.reactions = reactions
                .iter()
                .filter(|(_, users)| !users.is_empty())
                .map(|(emoji, users)| (emoji.clone(), users.clone()))
                .collect();
        }
        if let Some(delta) = &self.reaction {
            msg.set_reaction(&delta.user, &delta.emoji, delta.present);
        }
        if let Some(pinned) = self.pinned {
            msg.pinned = pinned;
        }
        if let Some(viewer) = &self.hide_for {
            msg.hidden_for.insert(viewer.clone());
        }
        if let Some(revision) = self.revision {
            msg.revision = Some(msg.revision.map_or(revision, |r| r.max(revision)));
        }

        *msg != before
    }
}
