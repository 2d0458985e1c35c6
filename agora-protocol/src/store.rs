//! Message store: the local collection of messages for one conversation.
//!
//! Entries are keyed by `MessageId` and indexed by `(created_at, id)` so the
//! list is always in conversation order regardless of arrival order.
//!
//! - `upsert` is idempotent by id; latest non-null fields win, receipt and
//!   hidden sets only grow, and a tombstone stays a tombstone.
//! - `patch` reports `NotFound` for unknown ids and `Conflict` for content
//!   changes on tombstones instead of failing hard.
//! - Every mutation records a `StoreChange` for the presentation layer.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

use crate::ids::{ClientKey, ConversationId, MessageId, UserId};
use crate::limits::MAX_EDIT_HISTORY;
use crate::message::{Message, MessageBody, PendingAction, SyncState};
use crate::patch::MessagePatch;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    #[error("Message {0} was deleted for everyone")]
    Conflict(MessageId),

    #[error("Message {id} belongs to {actual}, store holds {expected}")]
    WrongConversation {
        id: MessageId,
        expected: ConversationId,
        actual: ConversationId,
    },
}

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreChange {
    Inserted(MessageId),
    Updated(MessageId),
    /// A temporary entry was replaced by its authoritative counterpart.
    Replaced { from: MessageId, to: MessageId },
    /// Hidden for one viewer only.
    Hidden { id: MessageId, viewer: UserId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

type OrderKey = (DateTime<Utc>, MessageId);

// ---------------------------------------------------------------------------
// MessageStore
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct MessageStore {
    conversation_id: ConversationId,
    messages: HashMap<MessageId, Message>,
    order: BTreeSet<OrderKey>,
    changes: Vec<StoreChange>,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId) -> Self {
        MessageStore {
            conversation_id,
            messages: HashMap::new(),
            order: BTreeSet::new(),
            changes: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Total message count (including tombstones and hidden entries).
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    /// All messages in ascending `created_at` order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> + '_ {
        self.order.iter().filter_map(move |(_, id)| self.messages.get(id))
    }

    /// All messages in ascending `created_at` order.
    pub fn list(&self) -> Vec<&Message> {
        self.iter().collect()
    }

    /// What `viewer` sees: everything except messages they deleted for themselves.
    /// Tombstones stay visible (with the placeholder body).
    pub fn list_visible(&self, viewer: &UserId) -> Vec<&Message> {
        self.iter().filter(|m| !m.is_hidden_for(viewer)).collect()
    }

    /// Currently pinned messages, newest first, at most `limit`.
    pub fn pinned(&self, limit: usize) -> Vec<&Message> {
        self.order
            .iter()
            .rev()
            .filter_map(|(_, id)| self.messages.get(id))
            .filter(|m| m.pinned && !m.deleted_for_everyone)
            .take(limit)
            .collect()
    }

    pub fn latest_created_at(&self) -> Option<DateTime<Utc>> {
        self.order.iter().next_back().map(|(at, _)| *at)
    }

    /// Take all change notifications recorded since the last drain.
    pub fn drain_changes(&mut self) -> Vec<StoreChange> {
        std::mem::take(&mut self.changes)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Insert or merge a message. Idempotent by id.
    pub fn upsert(&mut self, message: Message) -> Result<UpsertOutcome, StoreError> {
        self.check_conversation(&message)?;

        let id = message.id.clone();
        match self.messages.get_mut(&id) {
            None => {
                self.order.insert(message.order_key());
                self.messages.insert(id.clone(), message);
                self.changes.push(StoreChange::Inserted(id));
                Ok(UpsertOutcome::Inserted)
            }
            Some(existing) => {
                let old_key = existing.order_key();
                let changed = merge_authoritative(existing, message);
                let new_key = existing.order_key();
                if old_key != new_key {
                    self.order.remove(&old_key);
                    self.order.insert(new_key);
                }
                if changed {
                    self.changes.push(StoreChange::Updated(id));
                    Ok(UpsertOutcome::Updated)
                } else {
                    Ok(UpsertOutcome::Unchanged)
                }
            }
        }
    }

    /// Apply a partial update. Returns `Ok(false)` if nothing changed
    /// (duplicate, or a stale revision).
    pub fn patch(&mut self, id: &MessageId, patch: &MessagePatch) -> Result<bool, StoreError> {
        let msg = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if msg.deleted_for_everyone && patch.touches_content() {
            return Err(StoreError::Conflict(id.clone()));
        }

        if let (Some(incoming), Some(current)) = (patch.revision, msg.revision) {
            if incoming <= current {
                log::debug!("Stale patch for {} (rev {} <= {})", id, incoming, current);
                return Ok(false);
            }
        }

        let changed = patch.apply_to(msg, MAX_EDIT_HISTORY);
        if changed {
            match &patch.hide_for {
                Some(viewer) if patch.is_hide_only() => self.changes.push(StoreChange::Hidden {
                    id: id.clone(),
                    viewer: viewer.clone(),
                }),
                _ => self.changes.push(StoreChange::Updated(id.clone())),
            }
        }
        Ok(changed)
    }

    /// Hide a message for one viewer. Other viewers are unaffected.
    pub fn remove_for_viewer(&mut self, id: &MessageId, viewer: &UserId) -> Result<bool, StoreError> {
        self.patch(id, &MessagePatch::hide_for(viewer.clone()))
    }

    /// Delete for everyone. Idempotent: `Ok(false)` if already a tombstone.
    pub fn tombstone(&mut self, id: &MessageId) -> Result<bool, StoreError> {
        let msg = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if msg.deleted_for_everyone {
            return Ok(false);
        }
        msg.tombstone();
        self.changes.push(StoreChange::Updated(id.clone()));
        Ok(true)
    }

    /// Record `reader` as having read every message from other senders created
    /// at or before `up_to` (all messages when `None`). Returns how many changed.
    pub fn mark_read(&mut self, reader: &UserId, up_to: Option<DateTime<Utc>>) -> usize {
        self.add_receipts(reader, up_to, true)
    }

    /// Same as `mark_read`, for delivery receipts.
    pub fn mark_delivered(&mut self, recipient: &UserId, up_to: Option<DateTime<Utc>>) -> usize {
        self.add_receipts(recipient, up_to, false)
    }

    fn add_receipts(&mut self, user: &UserId, up_to: Option<DateTime<Utc>>, read: bool) -> usize {
        let mut changed = 0;
        for (at, id) in &self.order {
            if up_to.is_some_and(|limit| *at > limit) {
                break;
            }
            let Some(msg) = self.messages.get_mut(id) else {
                continue;
            };
            if msg.sender.id == *user || msg.id.is_local() {
                continue;
            }
            if msg.add_receipt(user, read) {
                changed += 1;
                self.changes.push(StoreChange::Updated(id.clone()));
            }
        }
        changed
    }

    /// Replace a temporary entry with its authoritative counterpart.
    ///
    /// If the authoritative id is already present (a push event won the race)
    /// the two are merged; replies pointing at the temporary id are rewritten.
    pub fn confirm_local(
        &mut self,
        local_id: &MessageId,
        mut authoritative: Message,
    ) -> Result<MessageId, StoreError> {
        self.check_conversation(&authoritative)?;
        let local = self
            .messages
            .remove(local_id)
            .ok_or_else(|| StoreError::NotFound(local_id.clone()))?;
        self.order.remove(&local.order_key());

        if authoritative.client_key.is_none() {
            authoritative.client_key = local.client_key;
        }
        if authoritative.reply_to.is_none() {
            authoritative.reply_to = local.reply_to.clone();
        }
        authoritative.sync = SyncState::Synced;
        let new_id = authoritative.id.clone();

        match self.messages.get_mut(&new_id) {
            Some(existing) => {
                let old_key = existing.order_key();
                merge_authoritative(existing, authoritative);
                existing.sync = SyncState::Synced;
                let new_key = existing.order_key();
                if old_key != new_key {
                    self.order.remove(&old_key);
                    self.order.insert(new_key);
                }
            }
            None => {
                self.order.insert(authoritative.order_key());
                self.messages.insert(new_id.clone(), authoritative);
            }
        }

        for msg in self.messages.values_mut() {
            if let Some(reply) = msg.reply_to.as_mut() {
                if reply.id == *local_id {
                    reply.id = new_id.clone();
                }
            }
        }

        self.changes.push(StoreChange::Replaced {
            from: local_id.clone(),
            to: new_id.clone(),
        });
        Ok(new_id)
    }

    /// Set the local sync state of a message.
    pub fn set_sync(&mut self, id: &MessageId, sync: SyncState) -> Result<(), StoreError> {
        let msg = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if msg.sync != sync {
            msg.sync = sync;
            self.changes.push(StoreChange::Updated(id.clone()));
        }
        Ok(())
    }

    /// Overwrite an entry wholesale. Used by the reconciler to publish a
    /// recomputed overlay (including rollbacks, which may undo a tombstone
    /// that was only ever optimistic).
    pub(crate) fn replace_entry(&mut self, message: Message) {
        let id = message.id.clone();
        if let Some(old) = self.messages.get(&id) {
            if *old == message && old.sync == message.sync {
                return;
            }
            self.order.remove(&old.order_key());
        }
        self.order.insert(message.order_key());
        let inserted = self.messages.insert(id.clone(), message).is_none();
        self.changes.push(if inserted {
            StoreChange::Inserted(id)
        } else {
            StoreChange::Updated(id)
        });
    }

    // -----------------------------------------------------------------------
    // Lookups used by optimistic-send matching
    // -----------------------------------------------------------------------

    /// Find an unconfirmed local entry carrying `key`.
    pub fn find_local_by_client_key(&self, key: &ClientKey) -> Option<&MessageId> {
        self.messages
            .values()
            .find(|m| m.id.is_local() && m.client_key.as_ref() == Some(key))
            .map(|m| &m.id)
    }

    /// Fallback match for transports that do not echo the client key: same
    /// sender, same body, created within `window_ms`. The closest candidate
    /// wins.
    pub fn find_local_by_content(
        &self,
        sender: &UserId,
        body: &MessageBody,
        created_at: DateTime<Utc>,
        window_ms: i64,
    ) -> Option<&MessageId> {
        self.messages
            .values()
            .filter(|m| m.id.is_local() && m.sender.id == *sender && m.body == *body)
            .filter(|m| {
                matches!(
                    m.sync,
                    SyncState::Pending(PendingAction::Send) | SyncState::Failed(PendingAction::Send)
                )
            })
            .map(|m| (m, (m.created_at - created_at).num_milliseconds().abs()))
            .filter(|(_, delta)| *delta <= window_ms)
            .min_by_key(|(_, delta)| *delta)
            .map(|(m, _)| &m.id)
    }

    fn check_conversation(&self, message: &Message) -> Result<(), StoreError> {
        if message.conversation_id != self.conversation_id {
            return Err(StoreError::WrongConversation {
                id: message.id.clone(),
                expected: self.conversation_id.clone(),
                actual: message.conversation_id.clone(),
            });
        }
        Ok(())
    }
}

/// Merge an authoritative copy into an existing entry. Returns whether
/// anything changed.
pub(crate) fn merge_authoritative(existing: &mut Message, incoming: Message) -> bool {
    let before = existing.clone();

    let stale = matches!(
        (incoming.revision, existing.revision),
        (Some(new), Some(cur)) if new < cur
    );

    existing.hidden_for.extend(incoming.hidden_for);
    existing.delivered_to.extend(incoming.delivered_to);
    existing.read_by.extend(incoming.read_by);
    if existing.client_key.is_none() {
        existing.client_key = incoming.client_key;
    }

    if existing.deleted_for_everyone || incoming.deleted_for_everyone {
        existing.tombstone();
    } else if !stale {
        existing.sender.name = incoming.sender.name;
        if incoming.sender.avatar.is_some() {
            existing.sender.avatar = incoming.sender.avatar;
        }
        existing.body = incoming.body;
        existing.created_at = incoming.created_at;
        existing.reactions = incoming.reactions;
        existing.pinned = incoming.pinned;
        if incoming.reply_to.is_some() {
            existing.reply_to = incoming.reply_to;
        }
        if incoming.edited_at.is_some() {
            existing.edited_at = incoming.edited_at;
        }
        if !incoming.edit_history.is_empty() {
            existing.edit_history = incoming.edit_history;
        }
    }

    if let Some(rev) = incoming.revision {
        existing.revision = Some(existing.revision.map_or(rev, |cur| cur.max(rev)));
    }

    *existing != before
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
