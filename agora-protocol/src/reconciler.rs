/// Event reconciler: the single entry point for every mutation of a
/// conversation's `MessageStore`.
///
/// Three sources feed it: direct command responses, push events, and poll
/// snapshots. Each logical mutation takes effect once regardless of how many
/// of them deliver it:
///
/// - events carrying a server revision are fingerprinted (target id + BLAKE3
///   of the canonical encoding) into an LRU cache and dropped on repeat
/// - reactions, pins, and deletions are explicit set/flag writes, so a repeat
///   without a revision is a no-op anyway
/// - creation is matched against optimistic entries by client key, falling
///   back to sender + body + time window
///
/// Local actions go through `begin_*`, which applies an optimistic overlay
/// and hands back a `Dispatch` (ticket + command). The caller performs the
/// network call without holding the reconciler and reports back with
/// `complete` or `fail`.
///
/// **Overlay invariant:** for a message with commands in flight the visible
/// entry is always `base` (last authoritative state) with the pending local
/// ops replayed on top, so an authoritative update never erases a pending
/// action and a rollback restores exactly the authoritative state.

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use thiserror::Error;

use crate::events::{Command, CommandResponse, PushEvent};
use crate::ids::{ClientKey, ConversationId, MessageId, MutationKey, UserId};
use crate::limits::{
    DEDUP_CACHE_CAPACITY, HEURISTIC_MATCH_WINDOW_MS, MAX_EDIT_HISTORY, MAX_INFLIGHT_PER_MESSAGE,
};
use crate::message::{
    Message, MessageBody, MessageKind, PendingAction, ReplyRef, SenderProfile, SyncState,
};
use crate::patch::MessagePatch;
use crate::store::{merge_authoritative, MessageStore, StoreChange, StoreError, UpsertOutcome};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown command ticket: {0}")]
    UnknownTicket(u64),

    #[error("Event targets {actual}, reconciler holds {expected}")]
    WrongConversation {
        expected: ConversationId,
        actual: ConversationId,
    },

    #[error("Only the author can edit message {0}")]
    NotAuthor(MessageId),

    #[error("Message {0} cannot be edited")]
    NotEditable(MessageId),

    #[error("Edit would leave message {0} empty")]
    EmptyEdit(MessageId),

    #[error("Message body is empty")]
    EmptyMessage,

    #[error("Reaction emoji is empty")]
    EmptyEmoji,

    #[error("Message {0} is not confirmed yet")]
    NotConfirmed(MessageId),

    #[error("Message {0} is not a failed send")]
    NotRetryable(MessageId),

    #[error("Too many commands in flight for message {0}")]
    TooManyInFlight(MessageId),

    #[error("Unexpected response to {0} command")]
    UnexpectedResponse(&'static str),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Entries kept in the duplicate-mutation cache.
    pub dedup_capacity: usize,
    /// Window for matching an uncorrelated push-created message to a local send.
    pub match_window_ms: i64,
    /// Fall back to sender + body + time matching when no client key is echoed.
    pub content_matching: bool,
    pub max_inflight_per_message: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            dedup_capacity: DEDUP_CACHE_CAPACITY,
            match_window_ms: HEURISTIC_MATCH_WINDOW_MS,
            content_matching: true,
            max_inflight_per_message: MAX_INFLIGHT_PER_MESSAGE,
        }
    }
}

// ---------------------------------------------------------------------------
// Public bookkeeping types
// ---------------------------------------------------------------------------

/// Handle for one in-flight command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Where an incoming mutation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSource {
    Command,
    Push,
    Poll,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
    /// Seen before (dedup cache hit).
    Duplicate,
    /// Not a store mutation, or a remote change to a tombstone.
    Ignored,
    /// Targets a message the store does not hold; callers should refetch.
    Missing(MessageId),
}

/// A local action ready to be sent: call the command transport with
/// `command`, then report back with `complete(ticket, ..)` or `fail(ticket)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Dispatch {
    pub ticket: Ticket,
    /// The message the action targets (the temporary id for sends).
    pub message_id: Option<MessageId>,
    pub command: Command,
}

// ---------------------------------------------------------------------------
// Overlays
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum LocalOp {
    Patch(MessagePatch),
    Tombstone,
}

impl LocalOp {
    fn apply(&self, msg: &mut Message) {
        match self {
            LocalOp::Patch(patch) => {
                if !(msg.deleted_for_everyone && patch.touches_content()) {
                    patch.apply_to(msg, MAX_EDIT_HISTORY);
                }
            }
            LocalOp::Tombstone => msg.tombstone(),
        }
    }
}

#[derive(Clone, Debug)]
struct PendingOp {
    ticket: Ticket,
    action: PendingAction,
    op: LocalOp,
}

/// `base.sync` holds the resting state (`Synced` or `Failed`) shown once no
/// op is pending.
#[derive(Clone, Debug)]
struct Overlay {
    base: Message,
    ops: Vec<PendingOp>,
}

#[derive(Clone, Debug)]
enum InFlight {
    Send { local_id: MessageId },
    Mutation { message_id: MessageId },
    MarkRead,
}

fn is_stale(incoming: Option<u64>, current: Option<u64>) -> bool {
    matches!((incoming, current), (Some(new), Some(cur)) if new <= cur)
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    viewer: UserId,
    config: ReconcilerConfig,
    store: MessageStore,
    seen: LruCache<MutationKey, ()>,
    overlays: HashMap<MessageId, Overlay>,
    inflight: HashMap<Ticket, InFlight>,
    next_ticket: u64,
}

impl Reconciler {
    pub fn new(conversation_id: ConversationId, viewer: UserId, config: ReconcilerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        Reconciler {
            viewer,
            store: MessageStore::new(conversation_id),
            seen: LruCache::new(capacity),
            overlays: HashMap::new(),
            inflight: HashMap::new(),
            next_ticket: 1,
            config,
        }
    }

    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    pub fn conversation_id(&self) -> &ConversationId {
        self.store.conversation_id()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.store.get(id)
    }

    /// The viewer's list, ascending.
    pub fn visible(&self) -> Vec<&Message> {
        self.store.list_visible(&self.viewer)
    }

    pub fn drain_changes(&mut self) -> Vec<StoreChange> {
        self.store.drain_changes()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    // -----------------------------------------------------------------------
    // Remote input
    // -----------------------------------------------------------------------

    /// Apply one push (or poll-derived) event.
    pub fn apply_event(
        &mut self,
        source: EventSource,
        event: PushEvent,
    ) -> Result<ApplyOutcome, ReconcileError> {
        self.check_conversation(event.conversation_id())?;

        let key = event.mutation_key();
        if let Some(key) = &key {
            if self.seen.contains(key) {
                log::debug!(
                    "Duplicate {} from {:?} dropped ({})",
                    event.type_name(),
                    source,
                    &key.to_hex()[..16]
                );
                return Ok(ApplyOutcome::Duplicate);
            }
        }

        let kind = event.type_name();
        let outcome = match event {
            PushEvent::MessageCreated { message } => self.ingest(message)?,
            PushEvent::MessagePatched {
                message_id, patch, ..
            } => self.apply_patch(&message_id, &patch),
            PushEvent::MessageDeleted { message_id, .. } => self.apply_tombstone(&message_id),
            PushEvent::TypingChanged { .. } => ApplyOutcome::Ignored,
            PushEvent::MessagesRead { reader, up_to, .. } => {
                self.apply_receipts(&reader, up_to, true)
            }
            PushEvent::MessagesDelivered {
                recipient, up_to, ..
            } => self.apply_receipts(&recipient, up_to, false),
        };

        if let Some(key) = key {
            self.seen.put(key, ());
        }
        log::debug!("{} from {:?}: {:?}", kind, source, outcome);
        Ok(outcome)
    }

    /// Merge a history page. Pages arrive newest first; they are applied in
    /// conversation order. Messages for another conversation are skipped.
    pub fn apply_snapshot(
        &mut self,
        source: EventSource,
        mut messages: Vec<Message>,
    ) -> Result<usize, ReconcileError> {
        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        let mut applied = 0;
        for message in messages {
            if message.conversation_id != *self.conversation_id() {
                log::warn!(
                    "⚠️  Snapshot entry {} belongs to {}, skipped",
                    message.id,
                    message.conversation_id
                );
                continue;
            }
            if self.ingest(message)? == ApplyOutcome::Applied {
                applied += 1;
            }
        }
        log::debug!("Snapshot from {:?}: {} applied", source, applied);
        Ok(applied)
    }

    /// Reconcile the pinned view against an authoritative pinned page.
    ///
    /// Every returned message is upserted. When the page is not full, local
    /// entries flagged pinned but absent from it are unpinned.
    pub fn apply_pinned(
        &mut self,
        pinned: Vec<Message>,
        limit: usize,
    ) -> Result<usize, ReconcileError> {
        let complete = pinned.len() < limit;
        let returned: Vec<MessageId> = pinned.iter().map(|m| m.id.clone()).collect();
        let mut applied = self.apply_snapshot(EventSource::Poll, pinned)?;

        if complete {
            let stale: Vec<MessageId> = self
                .store
                .iter()
                .filter(|m| m.pinned && !returned.contains(&m.id))
                .map(|m| m.id.clone())
                .collect();
            for id in stale {
                if self.apply_patch(&id, &MessagePatch::pinned(false)) == ApplyOutcome::Applied {
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    fn ingest(&mut self, message: Message) -> Result<ApplyOutcome, ReconcileError> {
        if self.store.contains(&message.id) {
            return self.merge_existing(message);
        }
        if let Some(local_id) = self.match_local(&message) {
            self.confirm(&local_id, message)?;
            return Ok(ApplyOutcome::Applied);
        }
        self.store.upsert(message)?;
        Ok(ApplyOutcome::Applied)
    }

    fn merge_existing(&mut self, message: Message) -> Result<ApplyOutcome, ReconcileError> {
        let id = message.id.clone();
        if let Some(overlay) = self.overlays.get_mut(&id) {
            let changed = merge_authoritative(&mut overlay.base, message);
            self.publish(&id);
            return Ok(if changed {
                ApplyOutcome::Applied
            } else {
                ApplyOutcome::Unchanged
            });
        }
        Ok(match self.store.upsert(message)? {
            UpsertOutcome::Unchanged => ApplyOutcome::Unchanged,
            UpsertOutcome::Inserted | UpsertOutcome::Updated => ApplyOutcome::Applied,
        })
    }

    fn match_local(&self, message: &Message) -> Option<MessageId> {
        if let Some(key) = &message.client_key {
            return self.store.find_local_by_client_key(key).cloned();
        }
        if !self.config.content_matching || message.sender.id != self.viewer {
            return None;
        }
        self.store
            .find_local_by_content(
                &message.sender.id,
                &message.body,
                message.created_at,
                self.config.match_window_ms,
            )
            .cloned()
    }

    fn confirm(&mut self, local_id: &MessageId, message: Message) -> Result<(), ReconcileError> {
        let id = message.id.clone();
        let overlaid = match self.overlays.get_mut(&id) {
            Some(overlay) => {
                merge_authoritative(&mut overlay.base, message.clone());
                true
            }
            None => false,
        };
        self.store.confirm_local(local_id, message)?;
        if overlaid {
            self.publish(&id);
        }
        log::info!("✓ Send confirmed: {} -> {}", local_id, id);
        Ok(())
    }

    fn apply_patch(&mut self, id: &MessageId, patch: &MessagePatch) -> ApplyOutcome {
        if let Some(overlay) = self.overlays.get_mut(id) {
            if overlay.base.deleted_for_everyone && patch.touches_content() {
                log::debug!("Patch for tombstone {} ignored", id);
                return ApplyOutcome::Ignored;
            }
            if is_stale(patch.revision, overlay.base.revision) {
                return ApplyOutcome::Unchanged;
            }
            let changed = patch.apply_to(&mut overlay.base, MAX_EDIT_HISTORY);
            self.publish(id);
            return if changed {
                ApplyOutcome::Applied
            } else {
                ApplyOutcome::Unchanged
            };
        }

        match self.store.patch(id, patch) {
            Ok(true) => ApplyOutcome::Applied,
            Ok(false) => ApplyOutcome::Unchanged,
            Err(StoreError::Conflict(_)) => {
                log::debug!("Patch for tombstone {} ignored", id);
                ApplyOutcome::Ignored
            }
            Err(e) => {
                log::debug!("Patch not applied: {}", e);
                ApplyOutcome::Missing(id.clone())
            }
        }
    }

    fn apply_tombstone(&mut self, id: &MessageId) -> ApplyOutcome {
        if let Some(overlay) = self.overlays.get_mut(id) {
            if overlay.base.deleted_for_everyone {
                return ApplyOutcome::Unchanged;
            }
            overlay.base.tombstone();
            self.publish(id);
            return ApplyOutcome::Applied;
        }

        match self.store.tombstone(id) {
            Ok(true) => ApplyOutcome::Applied,
            Ok(false) => ApplyOutcome::Unchanged,
            Err(e) => {
                log::debug!("Delete not applied: {}", e);
                ApplyOutcome::Missing(id.clone())
            }
        }
    }

    fn apply_receipts(
        &mut self,
        user: &UserId,
        up_to: Option<DateTime<Utc>>,
        read: bool,
    ) -> ApplyOutcome {
        let changed = if read {
            self.store.mark_read(user, up_to)
        } else {
            self.store.mark_delivered(user, up_to)
        };
        // Keep overlay bases in step so a later replay does not drop receipts.
        for overlay in self.overlays.values_mut() {
            let base = &mut overlay.base;
            if base.sender.id != *user && up_to.map_or(true, |limit| base.created_at <= limit) {
                base.add_receipt(user, read);
            }
        }
        if changed > 0 {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Unchanged
        }
    }

    // -----------------------------------------------------------------------
    // Local actions
    // -----------------------------------------------------------------------

    /// Insert an optimistic message and produce its send command.
    ///
    /// The temporary entry is ordered after everything already in the store
    /// so a lagging local clock cannot bury it in history.
    pub fn begin_send(
        &mut self,
        sender: SenderProfile,
        body: MessageBody,
        reply_to: Option<&MessageId>,
        now: DateTime<Utc>,
    ) -> Result<Dispatch, ReconcileError> {
        if body.is_blank() {
            return Err(ReconcileError::EmptyMessage);
        }
        let reply = match reply_to {
            Some(id) => {
                let target = self
                    .store
                    .get(id)
                    .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                if id.is_local() {
                    return Err(ReconcileError::NotConfirmed(id.clone()));
                }
                Some(ReplyRef::to_message(target))
            }
            None => None,
        };

        let created_at = match self.store.latest_created_at() {
            Some(latest) if latest >= now => latest + Duration::milliseconds(1),
            _ => now,
        };
        let client_key = ClientKey::generate();
        let local_id = MessageId::local();

        let mut local = Message::new(
            local_id.clone(),
            self.conversation_id().clone(),
            sender,
            body.clone(),
            created_at,
        );
        local.client_key = Some(client_key);
        local.reply_to = reply.clone();
        local.sync = SyncState::Pending(PendingAction::Send);
        self.store.upsert(local)?;

        let ticket = self.issue(InFlight::Send {
            local_id: local_id.clone(),
        });
        log::debug!("Send {} queued as ticket {}", local_id, ticket.0);
        Ok(Dispatch {
            ticket,
            message_id: Some(local_id),
            command: Command::Send {
                conversation_id: self.conversation_id().clone(),
                client_key,
                body,
                reply_to: reply.map(|r| r.id),
            },
        })
    }

    /// Resend a failed message with its original client key.
    pub fn begin_retry(&mut self, local_id: &MessageId) -> Result<Dispatch, ReconcileError> {
        let msg = self
            .store
            .get(local_id)
            .ok_or_else(|| StoreError::NotFound(local_id.clone()))?;
        let client_key = match (msg.client_key, msg.sync) {
            (Some(key), SyncState::Failed(PendingAction::Send)) if local_id.is_local() => key,
            _ => return Err(ReconcileError::NotRetryable(local_id.clone())),
        };
        let command = Command::Send {
            conversation_id: self.conversation_id().clone(),
            client_key,
            body: msg.body.clone(),
            reply_to: msg.reply_to.as_ref().map(|r| r.id.clone()),
        };

        self.store
            .set_sync(local_id, SyncState::Pending(PendingAction::Send))?;
        let ticket = self.issue(InFlight::Send {
            local_id: local_id.clone(),
        });
        log::debug!("Retrying {} as ticket {}", local_id, ticket.0);
        Ok(Dispatch {
            ticket,
            message_id: Some(local_id.clone()),
            command,
        })
    }

    /// Toggle the viewer's `emoji` reaction.
    pub fn begin_react(&mut self, id: &MessageId, emoji: &str) -> Result<Dispatch, ReconcileError> {
        if emoji.trim().is_empty() {
            return Err(ReconcileError::EmptyEmoji);
        }
        let msg = self.confirmed(id)?;
        if msg.deleted_for_everyone {
            return Err(StoreError::Conflict(id.clone()).into());
        }
        let present = !msg.has_reacted(&self.viewer, emoji);

        let op = LocalOp::Patch(MessagePatch::reaction(self.viewer.clone(), emoji, present));
        let command = Command::React {
            conversation_id: self.conversation_id().clone(),
            message_id: id.clone(),
            emoji: emoji.to_string(),
            present,
        };
        self.begin_mutation(id, PendingAction::React, op, command)
    }

    /// Toggle the pinned flag.
    pub fn begin_pin(&mut self, id: &MessageId) -> Result<Dispatch, ReconcileError> {
        let msg = self.confirmed(id)?;
        if msg.deleted_for_everyone {
            return Err(StoreError::Conflict(id.clone()).into());
        }
        let pinned = !msg.pinned;

        let command = Command::Pin {
            conversation_id: self.conversation_id().clone(),
            message_id: id.clone(),
            pinned,
        };
        self.begin_mutation(
            id,
            PendingAction::Pin,
            LocalOp::Patch(MessagePatch::pinned(pinned)),
            command,
        )
    }

    /// Replace the body of one of the viewer's own text messages.
    pub fn begin_edit(
        &mut self,
        id: &MessageId,
        body: MessageBody,
        now: DateTime<Utc>,
    ) -> Result<Dispatch, ReconcileError> {
        let msg = self.confirmed(id)?;
        if msg.deleted_for_everyone {
            return Err(StoreError::Conflict(id.clone()).into());
        }
        if msg.sender.id != self.viewer {
            return Err(ReconcileError::NotAuthor(id.clone()));
        }
        if msg.kind() != MessageKind::Text || body.kind() != MessageKind::Text {
            return Err(ReconcileError::NotEditable(id.clone()));
        }
        if body.is_blank() {
            return Err(ReconcileError::EmptyEdit(id.clone()));
        }

        let command = Command::Edit {
            conversation_id: self.conversation_id().clone(),
            message_id: id.clone(),
            body: body.clone(),
        };
        self.begin_mutation(
            id,
            PendingAction::Edit,
            LocalOp::Patch(MessagePatch::edit(body, now)),
            command,
        )
    }

    /// Hide a message for the viewer only. Allowed on tombstones.
    pub fn begin_delete_for_self(&mut self, id: &MessageId) -> Result<Dispatch, ReconcileError> {
        self.confirmed(id)?;
        let command = Command::DeleteForSelf {
            conversation_id: self.conversation_id().clone(),
            message_id: id.clone(),
        };
        self.begin_mutation(
            id,
            PendingAction::DeleteForSelf,
            LocalOp::Patch(MessagePatch::hide_for(self.viewer.clone())),
            command,
        )
    }

    /// Tombstone a message for everyone. Authorization (author or admin) is
    /// decided remotely; a rejection rolls the tombstone back.
    pub fn begin_delete_for_everyone(
        &mut self,
        id: &MessageId,
    ) -> Result<Dispatch, ReconcileError> {
        let msg = self.confirmed(id)?;
        if msg.deleted_for_everyone {
            return Err(StoreError::Conflict(id.clone()).into());
        }
        let command = Command::DeleteForEveryone {
            conversation_id: self.conversation_id().clone(),
            message_id: id.clone(),
        };
        self.begin_mutation(id, PendingAction::DeleteForEveryone, LocalOp::Tombstone, command)
    }

    /// Record the viewer's read receipt locally and produce the command.
    /// Receipts only grow, so a failed mark-read is not rolled back.
    pub fn begin_mark_read(&mut self, up_to: Option<DateTime<Utc>>) -> Dispatch {
        let viewer = self.viewer.clone();
        self.apply_receipts(&viewer, up_to, true);
        let ticket = self.issue(InFlight::MarkRead);
        Dispatch {
            ticket,
            message_id: None,
            command: Command::MarkRead {
                conversation_id: self.conversation_id().clone(),
                up_to,
            },
        }
    }

    fn confirmed(&self, id: &MessageId) -> Result<&Message, ReconcileError> {
        let msg = self
            .store
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if id.is_local() {
            return Err(ReconcileError::NotConfirmed(id.clone()));
        }
        Ok(msg)
    }

    fn begin_mutation(
        &mut self,
        id: &MessageId,
        action: PendingAction,
        op: LocalOp,
        command: Command,
    ) -> Result<Dispatch, ReconcileError> {
        if !self.overlays.contains_key(id) {
            let mut base = self
                .store
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            base.sync = SyncState::Synced;
            self.overlays.insert(
                id.clone(),
                Overlay {
                    base,
                    ops: Vec::new(),
                },
            );
        }

        let limit = self.config.max_inflight_per_message;
        let pending = self.overlays.get(id).map_or(0, |o| o.ops.len());
        if pending >= limit {
            return Err(ReconcileError::TooManyInFlight(id.clone()));
        }

        let ticket = self.issue(InFlight::Mutation {
            message_id: id.clone(),
        });
        if let Some(overlay) = self.overlays.get_mut(id) {
            overlay.ops.push(PendingOp { ticket, action, op });
        }
        self.publish(id);

        log::debug!("{} on {} queued as ticket {}", action.as_str(), id, ticket.0);
        Ok(Dispatch {
            ticket,
            message_id: Some(id.clone()),
            command,
        })
    }

    // -----------------------------------------------------------------------
    // Command results
    // -----------------------------------------------------------------------

    /// Fold a successful command response into the store.
    pub fn complete(
        &mut self,
        ticket: Ticket,
        response: CommandResponse,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let inflight = self
            .inflight
            .remove(&ticket)
            .ok_or(ReconcileError::UnknownTicket(ticket.0))?;

        match inflight {
            InFlight::Send { local_id } => self.complete_send(&local_id, response),
            InFlight::Mutation { message_id } => {
                Ok(self.complete_mutation(ticket, &message_id, response))
            }
            InFlight::MarkRead => Ok(ApplyOutcome::Unchanged),
        }
    }

    fn complete_send(
        &mut self,
        local_id: &MessageId,
        response: CommandResponse,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let CommandResponse::Created { message } = response else {
            if self.store.contains(local_id) {
                self.store
                    .set_sync(local_id, SyncState::Failed(PendingAction::Send))?;
            }
            return Err(ReconcileError::UnexpectedResponse("send"));
        };
        self.check_conversation(&message.conversation_id)?;

        let event = PushEvent::MessageCreated {
            message: message.clone(),
        };
        if let Some(key) = event.mutation_key() {
            self.seen.put(key, ());
        }

        if self.store.contains(local_id) {
            self.confirm(local_id, message)?;
            Ok(ApplyOutcome::Applied)
        } else {
            // A push event already confirmed it.
            self.ingest(message)
        }
    }

    fn complete_mutation(
        &mut self,
        ticket: Ticket,
        id: &MessageId,
        response: CommandResponse,
    ) -> ApplyOutcome {
        if let CommandResponse::Patched { message_id, patch } = &response {
            let event = PushEvent::MessagePatched {
                conversation_id: self.conversation_id().clone(),
                message_id: message_id.clone(),
                patch: patch.clone(),
            };
            if let Some(key) = event.mutation_key() {
                self.seen.put(key, ());
            }
        }

        let Some(overlay) = self.overlays.get_mut(id) else {
            return ApplyOutcome::Ignored;
        };
        let Some(pos) = overlay.ops.iter().position(|p| p.ticket == ticket) else {
            return ApplyOutcome::Ignored;
        };
        let pending = overlay.ops.remove(pos);

        match response {
            CommandResponse::Patched { patch, .. } => {
                let frozen = overlay.base.deleted_for_everyone && patch.touches_content();
                if !frozen && !is_stale(patch.revision, overlay.base.revision) {
                    patch.apply_to(&mut overlay.base, MAX_EDIT_HISTORY);
                }
            }
            CommandResponse::Deleted { .. } => overlay.base.tombstone(),
            CommandResponse::Created { .. } | CommandResponse::Ack => {
                pending.op.apply(&mut overlay.base)
            }
        }
        // A sibling's failure stays visible until that action succeeds
        match overlay.base.sync {
            SyncState::Failed(failed) if failed != pending.action => {}
            _ => overlay.base.sync = SyncState::Synced,
        }
        self.publish(id);
        log::debug!("✓ {} on {} confirmed", pending.action.as_str(), id);
        ApplyOutcome::Applied
    }

    /// Roll back a failed command and flag the message.
    pub fn fail(&mut self, ticket: Ticket) -> Result<(), ReconcileError> {
        let inflight = self
            .inflight
            .remove(&ticket)
            .ok_or(ReconcileError::UnknownTicket(ticket.0))?;

        match inflight {
            InFlight::Send { local_id } => {
                if self.store.contains(&local_id) {
                    self.store
                        .set_sync(&local_id, SyncState::Failed(PendingAction::Send))?;
                    log::warn!("⚠️  Send {} failed", local_id);
                }
            }
            InFlight::Mutation { message_id } => {
                if let Some(overlay) = self.overlays.get_mut(&message_id) {
                    if let Some(pos) = overlay.ops.iter().position(|p| p.ticket == ticket) {
                        let pending = overlay.ops.remove(pos);
                        overlay.base.sync = SyncState::Failed(pending.action);
                        log::warn!(
                            "⚠️  {} on {} failed, rolled back",
                            pending.action.as_str(),
                            message_id
                        );
                    }
                }
                self.publish(&message_id);
            }
            InFlight::MarkRead => log::warn!("⚠️  Mark-read failed"),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn issue(&mut self, inflight: InFlight) -> Ticket {
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.inflight.insert(ticket, inflight);
        ticket
    }

    /// Recompute the visible entry of an overlaid message from its base and
    /// pending ops. Drops the overlay once nothing is pending.
    fn publish(&mut self, id: &MessageId) {
        let Some(overlay) = self.overlays.get(id) else {
            return;
        };
        let mut visible = overlay.base.clone();
        for pending in &overlay.ops {
            pending.op.apply(&mut visible);
        }
        visible.sync = match overlay.ops.last() {
            Some(pending) => SyncState::Pending(pending.action),
            None => overlay.base.sync,
        };
        if overlay.ops.is_empty() {
            self.overlays.remove(id);
        }
        self.store.replace_entry(visible);
    }

    fn check_conversation(&self, actual: &ConversationId) -> Result<(), ReconcileError> {
        if actual != self.conversation_id() {
            return Err(ReconcileError::WrongConversation {
                expected: self.conversation_id().clone(),
                actual: actual.clone(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::DELETED_PLACEHOLDER;
    use chrono::TimeZone;

    fn conv() -> ConversationId {
        ConversationId::private_between(&UserId::from("alice"), &UserId::from("bob"))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn profile(id: &str) -> SenderProfile {
        SenderProfile {
            id: UserId::from(id),
            name: id.to_uppercase(),
            avatar: None,
        }
    }

    fn server_msg(id: &str, from: &str, text: &str, secs: i64) -> Message {
        Message::new(
            MessageId::from(id),
            conv(),
            profile(from),
            MessageBody::text(text),
            at(secs),
        )
    }

    fn reconciler(viewer: &str) -> Reconciler {
        Reconciler::new(conv(), UserId::from(viewer), ReconcilerConfig::default())
    }

    fn seeded(viewer: &str) -> Reconciler {
        let mut r = reconciler(viewer);
        r.apply_snapshot(
            EventSource::Poll,
            vec![
                server_msg("m2", "bob", "second", 2),
                server_msg("m1", "alice", "first", 1),
            ],
        )
        .unwrap();
        r
    }

    fn ids(r: &Reconciler) -> Vec<String> {
        r.visible().iter().map(|m| m.id.0.clone()).collect()
    }

    // -------------------------------------------------------------------
    // Sends
    // -------------------------------------------------------------------

    #[test]
    fn test_send_pending_then_confirmed() {
        let mut r = seeded("alice");
        let dispatch = r
            .begin_send(profile("alice"), MessageBody::text("hello"), None, at(10))
            .unwrap();
        let local_id = dispatch.message_id.clone().unwrap();
        assert!(local_id.is_local());
        assert_eq!(
            r.message(&local_id).unwrap().sync,
            SyncState::Pending(PendingAction::Send)
        );

        let Command::Send { client_key, .. } = dispatch.command else {
            panic!("expected send command");
        };
        let mut server = server_msg("srv-1", "alice", "hello", 10);
        server.client_key = Some(client_key);
        r.complete(dispatch.ticket, CommandResponse::Created { message: server })
            .unwrap();

        assert_eq!(ids(&r), vec!["m1", "m2", "srv-1"]);
        assert_eq!(
            r.message(&MessageId::from("srv-1")).unwrap().sync,
            SyncState::Synced
        );
        assert!(r.message(&local_id).is_none());
        assert_eq!(r.inflight_count(), 0);
    }

    #[test]
    fn test_push_before_response_does_not_duplicate() {
        let mut r = seeded("alice");
        let dispatch = r
            .begin_send(profile("alice"), MessageBody::text("hello"), None, at(10))
            .unwrap();
        let Command::Send { client_key, .. } = dispatch.command.clone() else {
            panic!("expected send command");
        };
        let mut server = server_msg("srv-1", "alice", "hello", 10);
        server.client_key = Some(client_key);

        r.apply_event(
            EventSource::Push,
            PushEvent::MessageCreated {
                message: server.clone(),
            },
        )
        .unwrap();
        assert_eq!(r.store().len(), 3);

        r.complete(dispatch.ticket, CommandResponse::Created { message: server })
            .unwrap();
        assert_eq!(ids(&r), vec!["m1", "m2", "srv-1"]);
    }

    #[test]
    fn test_push_without_client_key_matched_by_content() {
        let mut r = seeded("alice");
        let dispatch = r
            .begin_send(profile("alice"), MessageBody::text("hello"), None, at(10))
            .unwrap();

        r.apply_event(
            EventSource::Push,
            PushEvent::MessageCreated {
                message: server_msg("srv-1", "alice", "hello", 11),
            },
        )
        .unwrap();
        assert_eq!(ids(&r), vec!["m1", "m2", "srv-1"]);

        // The late response merges into the already-confirmed entry
        r.complete(
            dispatch.ticket,
            CommandResponse::Created {
                message: server_msg("srv-1", "alice", "hello", 11),
            },
        )
        .unwrap();
        assert_eq!(r.store().len(), 3);
    }

    #[test]
    fn test_content_matching_can_be_disabled() {
        let config = ReconcilerConfig {
            content_matching: false,
            ..Default::default()
        };
        let mut r = Reconciler::new(conv(), UserId::from("alice"), config);
        let dispatch = r
            .begin_send(profile("alice"), MessageBody::text("hello"), None, at(10))
            .unwrap();
        r.apply_event(
            EventSource::Push,
            PushEvent::MessageCreated {
                message: server_msg("srv-1", "alice", "hello", 10),
            },
        )
        .unwrap();
        assert_eq!(r.store().len(), 2);

        // The command response still collapses the pair
        r.complete(
            dispatch.ticket,
            CommandResponse::Created {
                message: server_msg("srv-1", "alice", "hello", 10),
            },
        )
        .unwrap();
        assert_eq!(r.store().len(), 1);
    }

    #[test]
    fn test_failed_send_retry_reuses_client_key() {
        let mut r = reconciler("alice");
        let first = r
            .begin_send(profile("alice"), MessageBody::text("hello"), None, at(1))
            .unwrap();
        let local_id = first.message_id.clone().unwrap();
        r.fail(first.ticket).unwrap();
        assert_eq!(
            r.message(&local_id).unwrap().sync,
            SyncState::Failed(PendingAction::Send)
        );

        let retry = r.begin_retry(&local_id).unwrap();
        assert_eq!(retry.command, first.command);
        assert_eq!(
            r.message(&local_id).unwrap().sync,
            SyncState::Pending(PendingAction::Send)
        );
        assert!(matches!(
            r.begin_retry(&local_id),
            Err(ReconcileError::NotRetryable(_))
        ));
    }

    #[test]
    fn test_send_rejects_blank_body() {
        let mut r = reconciler("alice");
        let err = r
            .begin_send(profile("alice"), MessageBody::text("   "), None, at(1))
            .unwrap_err();
        assert_eq!(err, ReconcileError::EmptyMessage);
        assert!(r.store().is_empty());
    }

    #[test]
    fn test_reply_snippet_captured_at_send() {
        let mut r = seeded("alice");
        let target = MessageId::from("m2");
        let dispatch = r
            .begin_send(profile("alice"), MessageBody::text("re"), Some(&target), at(10))
            .unwrap();
        let local = r.message(dispatch.message_id.as_ref().unwrap()).unwrap();
        let reply = local.reply_to.as_ref().unwrap();
        assert_eq!(reply.snippet, "second");
        assert_eq!(reply.sender_name, "BOB");

        // Deleting the target later leaves the snippet intact
        r.apply_event(
            EventSource::Push,
            PushEvent::MessageDeleted {
                conversation_id: conv(),
                message_id: target,
            },
        )
        .unwrap();
        let local = r.message(dispatch.message_id.as_ref().unwrap()).unwrap();
        assert_eq!(local.reply_to.as_ref().unwrap().snippet, "second");
    }

    #[test]
    fn test_local_send_ordered_after_history() {
        let mut r = seeded("alice");
        // Local clock behind the server
        let dispatch = r
            .begin_send(profile("alice"), MessageBody::text("late"), None, at(0))
            .unwrap();
        assert_eq!(ids(&r).last(), dispatch.message_id.as_ref().map(|id| &id.0));
    }

    // -------------------------------------------------------------------
    // Reactions / pins
    // -------------------------------------------------------------------

    #[test]
    fn test_react_toggle_twice_restores() {
        let mut r = seeded("alice");
        let id = MessageId::from("m2");
        let original = r.message(&id).unwrap().reactions.clone();

        let first = r.begin_react(&id, "\u{1F44D}").unwrap();
        r.complete(first.ticket, CommandResponse::Ack).unwrap();
        assert!(r.message(&id).unwrap().has_reacted(&UserId::from("alice"), "\u{1F44D}"));

        let second = r.begin_react(&id, "\u{1F44D}").unwrap();
        assert!(matches!(second.command, Command::React { present: false, .. }));
        r.complete(second.ticket, CommandResponse::Ack).unwrap();
        assert_eq!(r.message(&id).unwrap().reactions, original);
    }

    #[test]
    fn test_failed_reaction_rolls_back() {
        let mut r = seeded("alice");
        let id = MessageId::from("m2");
        let dispatch = r.begin_react(&id, "\u{1F525}").unwrap();
        assert_eq!(
            r.message(&id).unwrap().sync,
            SyncState::Pending(PendingAction::React)
        );
        assert_eq!(r.message(&id).unwrap().reactions.len(), 1);

        r.fail(dispatch.ticket).unwrap();
        let msg = r.message(&id).unwrap();
        assert!(msg.reactions.is_empty());
        assert_eq!(msg.sync, SyncState::Failed(PendingAction::React));
    }

    #[test]
    fn test_sibling_success_keeps_failure_flag() {
        let mut r = seeded("alice");
        let id = MessageId::from("m2");
        let react = r.begin_react(&id, "\u{1F525}").unwrap();
        let pin = r.begin_pin(&id).unwrap();

        r.fail(react.ticket).unwrap();
        assert_eq!(
            r.message(&id).unwrap().sync,
            SyncState::Pending(PendingAction::Pin)
        );

        r.complete(pin.ticket, CommandResponse::Ack).unwrap();
        let msg = r.message(&id).unwrap();
        assert_eq!(msg.sync, SyncState::Failed(PendingAction::React));
        assert!(msg.reactions.is_empty());
        assert!(msg.pinned);

        // Retrying the failed action clears the flag
        let again = r.begin_react(&id, "\u{1F525}").unwrap();
        r.complete(again.ticket, CommandResponse::Ack).unwrap();
        let msg = r.message(&id).unwrap();
        assert_eq!(msg.sync, SyncState::Synced);
        assert_eq!(msg.reactions.len(), 1);
    }

    #[test]
    fn test_stale_poll_keeps_pending_patch() {
        let mut r = seeded("alice");
        let id = MessageId::from("m2");
        let dispatch = r.begin_pin(&id).unwrap();
        assert!(r.message(&id).unwrap().pinned);

        // A poll taken before the pin reached the server
        r.apply_snapshot(EventSource::Poll, vec![server_msg("m2", "bob", "second", 2)])
            .unwrap();
        assert!(r.message(&id).unwrap().pinned);

        r.complete(dispatch.ticket, CommandResponse::Ack).unwrap();
        let msg = r.message(&id).unwrap();
        assert!(msg.pinned);
        assert_eq!(msg.sync, SyncState::Synced);
        assert_eq!(r.store().pinned(50).len(), 1);
    }

    #[test]
    fn test_authoritative_patch_replays_pending_ops() {
        let mut r = seeded("alice");
        let id = MessageId::from("m2");
        let dispatch = r.begin_react(&id, "\u{1F44D}").unwrap();

        // Someone else reacts while ours is in flight
        r.apply_event(
            EventSource::Push,
            PushEvent::MessagePatched {
                conversation_id: conv(),
                message_id: id.clone(),
                patch: MessagePatch::reaction(UserId::from("bob"), "\u{1F44D}", true),
            },
        )
        .unwrap();
        assert_eq!(r.message(&id).unwrap().reactions["\u{1F44D}"].len(), 2);

        r.fail(dispatch.ticket).unwrap();
        let msg = r.message(&id).unwrap();
        assert_eq!(msg.reactions["\u{1F44D}"].len(), 1);
        assert!(msg.has_reacted(&UserId::from("bob"), "\u{1F44D}"));
    }

    #[test]
    fn test_commands_on_local_message_refused() {
        let mut r = reconciler("alice");
        let dispatch = r
            .begin_send(profile("alice"), MessageBody::text("hi"), None, at(1))
            .unwrap();
        let local_id = dispatch.message_id.unwrap();
        assert_eq!(
            r.begin_pin(&local_id).unwrap_err(),
            ReconcileError::NotConfirmed(local_id.clone())
        );
    }

    // -------------------------------------------------------------------
    // Deletion
    // -------------------------------------------------------------------

    #[test]
    fn test_delete_for_everyone_blocks_further_actions() {
        let mut r = seeded("bob");
        let id = MessageId::from("m1");
        r.apply_event(
            EventSource::Push,
            PushEvent::MessageDeleted {
                conversation_id: conv(),
                message_id: id.clone(),
            },
        )
        .unwrap();

        let msg = r.message(&id).unwrap();
        assert_eq!(msg.body, MessageBody::text(DELETED_PLACEHOLDER));
        let conflict = ReconcileError::Store(StoreError::Conflict(id.clone()));
        assert_eq!(r.begin_react(&id, "\u{1F44D}").unwrap_err(), conflict);
        assert_eq!(r.begin_pin(&id).unwrap_err(), conflict);

        // Remote content changes to a tombstone are dropped silently
        let outcome = r
            .apply_event(
                EventSource::Push,
                PushEvent::MessagePatched {
                    conversation_id: conv(),
                    message_id: id.clone(),
                    patch: MessagePatch::pinned(true),
                },
            )
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
    }

    #[test]
    fn test_rejected_delete_for_everyone_restores_message() {
        let mut r = seeded("alice");
        let id = MessageId::from("m1");
        let dispatch = r.begin_delete_for_everyone(&id).unwrap();
        assert!(r.message(&id).unwrap().is_tombstone());

        r.fail(dispatch.ticket).unwrap();
        let msg = r.message(&id).unwrap();
        assert!(!msg.is_tombstone());
        assert_eq!(msg.body, MessageBody::text("first"));
    }

    #[test]
    fn test_delete_for_self_hides_only_for_viewer() {
        let mut r = seeded("alice");
        let id = MessageId::from("m2");
        let dispatch = r.begin_delete_for_self(&id).unwrap();
        r.complete(dispatch.ticket, CommandResponse::Ack).unwrap();
        assert_eq!(ids(&r), vec!["m1"]);
        assert_eq!(r.store().list_visible(&UserId::from("bob")).len(), 2);
    }

    // -------------------------------------------------------------------
    // Edits
    // -------------------------------------------------------------------

    #[test]
    fn test_edit_only_by_author() {
        let mut r = seeded("alice");
        assert_eq!(
            r.begin_edit(&MessageId::from("m2"), MessageBody::text("x"), at(5))
                .unwrap_err(),
            ReconcileError::NotAuthor(MessageId::from("m2"))
        );

        let id = MessageId::from("m1");
        let dispatch = r
            .begin_edit(&id, MessageBody::text("first!"), at(5))
            .unwrap();
        r.complete(dispatch.ticket, CommandResponse::Ack).unwrap();
        let msg = r.message(&id).unwrap();
        assert!(msg.is_edited());
        assert_eq!(msg.edit_history[0].body, MessageBody::text("first"));
    }

    // -------------------------------------------------------------------
    // Dedup / ordering
    // -------------------------------------------------------------------

    #[test]
    fn test_revisioned_event_applied_once() {
        let mut r = seeded("alice");
        let event = PushEvent::MessagePatched {
            conversation_id: conv(),
            message_id: MessageId::from("m2"),
            patch: MessagePatch::pinned(true).with_revision(4),
        };
        assert_eq!(
            r.apply_event(EventSource::Push, event.clone()).unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            r.apply_event(EventSource::Poll, event).unwrap(),
            ApplyOutcome::Duplicate
        );
    }

    #[test]
    fn test_command_response_suppresses_echoed_push() {
        let mut r = seeded("alice");
        let id = MessageId::from("m2");
        let dispatch = r.begin_pin(&id).unwrap();
        let patch = MessagePatch::pinned(true).with_revision(9);
        r.complete(
            dispatch.ticket,
            CommandResponse::Patched {
                message_id: id.clone(),
                patch: patch.clone(),
            },
        )
        .unwrap();

        let echo = PushEvent::MessagePatched {
            conversation_id: conv(),
            message_id: id,
            patch,
        };
        assert_eq!(
            r.apply_event(EventSource::Push, echo).unwrap(),
            ApplyOutcome::Duplicate
        );
    }

    #[test]
    fn test_patch_for_unknown_message_reports_missing() {
        let mut r = seeded("alice");
        let outcome = r
            .apply_event(
                EventSource::Push,
                PushEvent::MessagePatched {
                    conversation_id: conv(),
                    message_id: MessageId::from("ghost"),
                    patch: MessagePatch::pinned(true),
                },
            )
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Missing(MessageId::from("ghost")));
    }

    #[test]
    fn test_wrong_conversation_rejected() {
        let mut r = seeded("alice");
        let err = r
            .apply_event(
                EventSource::Push,
                PushEvent::MessageDeleted {
                    conversation_id: ConversationId::group("elsewhere"),
                    message_id: MessageId::from("m1"),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ReconcileError::WrongConversation { .. }));
    }

    #[test]
    fn test_unknown_ticket() {
        let mut r = reconciler("alice");
        assert_eq!(
            r.fail(Ticket(42)).unwrap_err(),
            ReconcileError::UnknownTicket(42)
        );
    }

    // -------------------------------------------------------------------
    // Receipts / pinned view
    // -------------------------------------------------------------------

    #[test]
    fn test_read_receipt_survives_overlay_replay() {
        let mut r = seeded("alice");
        let id = MessageId::from("m1");
        let dispatch = r.begin_pin(&id).unwrap();
        r.apply_event(
            EventSource::Push,
            PushEvent::MessagesRead {
                conversation_id: conv(),
                reader: UserId::from("bob"),
                up_to: None,
            },
        )
        .unwrap();
        r.fail(dispatch.ticket).unwrap();
        assert!(r.message(&id).unwrap().read_by.contains(&UserId::from("bob")));
    }

    #[test]
    fn test_apply_pinned_unpins_missing_entries() {
        let mut r = seeded("alice");
        let mut m1 = server_msg("m1", "alice", "first", 1);
        m1.pinned = true;
        let mut m2 = server_msg("m2", "bob", "second", 2);
        m2.pinned = true;
        r.apply_snapshot(EventSource::Poll, vec![m1.clone(), m2]).unwrap();
        assert_eq!(r.store().pinned(50).len(), 2);

        r.apply_pinned(vec![m1], 50).unwrap();
        let pinned: Vec<_> = r.store().pinned(50).iter().map(|m| m.id.0.clone()).collect();
        assert_eq!(pinned, vec!["m1"]);
    }
}
