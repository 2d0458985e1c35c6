//! # Agora Protocol
//!
//! **Conflict-free message state for group, sub-group, and private chat.**
//!
//! This crate holds everything about a conversation that can be decided
//! without I/O: the message model, the per-conversation store, the event
//! reconciler that merges command responses, push events, and poll snapshots
//! exactly once, and the pure read-side aggregations. It has no async
//! runtime; `agora-core` drives it.
//!
//! ## Quick Start
//!
//! ```rust
//! use agora_protocol::{
//!     ConversationId, EventSource, MessageBody, Reconciler, ReconcilerConfig, SenderProfile,
//!     UserId,
//! };
//!
//! let alice = UserId::from("alice");
//! let conversation = ConversationId::private_between(&alice, &UserId::from("bob"));
//! let mut reconciler = Reconciler::new(conversation, alice.clone(), ReconcilerConfig::default());
//!
//! let profile = SenderProfile { id: alice, name: "Alice".into(), avatar: None };
//! let dispatch = reconciler
//!     .begin_send(profile, MessageBody::text("hello"), None, chrono::Utc::now())
//!     .unwrap();
//! assert_eq!(reconciler.visible().len(), 1);
//! assert_eq!(dispatch.command.name(), "send");
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`ids`] | User, message, conversation ids; client keys; mutation fingerprints |
//! | [`message`] | Message model, bodies, sync state |
//! | [`patch`] | Partial updates carried by events and optimistic actions |
//! | [`store`] | Per-conversation message store |
//! | [`events`] | Push events, commands, command responses |
//! | [`reconciler`] | Exactly-once merge of all sources, optimistic overlays |
//! | [`reactions`] | Reaction aggregation |
//! | [`receipts`] | Sent / delivered / read resolution |
//! | [`limits`] | Page sizes, placeholders, bookkeeping bounds |

#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

// ── Public modules ──────────────────────────────────────────────────────────

pub mod events;
pub mod ids;
pub mod limits;
pub mod message;
pub mod patch;
pub mod reactions;
pub mod receipts;

/// Exactly-once merge of command responses, push events, and poll snapshots.
pub mod reconciler;

/// Per-conversation message collection.
pub mod store;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use events::{Command, CommandResponse, PushEvent};
pub use ids::{ClientKey, ConversationId, MessageId, MutationKey, UserId};
pub use message::{
    DeletionState, EditRecord, MediaMeta, Message, MessageBody, MessageKind, PendingAction,
    Reactions, ReplyRef, SenderProfile, SyncState,
};
pub use patch::{MessagePatch, ReactionDelta};
pub use reactions::{aggregate, ReactionSummary};
pub use receipts::{resolve_status, ReceiptStatus};
pub use reconciler::{
    ApplyOutcome, Dispatch, EventSource, ReconcileError, Reconciler, ReconcilerConfig, Ticket,
};
pub use store::{MessageStore, StoreChange, StoreError, UpsertOutcome};

// ── Library metadata ────────────────────────────────────────────────────────

/// Agora Protocol version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the protocol crate version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────
