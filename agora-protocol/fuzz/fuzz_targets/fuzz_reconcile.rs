#![no_main]
use libfuzzer_sys::fuzz_target;
use arbitrary::Arbitrary;

use agora_protocol::{
    CommandResponse, ConversationId, EventSource, Message, MessageBody, MessageId, MessagePatch,
    PushEvent, Reconciler, ReconcilerConfig, SenderProfile, UserId,
};
use chrono::{Duration, TimeZone, Utc};

/// Fuzz the reconciler with interleaved local actions, command results,
/// push events and poll snapshots.
///
/// Checks after every step:
/// - no message id appears twice
/// - the list is in ascending conversation order
/// - a tombstoned message stays tombstoned with no reactions or pin

#[derive(Arbitrary, Debug)]
enum Step {
    PushCreate { id: u8, author: u8, at: u16, body: String },
    PushReact { id: u8, user: u8, emoji: u8, present: bool, revision: Option<u8> },
    PushPin { id: u8, pinned: bool },
    PushDelete { id: u8 },
    PushRead { reader: u8 },
    Snapshot { ids: Vec<u8> },
    Send { body: String, at: u16 },
    React { id: u8, emoji: u8 },
    Pin { id: u8 },
    Delete { id: u8 },
    Resolve { slot: u8, ok: bool },
}

#[derive(Arbitrary, Debug)]
struct ReconcileInput {
    content_matching: bool,
    steps: Vec<Step>,
}

const EMOJI: [&str; 3] = ["👍", "❤️", "😂"];

fn user(n: u8) -> UserId {
    UserId::new(format!("user-{}", n % 4))
}

fn profile(n: u8) -> SenderProfile {
    SenderProfile {
        id: user(n),
        name: format!("User {}", n % 4),
        avatar: None,
    }
}

fn message_id(n: u8) -> MessageId {
    MessageId::new(format!("srv-{}", n % 16))
}

fn message(conversation: &ConversationId, id: u8, author: u8, at: u16, body: &str) -> Message {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    Message::new(
        message_id(id),
        conversation.clone(),
        profile(author),
        MessageBody::text(if body.trim().is_empty() { "x" } else { body }),
        base + Duration::seconds(at as i64),
    )
}

fuzz_target!(|input: ReconcileInput| {
    if input.steps.len() > 200 {
        return;
    }

    let conversation = ConversationId::group("fuzz");
    let config = ReconcilerConfig {
        content_matching: input.content_matching,
        ..Default::default()
    };
    let mut reconciler = Reconciler::new(conversation.clone(), user(0), config);
    let mut pending = Vec::new();
    let mut tombstoned = Vec::new();
    let mut created = 0u32;

    for step in input.steps {
        match step {
            Step::PushCreate { id, author, at, body } => {
                let msg = message(&conversation, id, author, at, &body);
                let _ = reconciler.apply_event(EventSource::Push, PushEvent::MessageCreated { message: msg });
            }
            Step::PushReact { id, user: who, emoji, present, revision } => {
                let mut patch = MessagePatch::reaction(user(who), EMOJI[emoji as usize % 3], present);
                if let Some(revision) = revision {
                    patch = patch.with_revision(revision as u64);
                }
                let _ = reconciler.apply_event(
                    EventSource::Push,
                    PushEvent::MessagePatched {
                        conversation_id: conversation.clone(),
                        message_id: message_id(id),
                        patch,
                    },
                );
            }
            Step::PushPin { id, pinned } => {
                let _ = reconciler.apply_event(
                    EventSource::Push,
                    PushEvent::MessagePatched {
                        conversation_id: conversation.clone(),
                        message_id: message_id(id),
                        patch: MessagePatch::pinned(pinned),
                    },
                );
            }
            Step::PushDelete { id } => {
                let _ = reconciler.apply_event(
                    EventSource::Push,
                    PushEvent::MessageDeleted {
                        conversation_id: conversation.clone(),
                        message_id: message_id(id),
                    },
                );
            }
            Step::PushRead { reader } => {
                let _ = reconciler.apply_event(
                    EventSource::Push,
                    PushEvent::MessagesRead {
                        conversation_id: conversation.clone(),
                        reader: user(reader),
                        up_to: None,
                    },
                );
            }
            Step::Snapshot { ids } => {
                let page = ids
                    .iter()
                    .take(32)
                    .map(|&id| message(&conversation, id, id, id as u16 * 7, "snapshot"))
                    .collect();
                let _ = reconciler.apply_snapshot(EventSource::Poll, page);
            }
            Step::Send { body, at } => {
                let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
                if let Ok(dispatch) = reconciler.begin_send(
                    profile(0),
                    MessageBody::text(body),
                    None,
                    base + Duration::seconds(at as i64),
                ) {
                    pending.push((dispatch, at));
                }
            }
            Step::React { id, emoji } => {
                if let Ok(dispatch) = reconciler.begin_react(&message_id(id), EMOJI[emoji as usize % 3]) {
                    pending.push((dispatch, 0));
                }
            }
            Step::Pin { id } => {
                if let Ok(dispatch) = reconciler.begin_pin(&message_id(id)) {
                    pending.push((dispatch, 0));
                }
            }
            Step::Delete { id } => {
                if let Ok(dispatch) = reconciler.begin_delete_for_everyone(&message_id(id)) {
                    pending.push((dispatch, 0));
                }
            }
            Step::Resolve { slot, ok } => {
                if pending.is_empty() {
                    continue;
                }
                let (dispatch, at) = pending.remove(slot as usize % pending.len());
                if !ok {
                    let _ = reconciler.fail(dispatch.ticket);
                    continue;
                }
                let response = match &dispatch.command {
                    agora_protocol::Command::Send { client_key, body, .. } => {
                        let mut msg = message(&conversation, 0, 0, at, "x");
                        created += 1;
                        msg.id = MessageId::new(format!("sent-{}", created));
                        msg.body = body.clone();
                        msg.client_key = Some(*client_key);
                        CommandResponse::Created { message: msg }
                    }
                    agora_protocol::Command::DeleteForEveryone { message_id, .. } => {
                        CommandResponse::Deleted { message_id: message_id.clone() }
                    }
                    _ => CommandResponse::Ack,
                };
                let _ = reconciler.complete(dispatch.ticket, response);
            }
        }

        let list = reconciler.store().list();
        let mut ids: Vec<&MessageId> = list.iter().map(|m| &m.id).collect();
        assert!(list.windows(2).all(|w| w[0].order_key() <= w[1].order_key()));
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), list.len(), "duplicate message id");

        for msg in list {
            if msg.is_tombstone() {
                tombstoned.push(msg.id.clone());
            }
        }
        for id in &tombstoned {
            if let Some(msg) = reconciler.store().get(id) {
                if msg.sync.is_pending() || msg.sync.is_failed() {
                    continue;
                }
                assert!(msg.is_tombstone());
                assert!(msg.reactions.values().all(|users| users.is_empty()));
                assert!(!msg.pinned);
            }
        }
    }
});
