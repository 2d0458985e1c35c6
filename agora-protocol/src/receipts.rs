//! Delivery/read status of the viewer's own messages.
//!
//! Receipt sets may contain the author (some backends mark a sender as having
//! read their own message); the author is never counted.

use serde::Serialize;

use crate::ids::UserId;
use crate::message::Message;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Read,
}

/// Status of `message` as seen by `viewer`. `None` unless the viewer wrote it
/// and the server has confirmed it.
pub fn resolve_status(message: &Message, viewer: &UserId) -> Option<ReceiptStatus> {
    if message.sender.id != *viewer || message.id.is_local() {
        return None;
    }
    let author = &message.sender.id;
    let others = |set: &std::collections::BTreeSet<UserId>| set.iter().any(|u| u != author);

    Some(if others(&message.read_by) {
        ReceiptStatus::Read
    } else if others(&message.delivered_to) {
        ReceiptStatus::Delivered
    } else {
        ReceiptStatus::Sent
    })
}

/// Users other than the author who have read `message`.
pub fn readers(message: &Message) -> Vec<&UserId> {
    message
        .read_by
        .iter()
        .filter(|u| **u != message.sender.id)
        .collect()
}
