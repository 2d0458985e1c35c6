//! Reaction aggregation for display.

use serde::Serialize;

use crate::ids::UserId;
use crate::message::Reactions;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: usize,
    pub viewer_reacted: bool,
}

/// Fold a reaction map into per-emoji summaries, most used first.
/// Ties are ordered by emoji so equal input always yields equal output.
pub fn aggregate(reactions: &Reactions, viewer: &UserId) -> Vec<ReactionSummary> {
    let mut summaries: Vec<ReactionSummary> = reactions
        .iter()
        .filter(|(_, users)| !users.is_empty())
        .map(|(emoji, users)| ReactionSummary {
            emoji: emoji.clone(),
            count: users.len(),
            viewer_reacted: users.contains(viewer),
        })
        .collect();
    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.emoji.cmp(&b.emoji)));
    summaries
}

/// Total number of reactions across all emoji.
pub fn total(reactions: &Reactions) -> usize {
    reactions.values().map(|users| users.len()).sum()
}
