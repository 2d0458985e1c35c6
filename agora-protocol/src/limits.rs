//! Sync guardrails and fixed protocol values.
//!
//! These constants bound history pages, the pinned view, and the reconciler's
//! bookkeeping so a long-lived conversation cannot grow them without limit.

/// Placeholder body shown once a message is deleted for everyone.
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

/// Max messages requested per history page.
pub const HISTORY_PAGE_SIZE: usize = 100;

/// Max entries in the conversation's pinned view.
pub const MAX_PINNED_VIEW: usize = 50;

/// Max characters kept in a reply's denormalized snippet.
pub const REPLY_SNIPPET_CHARS: usize = 100;

/// Default capacity of the reconciler's duplicate-mutation cache.
pub const DEDUP_CACHE_CAPACITY: usize = 4_096;

/// Window (ms) within which a push-created message may be matched to an
/// optimistic one by sender and content when no client key is echoed.
pub const HEURISTIC_MATCH_WINDOW_MS: i64 = 10_000;

/// Max edit-history entries retained per message; oldest are dropped first.
pub const MAX_EDIT_HISTORY: usize = 20;

/// Max in-flight optimistic patches per message before new commands are refused.
pub const MAX_INFLIGHT_PER_MESSAGE: usize = 32;

/// Truncate `text` to at most `REPLY_SNIPPET_CHARS` characters on a char boundary.
pub fn reply_snippet(text: &str) -> String {
    text.chars().take(REPLY_SNIPPET_CHARS).collect()
}

/// Clamp a caller-supplied page size into `1..=max`.
pub fn clamp_page(requested: usize, max: usize) -> usize {
    requested.clamp(1, max)
}
