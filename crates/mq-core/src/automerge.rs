//! Automerge intent detection
//!
//! The forge records automerge scheduling as typed timeline comments on the
//! pull request. The most recent automerge-related comment wins: a PR has
//! automerge scheduled iff the newest `pull_scheduled_merge` /
//! `pull_cancel_scheduled_merge` tag is the scheduling one.

/// Timeline comment type the forge emits when automerge is scheduled.
pub const COMMENT_TYPE_MERGE_SCHEDULED: &str = "pull_scheduled_merge";

/// Timeline comment type the forge emits when a scheduled automerge is
/// cancelled.
pub const COMMENT_TYPE_MERGE_CANCELLED: &str = "pull_cancel_scheduled_merge";

/// Decide from a PR timeline whether automerge is currently scheduled.
///
/// `comment_types` is the sequence of timeline comment type tags, oldest
/// first (the order the forge returns them in). Scans newest to oldest; the
/// first automerge-related tag decides. An empty timeline, or one with no
/// automerge-related tags, means not scheduled.
pub fn automerge_scheduled<'a, I>(comment_types: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
    I::IntoIter: DoubleEndedIterator,
{
    for comment_type in comment_types.into_iter().rev() {
        match comment_type {
            COMMENT_TYPE_MERGE_SCHEDULED => return true,
            COMMENT_TYPE_MERGE_CANCELLED => return false,
            _ => {}
        }
    }
    false
}
