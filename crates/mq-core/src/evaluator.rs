//! Check evaluation
//!
//! Maps the set of recorded check statuses for an entry, together with the
//! resolved required-checks list, to a verdict. Resolution of the required
//! list itself involves the forge and lives with the callers; this module is
//! pure.

use chrono::{DateTime, Duration, Utc};

use crate::queue::{CheckState, CheckStatus, EntryState, QueueEntry};

/// Outcome of evaluating an entry's recorded checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckVerdict {
    /// Not all required results are in yet.
    Waiting,
    /// Every required check succeeded.
    Success,
    /// The named required context failed or errored. Only the first failing
    /// context (in required-list order) is reported.
    Failure(String),
}

/// Evaluate recorded statuses against the required-checks list.
///
/// With an empty required list, any single recorded success suffices.
/// Otherwise the required contexts are walked in the order given (the order
/// the protection rule lists them): a missing or pending one means
/// `Waiting`, a failing one decides `Failure`, and only when all succeed is
/// the verdict `Success`.
pub fn evaluate(statuses: &[CheckStatus], required: &[String]) -> CheckVerdict {
    if required.is_empty() {
        let any_success = statuses.iter().any(|s| s.state == CheckState::Success);
        return if any_success {
            CheckVerdict::Success
        } else {
            CheckVerdict::Waiting
        };
    }

    for context in required {
        let Some(status) = statuses.iter().find(|s| &s.context == context) else {
            return CheckVerdict::Waiting;
        };
        match status.state {
            CheckState::Failure | CheckState::Error => {
                return CheckVerdict::Failure(context.clone());
            }
            CheckState::Pending => return CheckVerdict::Waiting,
            CheckState::Success => {}
        }
    }

    CheckVerdict::Success
}

/// Whether a Testing entry has exceeded the check timeout, regardless of
/// what statuses have been recorded.
pub fn timed_out(entry: &QueueEntry, now: DateTime<Utc>, check_timeout: Duration) -> bool {
    if entry.state != EntryState::Testing {
        return false;
    }
    match entry.testing_started_at {
        Some(started) => now - started > check_timeout,
        None => false,
    }
}

/// Whether a Success entry has waited too long for the forge's automerge to
/// actually merge the PR.
pub fn success_timed_out(
    entry: &QueueEntry,
    now: DateTime<Utc>,
    success_timeout: Duration,
) -> bool {
    if entry.state != EntryState::Success {
        return false;
    }
    match entry.completed_at {
        Some(completed) => now - completed > success_timeout,
        None => false,
    }
}
