//! mq-core - Data model and queue logic for the merge queue
//!
//! This crate provides the forge-independent heart of the system:
//! - Queue entry and check status records
//! - The SQLite store (the single source of truth)
//! - Queue orchestration (enqueue / dequeue / head / advance)
//! - Automerge intent detection over PR timelines
//! - Check evaluation against required-checks lists

pub mod automerge;
pub mod database;
pub mod error;
pub mod evaluator;
pub mod queue;
pub mod queue_service;
pub mod repo;

#[cfg(test)]
mod database_queue_tests;
#[cfg(test)]
mod queue_invariant_tests;

pub use automerge::{
    automerge_scheduled, COMMENT_TYPE_MERGE_CANCELLED, COMMENT_TYPE_MERGE_SCHEDULED,
};
pub use database::{Dequeued, Enqueued, Store, StoreConfig};
pub use error::{Error, Result};
pub use evaluator::{evaluate, success_timed_out, timed_out, CheckVerdict};
pub use queue::{CheckState, CheckStatus, EntryState, QueueEntry};
pub use queue_service::{DequeueOutcome, EnqueueOutcome, QueueService};
pub use repo::{Repo, RepoRef};

/// The commit-status context this system posts on PR head SHAs to gate the
/// forge's automerge. The admission flow adds the same name to branch
/// protection, and the webhook router drops events carrying it.
pub const CONTEXT_NAME: &str = "gitea-mq";
