//! Queue orchestration over the store
//!
//! The queue service is the sole mutator of entry state. The poller and the
//! webhook router call through it; neither touches the database directly.

use tracing::debug;

use crate::database::Store;
use crate::queue::{CheckState, CheckStatus, EntryState, QueueEntry};
use crate::repo::Repo;
use crate::Result;

/// Result of an enqueue request.
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    /// 1-based position among active entries for the same target branch.
    pub position: i64,
    /// Whether this call created the entry (false on re-enqueue).
    pub is_new: bool,
    pub entry: QueueEntry,
}

/// Result of a dequeue request.
#[derive(Debug, Clone)]
pub struct DequeueOutcome {
    pub found: bool,
    /// Whether the removed entry was the head of its queue; callers use
    /// this to decide on merge-branch cleanup and advancement.
    pub was_head: bool,
    pub entry: Option<QueueEntry>,
}

/// Enqueue / dequeue / head / advance over the store.
#[derive(Clone)]
pub struct QueueService {
    store: Store,
}

impl QueueService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Idempotent enqueue: a second call for the same (repo, pr) returns the
    /// existing entry and its current position. The write and the position
    /// read share one store transaction.
    pub async fn enqueue(
        &self,
        repo: &Repo,
        pr_number: i64,
        head_sha: &str,
        target_branch: &str,
    ) -> Result<EnqueueOutcome> {
        let enqueued = self
            .store
            .enqueue_pr(repo, pr_number, head_sha, target_branch)
            .await?;

        debug!(
            repo = %repo.full_name(),
            pr = pr_number,
            position = enqueued.position,
            is_new = enqueued.is_new,
            "Enqueued PR"
        );

        Ok(EnqueueOutcome {
            position: enqueued.position,
            is_new: enqueued.is_new,
            entry: enqueued.entry,
        })
    }

    /// Remove the entry for (repo, pr). The head check and the delete share
    /// one store transaction; removing a missing entry is a no-op reported
    /// through `found`.
    pub async fn dequeue(&self, repo: &Repo, pr_number: i64) -> Result<DequeueOutcome> {
        let dequeued = self.store.dequeue_pr(repo, pr_number).await?;

        if dequeued.found {
            debug!(
                repo = %repo.full_name(),
                pr = pr_number,
                was_head = dequeued.was_head,
                "Dequeued PR"
            );
        }

        Ok(DequeueOutcome {
            found: dequeued.found,
            was_head: dequeued.was_head,
            entry: dequeued.entry,
        })
    }

    /// The oldest active entry for (repo, target branch).
    pub async fn head(&self, repo: &Repo, target_branch: &str) -> Result<Option<QueueEntry>> {
        self.store.get_head(repo, target_branch).await
    }

    /// Drop terminal rows for the target branch and return the next head.
    pub async fn advance(&self, repo: &Repo, target_branch: &str) -> Result<Option<QueueEntry>> {
        self.store.advance(repo, target_branch).await
    }

    pub async fn get_entry(&self, repo: &Repo, pr_number: i64) -> Result<Option<QueueEntry>> {
        self.store.get_entry(repo, pr_number).await
    }

    pub async fn list_active(&self, repo: &Repo) -> Result<Vec<QueueEntry>> {
        self.store.list_active(repo).await
    }

    pub async fn update_state(
        &self,
        repo: &Repo,
        pr_number: i64,
        new_state: EntryState,
    ) -> Result<()> {
        self.store.update_state(repo, pr_number, new_state).await
    }

    pub async fn set_merge_branch(
        &self,
        repo: &Repo,
        pr_number: i64,
        branch_name: &str,
        sha: &str,
    ) -> Result<()> {
        self.store
            .set_merge_branch(repo, pr_number, branch_name, sha)
            .await
    }

    pub async fn set_error(&self, repo: &Repo, pr_number: i64, message: &str) -> Result<()> {
        self.store.set_error(repo, pr_number, message).await
    }

    pub async fn save_check_status(
        &self,
        entry: &QueueEntry,
        context: &str,
        state: CheckState,
    ) -> Result<()> {
        self.store.save_check_status(entry.id, context, state).await
    }

    pub async fn get_check_statuses(&self, entry: &QueueEntry) -> Result<Vec<CheckStatus>> {
        self.store.get_check_statuses(entry.id).await
    }
}
