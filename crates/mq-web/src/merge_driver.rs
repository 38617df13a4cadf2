//! Test-merge branch lifecycle
//!
//! Creates the merge branch a head-of-queue entry is tested on, and tears
//! merge branches down when entries leave the queue. A merge conflict is
//! not an error here: it becomes a queue event (removal with a user-facing
//! explanation).

use std::sync::Arc;

use mq_core::{EntryState, QueueEntry, QueueService, Repo, RepoRef, CONTEXT_NAME};
use mq_gitea::{CommitStatusOptions, ForgeClient, StatusState};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::Result;

/// Prefix of every branch this system pushes. The sole signal the stale
/// sweep uses to identify merge-queue branches.
pub const BRANCH_PREFIX: &str = "gitea-mq";

/// The merge branch name for a PR.
pub fn merge_branch_name(pr_number: i64) -> String {
    format!("{}/{}", BRANCH_PREFIX, pr_number)
}

/// Outcome of a start-testing attempt.
#[derive(Debug)]
pub struct StartTesting {
    /// The entry was removed (merge conflict); the caller advances on the
    /// next cycle.
    pub removed: bool,
    /// Merge branch name and SHA when testing started.
    pub merge_branch: Option<(String, String)>,
}

/// Creates and tears down test-merge branches.
#[derive(Clone)]
pub struct MergeDriver {
    forge: Arc<dyn ForgeClient>,
    queue: QueueService,
    config: Arc<AppConfig>,
}

impl MergeDriver {
    pub fn new(forge: Arc<dyn ForgeClient>, queue: QueueService, config: Arc<AppConfig>) -> Self {
        Self {
            forge,
            queue,
            config,
        }
    }

    /// Take a Queued head-of-queue entry into Testing: merge its head into
    /// the latest target branch, publish the result as the merge branch,
    /// and gate the PR with a pending status.
    ///
    /// On conflict the entry is removed as a queue event. Generic forge
    /// errors propagate with the entry unchanged; the next poll tick
    /// retries.
    pub async fn start_testing(&self, repo: &Repo, entry: &QueueEntry) -> Result<StartTesting> {
        let repo_ref = RepoRef::from(repo);
        let branch = merge_branch_name(entry.pr_number);

        let merge_sha = match self
            .forge
            .merge_into_branch(&repo_ref, &entry.target_branch, &entry.pr_head_sha, &branch)
            .await
        {
            Ok(sha) => sha,
            Err(e) if e.is_merge_conflict() => {
                self.remove_conflicting(repo, &repo_ref, entry).await?;
                return Ok(StartTesting {
                    removed: true,
                    merge_branch: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        self.queue
            .set_merge_branch(repo, entry.pr_number, &branch, &merge_sha)
            .await?;
        self.queue
            .update_state(repo, entry.pr_number, EntryState::Testing)
            .await?;

        // The status gates the forge's automerge, so it goes on the PR's
        // own head, not the merge commit.
        self.forge
            .post_commit_status(
                &repo_ref,
                &entry.pr_head_sha,
                &CommitStatusOptions {
                    state: StatusState::Pending,
                    context: CONTEXT_NAME.to_string(),
                    description: "Testing merge result".to_string(),
                    target_url: self.config.pr_url(&repo_ref, entry.pr_number),
                },
            )
            .await?;

        info!(
            repo = %repo_ref,
            pr = entry.pr_number,
            branch = %branch,
            sha = %merge_sha,
            "Started testing"
        );

        Ok(StartTesting {
            removed: false,
            merge_branch: Some((branch, merge_sha)),
        })
    }

    async fn remove_conflicting(
        &self,
        repo: &Repo,
        repo_ref: &RepoRef,
        entry: &QueueEntry,
    ) -> Result<()> {
        info!(repo = %repo_ref, pr = entry.pr_number, "Merge conflict, removing from queue");

        self.forge
            .cancel_automerge(repo_ref, entry.pr_number)
            .await?;
        self.forge
            .post_commit_status(
                repo_ref,
                &entry.pr_head_sha,
                &CommitStatusOptions {
                    state: StatusState::Failure,
                    context: CONTEXT_NAME.to_string(),
                    description: "Merge conflict with target branch".to_string(),
                    target_url: self.config.pr_url(repo_ref, entry.pr_number),
                },
            )
            .await?;
        self.forge
            .post_pull_comment(
                repo_ref,
                entry.pr_number,
                &format!(
                    "This PR has a merge conflict with `{}` and was removed from the merge \
                     queue. Resolve the conflict and schedule the merge again.",
                    entry.target_branch
                ),
            )
            .await?;
        self.queue.dequeue(repo, entry.pr_number).await?;
        Ok(())
    }

    /// Best-effort removal of the entry's merge branch; failures are
    /// logged, not propagated.
    pub async fn cleanup_merge_branch(&self, repo_ref: &RepoRef, entry: &QueueEntry) {
        let Some(branch) = entry.merge_branch_name.as_deref() else {
            return;
        };

        match self.forge.delete_branch(repo_ref, branch).await {
            Ok(()) => debug!(repo = %repo_ref, branch, "Deleted merge branch"),
            Err(e) if e.is_not_found() => {
                debug!(repo = %repo_ref, branch, "Merge branch already gone")
            }
            Err(e) => warn!(repo = %repo_ref, branch, error = %e, "Failed to delete merge branch"),
        }
    }

    /// Delete merge-queue branches that no active entry accounts for.
    /// Run on startup and on repo admission; continues across individual
    /// delete failures.
    pub async fn cleanup_stale(&self, repo: &Repo) -> Result<()> {
        let repo_ref = RepoRef::from(repo);
        let branches = self.forge.list_branches(&repo_ref).await?;
        let active = self.queue.list_active(repo).await?;

        let prefix = format!("{}/", BRANCH_PREFIX);
        for branch in branches {
            if !branch.name.starts_with(&prefix) {
                continue;
            }
            let in_use = active
                .iter()
                .any(|e| e.merge_branch_name.as_deref() == Some(branch.name.as_str()));
            if in_use {
                continue;
            }

            match self.forge.delete_branch(&repo_ref, &branch.name).await {
                Ok(()) => info!(repo = %repo_ref, branch = %branch.name, "Deleted stale merge branch"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(repo = %repo_ref, branch = %branch.name, error = %e, "Failed to delete stale merge branch")
                }
            }
        }

        Ok(())
    }
}
