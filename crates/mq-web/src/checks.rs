//! Required-check resolution and verdict application
//!
//! The pure evaluation lives in mq-core; this module supplies its inputs
//! (the required-checks list, re-resolved from branch protection on every
//! event, never cached) and performs the forge- and queue-facing actions a
//! verdict calls for. Both the webhook router and the poller act through
//! here, so duplicate deliveries and races converge to the same effects.

use std::sync::Arc;

use mq_core::{
    evaluate, CheckVerdict, EntryState, QueueEntry, QueueService, Repo, RepoRef, CONTEXT_NAME,
};
use mq_gitea::{CommitStatusOptions, ForgeClient, StatusState};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::merge_driver::MergeDriver;
use crate::Result;

/// Evaluates entries and applies the resulting actions.
#[derive(Clone)]
pub struct Checks {
    forge: Arc<dyn ForgeClient>,
    queue: QueueService,
    driver: MergeDriver,
    config: Arc<AppConfig>,
}

impl Checks {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        queue: QueueService,
        driver: MergeDriver,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            forge,
            queue,
            driver,
            config,
        }
    }

    /// Resolve the required-checks list for a target branch:
    /// the protection rule's contexts with our own context removed (our
    /// status must never be an input to itself), else the operator
    /// fallback, else empty.
    pub async fn resolve_required(
        &self,
        repo_ref: &RepoRef,
        target_branch: &str,
    ) -> Result<Vec<String>> {
        let protection = self
            .forge
            .get_branch_protection(repo_ref, target_branch)
            .await?;

        if let Some(protection) = protection {
            if protection.enable_status_check {
                let contexts: Vec<String> = protection
                    .status_check_contexts
                    .into_iter()
                    .filter(|c| c != CONTEXT_NAME)
                    .collect();
                if !contexts.is_empty() {
                    return Ok(contexts);
                }
            }
        }

        Ok(self.config.fallback_required_checks.clone())
    }

    /// Resolve, load recorded statuses, and evaluate.
    pub async fn evaluate_entry(&self, repo: &Repo, entry: &QueueEntry) -> Result<CheckVerdict> {
        let repo_ref = RepoRef::from(repo);
        let required = self
            .resolve_required(&repo_ref, &entry.target_branch)
            .await?;
        let statuses = self.queue.get_check_statuses(entry).await?;
        Ok(evaluate(&statuses, &required))
    }

    /// Perform the action a verdict calls for. `Waiting` does nothing.
    pub async fn apply_verdict(
        &self,
        repo: &Repo,
        entry: &QueueEntry,
        verdict: &CheckVerdict,
    ) -> Result<()> {
        match verdict {
            CheckVerdict::Waiting => Ok(()),
            CheckVerdict::Success => self.apply_success(repo, entry).await,
            CheckVerdict::Failure(context) => self.apply_failure(repo, entry, context).await,
        }
    }

    /// All required checks passed: hand the PR back to the forge's
    /// automerge by posting our success status. No advance here; the
    /// poller confirms the merge and advances later.
    async fn apply_success(&self, repo: &Repo, entry: &QueueEntry) -> Result<()> {
        let repo_ref = RepoRef::from(repo);
        info!(repo = %repo_ref, pr = entry.pr_number, "Merge queue checks passed");

        self.forge
            .post_commit_status(
                &repo_ref,
                &entry.pr_head_sha,
                &CommitStatusOptions {
                    state: StatusState::Success,
                    context: CONTEXT_NAME.to_string(),
                    description: "Merge queue passed".to_string(),
                    target_url: self.config.pr_url(&repo_ref, entry.pr_number),
                },
            )
            .await?;
        self.driver.cleanup_merge_branch(&repo_ref, entry).await;
        self.queue
            .update_state(repo, entry.pr_number, EntryState::Success)
            .await?;
        Ok(())
    }

    /// A required check failed: remove the entry with an explanation and
    /// advance the queue.
    async fn apply_failure(&self, repo: &Repo, entry: &QueueEntry, context: &str) -> Result<()> {
        let repo_ref = RepoRef::from(repo);
        info!(repo = %repo_ref, pr = entry.pr_number, check = context, "Required check failed");

        self.forge
            .post_commit_status(
                &repo_ref,
                &entry.pr_head_sha,
                &CommitStatusOptions {
                    state: StatusState::Failure,
                    context: CONTEXT_NAME.to_string(),
                    description: format!("Check failed: {}", context),
                    target_url: self.config.pr_url(&repo_ref, entry.pr_number),
                },
            )
            .await?;
        self.forge
            .cancel_automerge(&repo_ref, entry.pr_number)
            .await?;
        self.forge
            .post_pull_comment(
                &repo_ref,
                entry.pr_number,
                &format!(
                    "Check `{}` failed on the merge of this PR into `{}`; removed from the \
                     merge queue.",
                    context, entry.target_branch
                ),
            )
            .await?;
        self.driver.cleanup_merge_branch(&repo_ref, entry).await;
        self.queue
            .set_error(repo, entry.pr_number, &format!("Check failed: {}", context))
            .await?;
        self.queue
            .update_state(repo, entry.pr_number, EntryState::Failed)
            .await?;
        self.queue.advance(repo, &entry.target_branch).await?;
        Ok(())
    }

    /// A Testing entry exceeded the check timeout.
    pub async fn apply_check_timeout(&self, repo: &Repo, entry: &QueueEntry) -> Result<()> {
        let repo_ref = RepoRef::from(repo);
        info!(repo = %repo_ref, pr = entry.pr_number, "Check timeout exceeded");

        self.forge
            .post_commit_status(
                &repo_ref,
                &entry.pr_head_sha,
                &CommitStatusOptions {
                    state: StatusState::Error,
                    context: CONTEXT_NAME.to_string(),
                    description: "Check timeout exceeded".to_string(),
                    target_url: self.config.pr_url(&repo_ref, entry.pr_number),
                },
            )
            .await?;
        self.forge
            .cancel_automerge(&repo_ref, entry.pr_number)
            .await?;
        self.forge
            .post_pull_comment(
                &repo_ref,
                entry.pr_number,
                "The merge queue checks for this PR did not finish in time; removed from the \
                 merge queue.",
            )
            .await?;
        self.driver.cleanup_merge_branch(&repo_ref, entry).await;
        self.queue
            .set_error(repo, entry.pr_number, "Check timeout exceeded")
            .await?;
        self.queue
            .update_state(repo, entry.pr_number, EntryState::Failed)
            .await?;
        self.queue.advance(repo, &entry.target_branch).await?;
        Ok(())
    }

    /// A Success entry waited too long for the forge's automerge to merge
    /// the PR.
    pub async fn apply_automerge_timeout(&self, repo: &Repo, entry: &QueueEntry) -> Result<()> {
        let repo_ref = RepoRef::from(repo);
        info!(repo = %repo_ref, pr = entry.pr_number, "Automerge did not complete in time");

        self.forge
            .post_commit_status(
                &repo_ref,
                &entry.pr_head_sha,
                &CommitStatusOptions {
                    state: StatusState::Error,
                    context: CONTEXT_NAME.to_string(),
                    description: "Automerge did not complete in time".to_string(),
                    target_url: self.config.pr_url(&repo_ref, entry.pr_number),
                },
            )
            .await?;
        self.forge
            .cancel_automerge(&repo_ref, entry.pr_number)
            .await?;
        self.forge
            .post_pull_comment(
                &repo_ref,
                entry.pr_number,
                "The merge queue passed, but automerge did not complete in time; removed from \
                 the merge queue.",
            )
            .await?;
        self.driver.cleanup_merge_branch(&repo_ref, entry).await;
        self.queue.dequeue(repo, entry.pr_number).await?;
        self.queue.advance(repo, &entry.target_branch).await?;
        Ok(())
    }

    /// Correlate a reported SHA to the active entry testing it.
    pub async fn find_entry_by_merge_sha(
        &self,
        repo: &Repo,
        sha: &str,
    ) -> Result<Option<QueueEntry>> {
        let active = self.queue.list_active(repo).await?;
        let entry = active
            .into_iter()
            .find(|e| e.merge_branch_sha.as_deref() == Some(sha));
        if entry.is_none() {
            debug!(repo = %repo.full_name(), sha, "No entry for reported SHA");
        }
        Ok(entry)
    }
}
