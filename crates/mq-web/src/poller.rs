//! Per-repo reconciliation loop
//!
//! One poller per managed repo. Each tick observes forge state (open PRs,
//! timelines, head SHAs, merged flags) and drives the queue: discovering
//! newly scheduled automerges, invalidating entries whose PR moved under
//! them, and promoting heads-of-queue into testing. Per-entry failures are
//! collected and logged without aborting the tick; only a forge that is
//! unreachable outright pauses the whole tick.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use mq_core::{
    automerge_scheduled, success_timed_out, timed_out, EntryState, QueueEntry, QueueService, Repo,
    RepoRef, CONTEXT_NAME,
};
use mq_gitea::{CommitStatusOptions, ForgeClient, PullRequest, StatusState};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::checks::Checks;
use crate::config::AppConfig;
use crate::merge_driver::MergeDriver;
use crate::Result;

/// What one tick did. Counts are per entry; `errors` carries per-entry
/// failures that did not abort the tick.
#[derive(Debug, Default)]
pub struct TickReport {
    /// The forge was unreachable; nothing was observed or mutated.
    pub paused: bool,
    pub enqueued: usize,
    pub removed: usize,
    pub promoted: usize,
    pub errors: Vec<String>,
}

impl TickReport {
    fn record(&mut self, context: &str, err: impl std::fmt::Display) {
        warn!(context, error = %err, "Tick step failed");
        self.errors.push(format!("{}: {}", context, err));
    }
}

/// Reconciliation loop for one managed repo.
pub struct Poller {
    forge: Arc<dyn ForgeClient>,
    queue: QueueService,
    driver: MergeDriver,
    checks: Checks,
    config: Arc<AppConfig>,
    repo: Repo,
    repo_ref: RepoRef,
}

impl Poller {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        queue: QueueService,
        driver: MergeDriver,
        checks: Checks,
        config: Arc<AppConfig>,
        repo: Repo,
    ) -> Self {
        let repo_ref = RepoRef::from(&repo);
        Self {
            forge,
            queue,
            driver,
            checks,
            config,
            repo,
            repo_ref,
        }
    }

    /// Run until the shutdown channel signals. The first tick fires
    /// immediately; a tick in progress always completes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(repo = %self.repo_ref, "Poller started");

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.paused {
                        debug!(repo = %self.repo_ref, "Tick paused, forge unreachable");
                    } else if report.enqueued + report.removed + report.promoted > 0
                        || !report.errors.is_empty()
                    {
                        info!(
                            repo = %self.repo_ref,
                            enqueued = report.enqueued,
                            removed = report.removed,
                            promoted = report.promoted,
                            errors = report.errors.len(),
                            "Tick complete"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!(repo = %self.repo_ref, "Poller stopped");
    }

    /// One reconciliation pass.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        // Step 1: observe open PRs. Unreachable forge pauses the tick with
        // state untouched.
        let pulls = match self.forge.list_open_pulls(&self.repo_ref).await {
            Ok(pulls) => pulls,
            Err(e) => {
                warn!(repo = %self.repo_ref, error = %e, "Cannot list open PRs, pausing tick");
                report.paused = true;
                return report;
            }
        };
        let by_number: HashMap<i64, &PullRequest> =
            pulls.iter().map(|pr| (pr.number, pr)).collect();

        // Step 2: discover PRs whose automerge was scheduled since we last
        // looked.
        match self.queue.list_active(&self.repo).await {
            Ok(active) => {
                for pr in &pulls {
                    if active.iter().any(|e| e.pr_number == pr.number) {
                        continue;
                    }
                    if let Err(e) = self.discover_pull(pr, &mut report).await {
                        report.record(&format!("discover #{}", pr.number), e);
                    }
                }
            }
            Err(e) => {
                report.record("list active", e);
                return report;
            }
        }

        // Step 3: reconcile every active entry against the forge's view.
        let active = match self.queue.list_active(&self.repo).await {
            Ok(active) => active,
            Err(e) => {
                report.record("list active", e);
                return report;
            }
        };
        for entry in &active {
            if let Err(e) = self.reconcile_entry(entry, &by_number, &mut report).await {
                report.record(&format!("reconcile #{}", entry.pr_number), e);
            }
        }

        // Step 4: promote queued heads into testing.
        if let Err(e) = self.promote_heads(&mut report).await {
            report.record("promote", e);
        }

        report
    }

    /// Enqueue an open PR whose timeline says automerge is scheduled.
    async fn discover_pull(&self, pr: &PullRequest, report: &mut TickReport) -> Result<()> {
        let timeline = self
            .forge
            .get_pull_timeline(&self.repo_ref, pr.number)
            .await?;
        if !automerge_scheduled(timeline.iter().map(|c| c.comment_type.as_str())) {
            return Ok(());
        }

        let outcome = self
            .queue
            .enqueue(&self.repo, pr.number, &pr.head.sha, &pr.base.branch)
            .await?;
        if !outcome.is_new {
            return Ok(());
        }

        info!(
            repo = %self.repo_ref,
            pr = pr.number,
            position = outcome.position,
            "PR joined the merge queue"
        );
        report.enqueued += 1;

        self.forge
            .post_commit_status(
                &self.repo_ref,
                &pr.head.sha,
                &CommitStatusOptions {
                    state: StatusState::Pending,
                    context: CONTEXT_NAME.to_string(),
                    description: format!("Queued (position #{})", outcome.position),
                    target_url: self.config.pr_url(&self.repo_ref, pr.number),
                },
            )
            .await?;
        Ok(())
    }

    /// Check one active entry against the forge, in strict precedence:
    /// PR gone, target changed, head changed, automerge cancelled,
    /// automerge overdue, checks overdue.
    async fn reconcile_entry(
        &self,
        entry: &QueueEntry,
        open_pulls: &HashMap<i64, &PullRequest>,
        report: &mut TickReport,
    ) -> Result<()> {
        let Some(pr) = open_pulls.get(&entry.pr_number) else {
            return self.remove_closed(entry, report).await;
        };

        if pr.base.branch != entry.target_branch {
            info!(
                repo = %self.repo_ref,
                pr = entry.pr_number,
                old = %entry.target_branch,
                new = %pr.base.branch,
                "Target branch changed, removing from queue"
            );
            self.forge
                .cancel_automerge(&self.repo_ref, entry.pr_number)
                .await?;
            self.forge
                .post_pull_comment(
                    &self.repo_ref,
                    entry.pr_number,
                    &format!(
                        "The target branch changed from `{}` to `{}`; removed from the merge \
                         queue. Schedule the merge again to re-enter.",
                        entry.target_branch, pr.base.branch
                    ),
                )
                .await?;
            self.queue.dequeue(&self.repo, entry.pr_number).await?;
            self.driver.cleanup_merge_branch(&self.repo_ref, entry).await;
            report.removed += 1;
            return Ok(());
        }

        if pr.head.sha != entry.pr_head_sha {
            info!(
                repo = %self.repo_ref,
                pr = entry.pr_number,
                old = %entry.pr_head_sha,
                new = %pr.head.sha,
                "New commits pushed, removing from queue"
            );
            self.forge
                .cancel_automerge(&self.repo_ref, entry.pr_number)
                .await?;
            self.forge
                .post_pull_comment(
                    &self.repo_ref,
                    entry.pr_number,
                    "New commits were pushed while this PR was in the merge queue; removed. \
                     Schedule the merge again to re-enter.",
                )
                .await?;
            self.queue.dequeue(&self.repo, entry.pr_number).await?;
            self.driver.cleanup_merge_branch(&self.repo_ref, entry).await;
            report.removed += 1;
            return Ok(());
        }

        let timeline = self
            .forge
            .get_pull_timeline(&self.repo_ref, entry.pr_number)
            .await?;
        if !automerge_scheduled(timeline.iter().map(|c| c.comment_type.as_str())) {
            info!(
                repo = %self.repo_ref,
                pr = entry.pr_number,
                "Automerge cancelled by user, removing from queue"
            );
            self.queue.dequeue(&self.repo, entry.pr_number).await?;
            self.driver.cleanup_merge_branch(&self.repo_ref, entry).await;
            report.removed += 1;
            return Ok(());
        }

        let now = Utc::now();
        if success_timed_out(entry, now, self.config.success_timeout) {
            self.checks
                .apply_automerge_timeout(&self.repo, entry)
                .await?;
            report.removed += 1;
            return Ok(());
        }

        if timed_out(entry, now, self.config.check_timeout) {
            self.checks.apply_check_timeout(&self.repo, entry).await?;
            report.removed += 1;
        }

        Ok(())
    }

    /// The PR is no longer open: merged means done (dequeue and advance);
    /// closed without merging means silent removal.
    async fn remove_closed(&self, entry: &QueueEntry, report: &mut TickReport) -> Result<()> {
        let pr = self.forge.get_pull(&self.repo_ref, entry.pr_number).await?;

        if pr.merged {
            info!(repo = %self.repo_ref, pr = entry.pr_number, "PR merged, advancing queue");
        } else {
            info!(repo = %self.repo_ref, pr = entry.pr_number, "PR closed, removing from queue");
        }

        self.queue.dequeue(&self.repo, entry.pr_number).await?;
        self.driver.cleanup_merge_branch(&self.repo_ref, entry).await;
        report.removed += 1;
        Ok(())
    }

    /// For each target branch with active entries, take a Queued head into
    /// testing.
    async fn promote_heads(&self, report: &mut TickReport) -> Result<()> {
        let active = self.queue.list_active(&self.repo).await?;

        let mut targets: Vec<&str> = active.iter().map(|e| e.target_branch.as_str()).collect();
        targets.dedup();

        for target in targets {
            let head = match self.queue.head(&self.repo, target).await? {
                Some(head) => head,
                None => continue,
            };
            if head.state != EntryState::Queued {
                continue;
            }

            match self.driver.start_testing(&self.repo, &head).await {
                Ok(outcome) if outcome.removed => report.removed += 1,
                Ok(_) => report.promoted += 1,
                Err(e) => report.record(&format!("start testing #{}", head.pr_number), e),
            }
        }

        Ok(())
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }
}
