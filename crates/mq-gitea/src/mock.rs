//! In-memory forge for tests
//!
//! Scriptable [`ForgeClient`] implementation: tests preload repos, PRs,
//! timelines, and merge outcomes, then assert on the statuses, comments,
//! and branch operations the system performed.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use mq_core::RepoRef;

use crate::client::{
    Branch, BranchProtection, CommitStatusOptions, CreateHookOptions, ForgeClient, Hook,
    HookConfig, PrBranch, PullRequest, RemoteRepo, RepoPermissions, TimelineComment,
};
use crate::{ForgeError, Result};

/// A commit status recorded by the mock.
#[derive(Debug, Clone)]
pub struct PostedStatus {
    pub repo: String,
    pub sha: String,
    pub status: CommitStatusOptions,
}

/// A PR comment recorded by the mock.
#[derive(Debug, Clone)]
pub struct PostedComment {
    pub repo: String,
    pub number: i64,
    pub body: String,
}

#[derive(Default)]
struct MockState {
    unreachable: bool,
    repos: Vec<RemoteRepo>,
    topics: HashMap<String, Vec<String>>,
    topics_fail: HashSet<String>,
    pulls: HashMap<String, Vec<PullRequest>>,
    timelines: HashMap<(String, i64), Vec<TimelineComment>>,
    protections: HashMap<(String, String), BranchProtection>,
    hooks: HashMap<String, Vec<Hook>>,
    next_hook_id: i64,
    branches: HashMap<String, Vec<String>>,
    merge_conflicts: HashSet<String>,
    merge_failures: HashSet<String>,
    statuses: Vec<PostedStatus>,
    comments: Vec<PostedComment>,
    cancelled: Vec<(String, i64)>,
    deleted_branches: Vec<(String, String)>,
}

/// Scriptable in-memory forge.
#[derive(Default)]
pub struct MockForge {
    state: Mutex<MockState>,
}

impl MockForge {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock forge state poisoned")
    }

    // ==================== Scripting ====================

    /// Simulate the forge being unreachable (every call fails transiently).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Register a repository visible to the bot identity.
    pub fn add_repo(&self, full_name: &str, admin: bool, topics: &[&str]) {
        let mut state = self.state();
        state.repos.push(RemoteRepo {
            full_name: full_name.to_string(),
            permissions: RepoPermissions { admin },
        });
        state.topics.insert(
            full_name.to_string(),
            topics.iter().map(|t| t.to_string()).collect(),
        );
    }

    pub fn set_topics(&self, full_name: &str, topics: &[&str]) {
        self.state().topics.insert(
            full_name.to_string(),
            topics.iter().map(|t| t.to_string()).collect(),
        );
    }

    /// Make topic fetches for the repo fail with a server error.
    pub fn set_topics_fail(&self, full_name: &str, fail: bool) {
        if fail {
            self.state().topics_fail.insert(full_name.to_string());
        } else {
            self.state().topics_fail.remove(full_name);
        }
    }

    /// Add an open PR.
    pub fn add_pull(
        &self,
        repo: &str,
        number: i64,
        target_branch: &str,
        head_sha: &str,
    ) -> PullRequest {
        let pr = PullRequest {
            number,
            title: format!("PR #{}", number),
            state: "open".to_string(),
            merged: false,
            base: PrBranch {
                branch: target_branch.to_string(),
                sha: format!("{}-base", target_branch),
            },
            head: PrBranch {
                branch: format!("feature/{}", number),
                sha: head_sha.to_string(),
            },
        };
        self.state()
            .pulls
            .entry(repo.to_string())
            .or_default()
            .push(pr.clone());
        pr
    }

    fn with_pull(&self, repo: &str, number: i64, f: impl FnOnce(&mut PullRequest)) {
        let mut state = self.state();
        if let Some(pr) = state
            .pulls
            .get_mut(repo)
            .and_then(|prs| prs.iter_mut().find(|p| p.number == number))
        {
            f(pr);
        }
    }

    /// Close the PR, optionally as merged.
    pub fn close_pull(&self, repo: &str, number: i64, merged: bool) {
        self.with_pull(repo, number, |pr| {
            pr.state = "closed".to_string();
            pr.merged = merged;
        });
    }

    pub fn set_head_sha(&self, repo: &str, number: i64, sha: &str) {
        self.with_pull(repo, number, |pr| pr.head.sha = sha.to_string());
    }

    pub fn set_target_branch(&self, repo: &str, number: i64, branch: &str) {
        self.with_pull(repo, number, |pr| pr.base.branch = branch.to_string());
    }

    /// Replace the PR timeline with comments of the given type tags.
    pub fn set_timeline(&self, repo: &str, number: i64, comment_types: &[&str]) {
        let comments = comment_types
            .iter()
            .map(|t| TimelineComment {
                comment_type: t.to_string(),
                created_at: Utc::now(),
            })
            .collect();
        self.state()
            .timelines
            .insert((repo.to_string(), number), comments);
    }

    pub fn set_protection(&self, repo: &str, protection: BranchProtection) {
        self.state().protections.insert(
            (repo.to_string(), protection.branch_name.clone()),
            protection,
        );
    }

    pub fn add_branch(&self, repo: &str, name: &str) {
        self.state()
            .branches
            .entry(repo.to_string())
            .or_default()
            .push(name.to_string());
    }

    /// Script `merge_into_branch` for the head SHA to report a conflict.
    pub fn set_merge_conflict(&self, head_sha: &str) {
        self.state().merge_conflicts.insert(head_sha.to_string());
    }

    /// Script `merge_into_branch` for the head SHA to fail generically.
    pub fn set_merge_failure(&self, head_sha: &str) {
        self.state().merge_failures.insert(head_sha.to_string());
    }

    // ==================== Assertions ====================

    pub fn posted_statuses(&self) -> Vec<PostedStatus> {
        self.state().statuses.clone()
    }

    pub fn posted_comments(&self) -> Vec<PostedComment> {
        self.state().comments.clone()
    }

    pub fn cancelled_automerges(&self) -> Vec<(String, i64)> {
        self.state().cancelled.clone()
    }

    pub fn deleted_branches(&self) -> Vec<(String, String)> {
        self.state().deleted_branches.clone()
    }

    pub fn branch_names(&self, repo: &str) -> Vec<String> {
        self.state().branches.get(repo).cloned().unwrap_or_default()
    }

    pub fn hook_urls(&self, repo: &str) -> Vec<String> {
        self.state()
            .hooks
            .get(repo)
            .map(|hooks| hooks.iter().map(|h| h.config.url.clone()).collect())
            .unwrap_or_default()
    }

    pub fn protection(&self, repo: &str, branch: &str) -> Option<BranchProtection> {
        self.state()
            .protections
            .get(&(repo.to_string(), branch.to_string()))
            .cloned()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.state().unreachable {
            Err(ForgeError::Api {
                status: 503,
                message: "forge unreachable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ForgeClient for MockForge {
    async fn list_open_pulls(&self, repo: &RepoRef) -> Result<Vec<PullRequest>> {
        self.check_reachable()?;
        Ok(self
            .state()
            .pulls
            .get(&repo.full_name())
            .map(|prs| prs.iter().filter(|p| p.is_open()).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_pull(&self, repo: &RepoRef, number: i64) -> Result<PullRequest> {
        self.check_reachable()?;
        self.state()
            .pulls
            .get(&repo.full_name())
            .and_then(|prs| prs.iter().find(|p| p.number == number))
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("pull {}", number)))
    }

    async fn get_pull_timeline(
        &self,
        repo: &RepoRef,
        number: i64,
    ) -> Result<Vec<TimelineComment>> {
        self.check_reachable()?;
        Ok(self
            .state()
            .timelines
            .get(&(repo.full_name(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn post_commit_status(
        &self,
        repo: &RepoRef,
        sha: &str,
        status: &CommitStatusOptions,
    ) -> Result<()> {
        self.check_reachable()?;
        self.state().statuses.push(PostedStatus {
            repo: repo.full_name(),
            sha: sha.to_string(),
            status: status.clone(),
        });
        Ok(())
    }

    async fn post_pull_comment(&self, repo: &RepoRef, number: i64, body: &str) -> Result<()> {
        self.check_reachable()?;
        self.state().comments.push(PostedComment {
            repo: repo.full_name(),
            number,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn cancel_automerge(&self, repo: &RepoRef, number: i64) -> Result<()> {
        self.check_reachable()?;
        self.state().cancelled.push((repo.full_name(), number));
        Ok(())
    }

    async fn get_branch_protection(
        &self,
        repo: &RepoRef,
        branch: &str,
    ) -> Result<Option<BranchProtection>> {
        self.check_reachable()?;
        Ok(self.protection(&repo.full_name(), branch))
    }

    async fn list_branch_protections(&self, repo: &RepoRef) -> Result<Vec<BranchProtection>> {
        self.check_reachable()?;
        let full_name = repo.full_name();
        Ok(self
            .state()
            .protections
            .iter()
            .filter(|((r, _), _)| r == &full_name)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn update_branch_protection(
        &self,
        repo: &RepoRef,
        protection: &BranchProtection,
    ) -> Result<()> {
        self.check_reachable()?;
        self.state().protections.insert(
            (repo.full_name(), protection.branch_name.clone()),
            protection.clone(),
        );
        Ok(())
    }

    async fn list_hooks(&self, repo: &RepoRef) -> Result<Vec<Hook>> {
        self.check_reachable()?;
        Ok(self
            .state()
            .hooks
            .get(&repo.full_name())
            .cloned()
            .unwrap_or_default())
    }

    async fn create_hook(&self, repo: &RepoRef, options: &CreateHookOptions) -> Result<Hook> {
        self.check_reachable()?;
        let mut state = self.state();
        state.next_hook_id += 1;
        let hook = Hook {
            id: state.next_hook_id,
            events: options.events.clone(),
            active: options.active,
            config: HookConfig {
                url: options.config.url.clone(),
                content_type: options.config.content_type.clone(),
            },
        };
        state
            .hooks
            .entry(repo.full_name())
            .or_default()
            .push(hook.clone());
        Ok(hook)
    }

    async fn list_branches(&self, repo: &RepoRef) -> Result<Vec<Branch>> {
        self.check_reachable()?;
        Ok(self
            .state()
            .branches
            .get(&repo.full_name())
            .map(|names| {
                names
                    .iter()
                    .map(|name| Branch { name: name.clone() })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_branch(&self, repo: &RepoRef, name: &str) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state();
        let full_name = repo.full_name();
        let existed = state
            .branches
            .get_mut(&full_name)
            .map(|names| {
                let before = names.len();
                names.retain(|n| n != name);
                names.len() < before
            })
            .unwrap_or(false);

        if !existed {
            return Err(ForgeError::NotFound(format!("branch {}", name)));
        }

        state.deleted_branches.push((full_name, name.to_string()));
        Ok(())
    }

    async fn merge_into_branch(
        &self,
        repo: &RepoRef,
        base_branch: &str,
        head_sha: &str,
        branch_name: &str,
    ) -> Result<String> {
        self.check_reachable()?;
        let mut state = self.state();

        if state.merge_conflicts.contains(head_sha) {
            return Err(ForgeError::MergeConflict(format!(
                "{} into {}",
                head_sha, base_branch
            )));
        }
        if state.merge_failures.contains(head_sha) {
            return Err(ForgeError::Git(format!("scripted failure for {}", head_sha)));
        }

        let branches = state.branches.entry(repo.full_name()).or_default();
        if !branches.iter().any(|n| n == branch_name) {
            branches.push(branch_name.to_string());
        }
        Ok(format!("merge-{}", head_sha))
    }

    async fn list_accessible_repos(&self) -> Result<Vec<RemoteRepo>> {
        self.check_reachable()?;
        Ok(self.state().repos.clone())
    }

    async fn get_topics(&self, repo: &RepoRef) -> Result<Vec<String>> {
        self.check_reachable()?;
        let state = self.state();
        let full_name = repo.full_name();
        if state.topics_fail.contains(&full_name) {
            return Err(ForgeError::Api {
                status: 500,
                message: "topics fetch failed".to_string(),
            });
        }
        Ok(state.topics.get(&full_name).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_statuses_and_comments() {
        let forge = MockForge::new();
        let repo = RepoRef::new("org", "app");

        forge.add_pull("org/app", 42, "main", "abc123");
        forge
            .post_pull_comment(&repo, 42, "merge conflict with target branch")
            .await
            .unwrap();

        let comments = forge.posted_comments();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].number, 42);
    }

    #[tokio::test]
    async fn test_mock_unreachable_is_transient() {
        let forge = MockForge::new();
        forge.set_unreachable(true);
        let repo = RepoRef::new("org", "app");

        let err = forge.list_open_pulls(&repo).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_mock_merge_outcomes() {
        let forge = MockForge::new();
        let repo = RepoRef::new("org", "app");

        let sha = forge
            .merge_into_branch(&repo, "main", "abc123", "gitea-mq/42")
            .await
            .unwrap();
        assert_eq!(sha, "merge-abc123");
        assert_eq!(forge.branch_names("org/app"), vec!["gitea-mq/42"]);

        forge.set_merge_conflict("bad456");
        let err = forge
            .merge_into_branch(&repo, "main", "bad456", "gitea-mq/43")
            .await
            .unwrap_err();
        assert!(err.is_merge_conflict());
    }

    #[tokio::test]
    async fn test_mock_delete_missing_branch_is_not_found() {
        let forge = MockForge::new();
        let repo = RepoRef::new("org", "app");

        let err = forge.delete_branch(&repo, "gitea-mq/1").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
