//! Forge client trait and wire types
//!
//! The forge is a capability set: everything the queue needs from Gitea is
//! behind this trait, so the control plane can run against the production
//! REST implementation or the in-memory mock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mq_core::RepoRef;
use serde::{Deserialize, Serialize};

use crate::Result;

/// One side of a pull request (base or head).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrBranch {
    /// Branch name ("ref" on the wire).
    #[serde(rename = "ref")]
    pub branch: String,
    pub sha: String,
}

/// A pull request as reported by the forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    #[serde(default)]
    pub title: String,
    /// "open" or "closed".
    pub state: String,
    #[serde(default)]
    pub merged: bool,
    pub base: PrBranch,
    pub head: PrBranch,
}

impl PullRequest {
    pub fn is_open(&self) -> bool {
        self.state == "open"
    }
}

/// A typed entry in a PR's timeline. Only the type tag matters to the
/// queue; everything else the forge sends is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineComment {
    #[serde(rename = "type")]
    pub comment_type: String,
    pub created_at: DateTime<Utc>,
}

/// Commit status states accepted by the forge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
    Warning,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

/// Payload for posting a commit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatusOptions {
    pub state: StatusState,
    pub context: String,
    pub description: String,
    pub target_url: String,
}

/// Branch protection rule, reduced to the fields the queue manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchProtection {
    pub branch_name: String,
    #[serde(default)]
    pub enable_status_check: bool,
    #[serde(default)]
    pub status_check_contexts: Vec<String>,
}

/// A repository webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub id: i64,
    #[serde(default)]
    pub events: Vec<String>,
    pub active: bool,
    pub config: HookConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content_type: String,
}

/// Payload for creating a webhook.
#[derive(Debug, Clone, Serialize)]
pub struct CreateHookOptions {
    #[serde(rename = "type")]
    pub hook_type: String,
    pub events: Vec<String>,
    pub active: bool,
    pub config: CreateHookConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateHookConfig {
    pub url: String,
    pub content_type: String,
    pub secret: String,
}

/// A branch, as listed by the forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
}

/// A repository visible to the bot identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepo {
    pub full_name: String,
    #[serde(default)]
    pub permissions: RepoPermissions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoPermissions {
    #[serde(default)]
    pub admin: bool,
}

/// The forge capability set the queue depends on.
///
/// Implementations must be `Send + Sync`; they are shared across the
/// per-repo pollers and the webhook tasks.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Open pull requests for the repo.
    async fn list_open_pulls(&self, repo: &RepoRef) -> Result<Vec<PullRequest>>;

    /// Full PR details; distinguishes merged from merely closed.
    async fn get_pull(&self, repo: &RepoRef, number: i64) -> Result<PullRequest>;

    /// PR timeline, oldest first.
    async fn get_pull_timeline(&self, repo: &RepoRef, number: i64)
        -> Result<Vec<TimelineComment>>;

    /// Post a commit status on a SHA.
    async fn post_commit_status(
        &self,
        repo: &RepoRef,
        sha: &str,
        status: &CommitStatusOptions,
    ) -> Result<()>;

    /// Post a comment on a PR.
    async fn post_pull_comment(&self, repo: &RepoRef, number: i64, body: &str) -> Result<()>;

    /// Cancel a scheduled automerge. Idempotent: a 404 (nothing scheduled)
    /// is success.
    async fn cancel_automerge(&self, repo: &RepoRef, number: i64) -> Result<()>;

    /// Protection rule for one branch; `None` when the branch is
    /// unprotected.
    async fn get_branch_protection(
        &self,
        repo: &RepoRef,
        branch: &str,
    ) -> Result<Option<BranchProtection>>;

    /// All protection rules for the repo.
    async fn list_branch_protections(&self, repo: &RepoRef) -> Result<Vec<BranchProtection>>;

    /// Replace a branch protection rule.
    async fn update_branch_protection(
        &self,
        repo: &RepoRef,
        protection: &BranchProtection,
    ) -> Result<()>;

    async fn list_hooks(&self, repo: &RepoRef) -> Result<Vec<Hook>>;

    async fn create_hook(&self, repo: &RepoRef, options: &CreateHookOptions) -> Result<Hook>;

    async fn list_branches(&self, repo: &RepoRef) -> Result<Vec<Branch>>;

    /// Delete a remote branch. Idempotent: a 404 is success for callers
    /// that treat gone-already as done.
    async fn delete_branch(&self, repo: &RepoRef, name: &str) -> Result<()>;

    /// Merge `head_sha` into the latest `base_branch` and publish the
    /// result as `branch_name`. Returns the merge commit SHA; a semantic
    /// conflict surfaces as [`ForgeError::MergeConflict`].
    async fn merge_into_branch(
        &self,
        repo: &RepoRef,
        base_branch: &str,
        head_sha: &str,
        branch_name: &str,
    ) -> Result<String>;

    /// Repositories visible to the bot identity, with permission flags.
    async fn list_accessible_repos(&self) -> Result<Vec<RemoteRepo>>;

    /// Topic list for a repo.
    async fn get_topics(&self, repo: &RepoRef) -> Result<Vec<String>>;
}
