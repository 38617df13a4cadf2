//! mq-gitea - Gitea client for the merge queue
//!
//! The forge surface the control plane consumes:
//! - The [`ForgeClient`] capability trait and its wire types
//! - The production REST implementation ([`GiteaClient`])
//! - Git plumbing that produces test-merge branches
//! - A scriptable in-memory mock for tests

pub mod api;
pub mod client;
pub mod error;
mod merge;
pub mod mock;

pub use api::GiteaClient;
pub use client::{
    Branch, BranchProtection, CommitStatusOptions, CreateHookConfig, CreateHookOptions,
    ForgeClient, Hook, HookConfig, PrBranch, PullRequest, RemoteRepo, RepoPermissions,
    StatusState, TimelineComment,
};
pub use error::{ForgeError, Result};
pub use mock::{MockForge, PostedComment, PostedStatus};
