//! Gitea REST client
//!
//! Production implementation of [`ForgeClient`] against Gitea's `/api/v1`.
//! Status codes are folded into error kinds: 404 becomes
//! [`ForgeError::NotFound`], server-side failures stay distinguishable as
//! transient.

use async_trait::async_trait;
use mq_core::RepoRef;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::client::{
    Branch, BranchProtection, CommitStatusOptions, CreateHookOptions, ForgeClient, Hook,
    PullRequest, RemoteRepo, TimelineComment,
};
use crate::merge;
use crate::{ForgeError, Result};

const PAGE_SIZE: usize = 50;

/// Gitea API client.
pub struct GiteaClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl GiteaClient {
    /// Create a client for the Gitea instance at `base_url` (no trailing
    /// `/api/v1`).
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// Clone URL for the repo with token credentials embedded, for the git
    /// plumbing that produces merge branches.
    fn authenticated_clone_url(&self, repo: &RepoRef) -> String {
        let (scheme, rest) = self
            .base_url
            .split_once("://")
            .unwrap_or(("https", self.base_url.as_str()));
        format!(
            "{}://oauth2:{}@{}/{}/{}.git",
            scheme,
            self.token.expose_secret(),
            rest,
            repo.owner,
            repo.name
        )
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req
            .header(
                "Authorization",
                format!("token {}", self.token.expose_secret()),
            )
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let message = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(ForgeError::NotFound(message))
        } else {
            Err(ForgeError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.send(self.http.get(self.api_url(path))).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ForgeClient for GiteaClient {
    async fn list_open_pulls(&self, repo: &RepoRef) -> Result<Vec<PullRequest>> {
        let mut pulls = Vec::new();
        for page in 1.. {
            let path = format!(
                "/repos/{}/{}/pulls?state=open&page={}&limit={}",
                repo.owner, repo.name, page, PAGE_SIZE
            );
            let batch: Vec<PullRequest> = self.get_json(&path).await?;
            let done = batch.len() < PAGE_SIZE;
            pulls.extend(batch);
            if done {
                break;
            }
        }
        Ok(pulls)
    }

    async fn get_pull(&self, repo: &RepoRef, number: i64) -> Result<PullRequest> {
        self.get_json(&format!("/repos/{}/{}/pulls/{}", repo.owner, repo.name, number))
            .await
    }

    async fn get_pull_timeline(
        &self,
        repo: &RepoRef,
        number: i64,
    ) -> Result<Vec<TimelineComment>> {
        let mut timeline = Vec::new();
        for page in 1.. {
            let path = format!(
                "/repos/{}/{}/issues/{}/timeline?page={}&limit={}",
                repo.owner, repo.name, number, page, PAGE_SIZE
            );
            let batch: Vec<TimelineComment> = self.get_json(&path).await?;
            let done = batch.len() < PAGE_SIZE;
            timeline.extend(batch);
            if done {
                break;
            }
        }
        Ok(timeline)
    }

    async fn post_commit_status(
        &self,
        repo: &RepoRef,
        sha: &str,
        status: &CommitStatusOptions,
    ) -> Result<()> {
        debug!(repo = %repo, sha, context = %status.context, state = status.state.as_str(), "Posting commit status");
        let path = format!("/repos/{}/{}/statuses/{}", repo.owner, repo.name, sha);
        self.send(self.http.post(self.api_url(&path)).json(status))
            .await?;
        Ok(())
    }

    async fn post_pull_comment(&self, repo: &RepoRef, number: i64, body: &str) -> Result<()> {
        let path = format!(
            "/repos/{}/{}/issues/{}/comments",
            repo.owner, repo.name, number
        );
        self.send(
            self.http
                .post(self.api_url(&path))
                .json(&serde_json::json!({ "body": body })),
        )
        .await?;
        Ok(())
    }

    async fn cancel_automerge(&self, repo: &RepoRef, number: i64) -> Result<()> {
        let path = format!("/repos/{}/{}/pulls/{}/merge", repo.owner, repo.name, number);
        match self.send(self.http.delete(self.api_url(&path))).await {
            Ok(_) => Ok(()),
            // Nothing scheduled: already in the desired state.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_branch_protection(
        &self,
        repo: &RepoRef,
        branch: &str,
    ) -> Result<Option<BranchProtection>> {
        let path = format!(
            "/repos/{}/{}/branch_protections/{}",
            repo.owner, repo.name, branch
        );
        match self.get_json(&path).await {
            Ok(protection) => Ok(Some(protection)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_branch_protections(&self, repo: &RepoRef) -> Result<Vec<BranchProtection>> {
        self.get_json(&format!(
            "/repos/{}/{}/branch_protections",
            repo.owner, repo.name
        ))
        .await
    }

    async fn update_branch_protection(
        &self,
        repo: &RepoRef,
        protection: &BranchProtection,
    ) -> Result<()> {
        let path = format!(
            "/repos/{}/{}/branch_protections/{}",
            repo.owner, repo.name, protection.branch_name
        );
        self.send(self.http.patch(self.api_url(&path)).json(protection))
            .await?;
        Ok(())
    }

    async fn list_hooks(&self, repo: &RepoRef) -> Result<Vec<Hook>> {
        self.get_json(&format!("/repos/{}/{}/hooks", repo.owner, repo.name))
            .await
    }

    async fn create_hook(&self, repo: &RepoRef, options: &CreateHookOptions) -> Result<Hook> {
        let path = format!("/repos/{}/{}/hooks", repo.owner, repo.name);
        let resp = self
            .send(self.http.post(self.api_url(&path)).json(options))
            .await?;
        Ok(resp.json().await?)
    }

    async fn list_branches(&self, repo: &RepoRef) -> Result<Vec<Branch>> {
        let mut branches = Vec::new();
        for page in 1.. {
            let path = format!(
                "/repos/{}/{}/branches?page={}&limit={}",
                repo.owner, repo.name, page, PAGE_SIZE
            );
            let batch: Vec<Branch> = self.get_json(&path).await?;
            let done = batch.len() < PAGE_SIZE;
            branches.extend(batch);
            if done {
                break;
            }
        }
        Ok(branches)
    }

    async fn delete_branch(&self, repo: &RepoRef, name: &str) -> Result<()> {
        let path = format!("/repos/{}/{}/branches/{}", repo.owner, repo.name, name);
        self.send(self.http.delete(self.api_url(&path))).await?;
        Ok(())
    }

    async fn merge_into_branch(
        &self,
        repo: &RepoRef,
        base_branch: &str,
        head_sha: &str,
        branch_name: &str,
    ) -> Result<String> {
        merge::merge_refs(
            &self.authenticated_clone_url(repo),
            base_branch,
            head_sha,
            branch_name,
        )
        .await
    }

    async fn list_accessible_repos(&self) -> Result<Vec<RemoteRepo>> {
        let mut repos = Vec::new();
        for page in 1.. {
            let path = format!("/user/repos?page={}&limit={}", page, PAGE_SIZE);
            let batch: Vec<RemoteRepo> = self.get_json(&path).await?;
            let done = batch.len() < PAGE_SIZE;
            repos.extend(batch);
            if done {
                break;
            }
        }
        Ok(repos)
    }

    async fn get_topics(&self, repo: &RepoRef) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Topics {
            topics: Vec<String>,
        }

        let topics: Topics = self
            .get_json(&format!("/repos/{}/{}/topics", repo.owner, repo.name))
            .await?;
        Ok(topics.topics)
    }
}
