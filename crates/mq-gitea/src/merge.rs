//! Git plumbing for test-merge branches
//!
//! Produces the merge of a PR head into the latest target branch and pushes
//! it under the merge-branch name. Works in a scratch clone inside a temp
//! directory that is removed on every exit path.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::{ForgeError, Result};

/// Committer identity used for merge commits.
const GIT_USER_NAME: &str = "gitea-mq";
const GIT_USER_EMAIL: &str = "gitea-mq@localhost";

/// Merge `head_sha` into the latest `base_branch` of the repo at
/// `clone_url` and force-push the result to `branch_name`. Returns the
/// merge commit SHA. A conflicting merge is reported as
/// [`ForgeError::MergeConflict`].
pub async fn merge_refs(
    clone_url: &str,
    base_branch: &str,
    head_sha: &str,
    branch_name: &str,
) -> Result<String> {
    let dir = tempfile::tempdir()?;
    let path = dir.path();

    run_git(
        path,
        &[
            "clone",
            "--branch",
            base_branch,
            "--single-branch",
            clone_url,
            ".",
        ],
    )
    .await?;

    run_git(path, &["fetch", "origin", head_sha]).await?;

    let user_name = format!("user.name={}", GIT_USER_NAME);
    let user_email = format!("user.email={}", GIT_USER_EMAIL);
    let message = format!("Merge {} into {}", head_sha, base_branch);
    let merge = Command::new("git")
        .current_dir(path)
        .args([
            "-c",
            user_name.as_str(),
            "-c",
            user_email.as_str(),
            "merge",
            "--no-ff",
            head_sha,
            "-m",
            message.as_str(),
        ])
        .output()
        .await?;

    if !merge.status.success() {
        let stdout = String::from_utf8_lossy(&merge.stdout);
        let stderr = String::from_utf8_lossy(&merge.stderr);
        if stdout.contains("CONFLICT") || stdout.contains("Automatic merge failed") {
            debug!(head_sha, base_branch, "Merge conflict");
            return Err(ForgeError::MergeConflict(format!(
                "{} into {}",
                head_sha, base_branch
            )));
        }
        return Err(ForgeError::Git(format!(
            "git merge failed: {}{}",
            stdout, stderr
        )));
    }

    let sha = run_git(path, &["rev-parse", "HEAD"]).await?.trim().to_string();

    let refspec = format!("HEAD:refs/heads/{}", branch_name);
    run_git(path, &["push", "--force", "origin", refspec.as_str()]).await?;

    Ok(sha)
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await?;

    if !output.status.success() {
        return Err(ForgeError::Git(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
