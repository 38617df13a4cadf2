//! Integration tests for merge-branch lifecycle management.

mod common;

use common::harness;
use mq_core::{EntryState, RepoRef};
use mq_web::merge_branch_name;

#[tokio::test]
async fn test_merge_branch_name_uses_fixed_prefix() {
    assert_eq!(merge_branch_name(42), "gitea-mq/42");
}

#[tokio::test]
async fn test_start_testing_records_artifact_and_gates_head() {
    let h = harness("org", "app").await;
    h.forge.add_pull("org/app", 42, "main", "abc123");

    let entry = h.queue.enqueue(&h.repo, 42, "abc123", "main").await.unwrap().entry;
    let outcome = h.driver.start_testing(&h.repo, &entry).await.unwrap();

    assert!(!outcome.removed);
    let (branch, sha) = outcome.merge_branch.unwrap();
    assert_eq!(branch, "gitea-mq/42");
    assert_eq!(sha, "merge-abc123");

    let entry = h.queue.get_entry(&h.repo, 42).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Testing);
    assert!(entry.testing_started_at.is_some());

    // The gating status goes on the PR head, not the merge commit.
    let statuses = h.forge.posted_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].sha, "abc123");
    assert_eq!(statuses[0].status.description, "Testing merge result");
}

#[tokio::test]
async fn test_cleanup_stale_spares_recorded_branches() {
    let h = harness("org", "app").await;
    h.forge.add_branch("org/app", "gitea-mq/1");
    h.forge.add_branch("org/app", "gitea-mq/2");
    h.forge.add_branch("org/app", "feature/x");

    // Entry 2 is active and owns its branch; 1 is an orphan.
    h.queue.enqueue(&h.repo, 2, "bbb", "main").await.unwrap();
    h.queue
        .set_merge_branch(&h.repo, 2, "gitea-mq/2", "merge-bbb")
        .await
        .unwrap();

    h.driver.cleanup_stale(&h.repo).await.unwrap();

    let mut remaining = h.forge.branch_names("org/app");
    remaining.sort();
    assert_eq!(remaining, vec!["feature/x", "gitea-mq/2"]);
}

#[tokio::test]
async fn test_cleanup_merge_branch_tolerates_missing_branch() {
    let h = harness("org", "app").await;

    h.queue.enqueue(&h.repo, 42, "abc123", "main").await.unwrap();
    h.queue
        .set_merge_branch(&h.repo, 42, "gitea-mq/42", "def456")
        .await
        .unwrap();
    let entry = h.queue.get_entry(&h.repo, 42).await.unwrap().unwrap();

    // Branch never created on the forge; deletion must be a quiet no-op.
    h.driver
        .cleanup_merge_branch(&RepoRef::new("org", "app"), &entry)
        .await;
    assert!(h.forge.deleted_branches().is_empty());
}
