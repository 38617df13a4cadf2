//! Store and queue service tests against an in-memory database.

use crate::database::Store;
use crate::queue::{CheckState, EntryState};
use crate::queue_service::QueueService;

async fn service() -> QueueService {
    QueueService::new(Store::in_memory().await.unwrap())
}

#[tokio::test]
async fn test_file_backed_store_applies_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let store = Store::new(&path).await.unwrap();
    let repo = store.get_or_create_repo("org", "app").await.unwrap();
    assert_eq!(repo.full_name(), "org/app");

    // Reopening finds the same row: state survives restarts.
    drop(store);
    let store = Store::new(&path).await.unwrap();
    let again = store.get_or_create_repo("org", "app").await.unwrap();
    assert_eq!(again.id, repo.id);
}

#[tokio::test]
async fn test_get_or_create_repo_is_upsert() {
    let store = Store::in_memory().await.unwrap();

    let a = store.get_or_create_repo("org", "app").await.unwrap();
    let b = store.get_or_create_repo("org", "app").await.unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(a.full_name(), "org/app");

    let other = store.get_or_create_repo("org", "lib").await.unwrap();
    assert_ne!(a.id, other.id);
}

#[tokio::test]
async fn test_enqueue_is_idempotent() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    let first = svc.enqueue(&repo, 42, "abc123", "main").await.unwrap();
    assert!(first.is_new);
    assert_eq!(first.position, 1);
    assert_eq!(first.entry.state, EntryState::Queued);
    assert!(first.entry.merge_branch_sha.is_none());

    let second = svc.enqueue(&repo, 42, "abc123", "main").await.unwrap();
    assert!(!second.is_new);
    assert_eq!(second.position, 1);
    assert_eq!(second.entry.id, first.entry.id);
}

#[tokio::test]
async fn test_positions_are_per_target_branch() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    let a = svc.enqueue(&repo, 1, "aaa", "main").await.unwrap();
    let b = svc.enqueue(&repo, 2, "bbb", "main").await.unwrap();
    let c = svc.enqueue(&repo, 3, "ccc", "develop").await.unwrap();

    assert_eq!(a.position, 1);
    assert_eq!(b.position, 2);
    assert_eq!(c.position, 1);
}

#[tokio::test]
async fn test_head_is_oldest_active() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    assert!(svc.head(&repo, "main").await.unwrap().is_none());

    svc.enqueue(&repo, 1, "aaa", "main").await.unwrap();
    svc.enqueue(&repo, 2, "bbb", "main").await.unwrap();

    let head = svc.head(&repo, "main").await.unwrap().unwrap();
    assert_eq!(head.pr_number, 1);
}

#[tokio::test]
async fn test_dequeue_reports_was_head() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    svc.enqueue(&repo, 1, "aaa", "main").await.unwrap();
    svc.enqueue(&repo, 2, "bbb", "main").await.unwrap();

    let non_head = svc.dequeue(&repo, 2).await.unwrap();
    assert!(non_head.found);
    assert!(!non_head.was_head);

    let head = svc.dequeue(&repo, 1).await.unwrap();
    assert!(head.found);
    assert!(head.was_head);
}

#[tokio::test]
async fn test_dequeue_missing_is_noop() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    let outcome = svc.dequeue(&repo, 99).await.unwrap();
    assert!(!outcome.found);
    assert!(!outcome.was_head);
    assert!(outcome.entry.is_none());
}

#[tokio::test]
async fn test_update_state_sets_timing_columns() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    svc.enqueue(&repo, 42, "abc123", "main").await.unwrap();

    svc.update_state(&repo, 42, EntryState::Testing).await.unwrap();
    let entry = svc.get_entry(&repo, 42).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Testing);
    assert!(entry.testing_started_at.is_some());
    assert!(entry.completed_at.is_none());

    svc.update_state(&repo, 42, EntryState::Success).await.unwrap();
    let entry = svc.get_entry(&repo, 42).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Success);
    assert!(entry.completed_at.is_some());
}

#[tokio::test]
async fn test_set_merge_branch_and_error() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    svc.enqueue(&repo, 42, "abc123", "main").await.unwrap();
    svc.set_merge_branch(&repo, 42, "gitea-mq/42", "def456")
        .await
        .unwrap();
    svc.set_error(&repo, 42, "check failed: ci/lint").await.unwrap();

    let entry = svc.get_entry(&repo, 42).await.unwrap().unwrap();
    assert_eq!(entry.merge_branch_name.as_deref(), Some("gitea-mq/42"));
    assert_eq!(entry.merge_branch_sha.as_deref(), Some("def456"));
    assert_eq!(entry.error_message.as_deref(), Some("check failed: ci/lint"));
}

#[tokio::test]
async fn test_advance_drops_terminal_rows_and_returns_next() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    svc.enqueue(&repo, 1, "aaa", "main").await.unwrap();
    svc.enqueue(&repo, 2, "bbb", "main").await.unwrap();

    svc.update_state(&repo, 1, EntryState::Testing).await.unwrap();
    svc.update_state(&repo, 1, EntryState::Failed).await.unwrap();

    let next = svc.advance(&repo, "main").await.unwrap().unwrap();
    assert_eq!(next.pr_number, 2);
    assert_eq!(next.state, EntryState::Queued);

    // The failed row is gone.
    assert!(svc.get_entry(&repo, 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_advance_on_empty_queue() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    assert!(svc.advance(&repo, "main").await.unwrap().is_none());
}

#[tokio::test]
async fn test_check_status_upsert_latest_wins() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    let entry = svc.enqueue(&repo, 42, "abc123", "main").await.unwrap().entry;

    svc.save_check_status(&entry, "ci/build", CheckState::Pending)
        .await
        .unwrap();
    svc.save_check_status(&entry, "ci/build", CheckState::Success)
        .await
        .unwrap();
    svc.save_check_status(&entry, "ci/lint", CheckState::Failure)
        .await
        .unwrap();

    let statuses = svc.get_check_statuses(&entry).await.unwrap();
    assert_eq!(statuses.len(), 2);

    let build = statuses.iter().find(|s| s.context == "ci/build").unwrap();
    assert_eq!(build.state, CheckState::Success);
}

#[tokio::test]
async fn test_check_statuses_deleted_with_entry() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    let entry = svc.enqueue(&repo, 42, "abc123", "main").await.unwrap().entry;
    svc.save_check_status(&entry, "ci/build", CheckState::Success)
        .await
        .unwrap();

    svc.dequeue(&repo, 42).await.unwrap();

    let statuses = svc.store().get_check_statuses(entry.id).await.unwrap();
    assert!(statuses.is_empty());
}

#[tokio::test]
async fn test_dequeue_all() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();
    let other = svc.store().get_or_create_repo("org", "lib").await.unwrap();

    svc.enqueue(&repo, 1, "aaa", "main").await.unwrap();
    svc.enqueue(&repo, 2, "bbb", "main").await.unwrap();
    svc.enqueue(&other, 7, "ccc", "main").await.unwrap();

    let removed = svc.store().dequeue_all(&repo).await.unwrap();
    assert_eq!(removed, 2);

    assert!(svc.list_active(&repo).await.unwrap().is_empty());
    assert_eq!(svc.list_active(&other).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_active_excludes_terminal() {
    let svc = service().await;
    let repo = svc.store().get_or_create_repo("org", "app").await.unwrap();

    svc.enqueue(&repo, 1, "aaa", "main").await.unwrap();
    svc.enqueue(&repo, 2, "bbb", "main").await.unwrap();
    svc.update_state(&repo, 1, EntryState::Cancelled).await.unwrap();

    let active = svc.list_active(&repo).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].pr_number, 2);
}

#[tokio::test]
async fn test_load_active_across_repos() {
    let svc = service().await;
    let a = svc.store().get_or_create_repo("org", "app").await.unwrap();
    let b = svc.store().get_or_create_repo("org", "lib").await.unwrap();

    svc.enqueue(&a, 1, "aaa", "main").await.unwrap();
    svc.enqueue(&b, 2, "bbb", "main").await.unwrap();

    let all = svc.store().load_active_across_repos().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].0.full_name(), "org/app");
    assert_eq!(all[1].0.full_name(), "org/lib");
}
