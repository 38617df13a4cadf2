//! Database layer for SQLite
//!
//! The store is the single source of truth for queue state; nothing is held
//! in process memory, so restarts resume cleanly. Multi-step operations run
//! inside a transaction (SQLite transactions are serializable) and retry
//! once when the writer lock is contended.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::queue::{CheckState, CheckStatus, EntryState, QueueEntry};
use crate::repo::Repo;
use crate::{Error, Result};

/// Database configuration
pub struct StoreConfig {
    /// Maximum number of connections
    pub max_connections: u32,
    /// Connection acquire timeout
    pub acquire_timeout: Duration,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Result of an enqueue: the row, whether this call created it, and its
/// 1-based position among active entries for the same target branch.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub entry: QueueEntry,
    pub is_new: bool,
    pub position: i64,
}

/// Result of a dequeue: whether a row existed, and whether it was the head
/// of its queue at the moment of removal.
#[derive(Debug, Clone)]
pub struct Dequeued {
    pub found: bool,
    pub was_head: bool,
    pub entry: Option<QueueEntry>,
}

/// Oldest active entry for a (repo, target branch); shared by the head
/// read, the transactional dequeue, and the advance.
const HEAD_SQL: &str = r#"
    SELECT * FROM queue_entries
    WHERE repo_id = ? AND target_branch = ?
      AND state IN ('queued', 'testing', 'success')
    ORDER BY enqueued_at ASC, id ASC
    LIMIT 1
    "#;

/// Durable storage for repos, queue entries, and check statuses.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` with default config.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, StoreConfig::default()).await
    }

    /// Open (or create) the database at `path`.
    pub async fn with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // WAL for concurrent readers alongside the writer; pragmas set per
        // connection so every pooled connection enforces foreign keys.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Apply schema migrations. Statements are idempotent.
    async fn run_migrations(&self) -> Result<()> {
        for statement in include_str!("../../../migrations/001_initial.sql").split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ==================== Repo Operations ====================

    /// Upsert a repo row by (owner, name).
    pub async fn get_or_create_repo(&self, owner: &str, name: &str) -> Result<Repo> {
        sqlx::query(
            r#"
            INSERT INTO repos (owner, name, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT (owner, name) DO NOTHING
            "#,
        )
        .bind(owner)
        .bind(name)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, RepoRow>("SELECT * FROM repos WHERE owner = ? AND name = ?")
            .bind(owner)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    // ==================== Queue Entry Operations ====================

    /// Atomic insert-or-lookup of the entry for (repo, pr). The queue
    /// position is read inside the same transaction, so a concurrent
    /// enqueue or dequeue cannot slip between the write and the count.
    pub async fn enqueue_pr(
        &self,
        repo: &Repo,
        pr_number: i64,
        head_sha: &str,
        target_branch: &str,
    ) -> Result<Enqueued> {
        let mut attempt = 0;
        loop {
            match self
                .try_enqueue_pr(repo, pr_number, head_sha, target_branch)
                .await
            {
                Err(Error::Database(e)) if attempt == 0 && is_busy(&e) => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_enqueue_pr(
        &self,
        repo: &Repo,
        pr_number: i64,
        head_sha: &str,
        target_branch: &str,
    ) -> Result<Enqueued> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, QueueEntryRow>(
            "SELECT * FROM queue_entries WHERE repo_id = ? AND pr_number = ?",
        )
        .bind(repo.id)
        .bind(pr_number)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let entry: QueueEntry = row.try_into()?;
            let position = position_of(&mut tx, &entry).await?;
            tx.commit().await?;
            return Ok(Enqueued {
                entry,
                is_new: false,
                position,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO queue_entries
                (repo_id, pr_number, pr_head_sha, target_branch, state, enqueued_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(repo.id)
        .bind(pr_number)
        .bind(head_sha)
        .bind(target_branch)
        .bind(EntryState::Queued.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, QueueEntryRow>(
            "SELECT * FROM queue_entries WHERE repo_id = ? AND pr_number = ?",
        )
        .bind(repo.id)
        .bind(pr_number)
        .fetch_one(&mut *tx)
        .await?;

        let entry: QueueEntry = row.try_into()?;
        let position = position_of(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(Enqueued {
            entry,
            is_new: true,
            position,
        })
    }

    /// Get the entry for (repo, pr), in any state.
    pub async fn get_entry(&self, repo: &Repo, pr_number: i64) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueEntryRow>(
            "SELECT * FROM queue_entries WHERE repo_id = ? AND pr_number = ?",
        )
        .bind(repo.id)
        .bind(pr_number)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    /// The oldest active entry for (repo, target branch), if any.
    ///
    /// I/O errors are surfaced, never folded into "empty queue".
    pub async fn get_head(&self, repo: &Repo, target_branch: &str) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueEntryRow>(HEAD_SQL)
            .bind(repo.id)
            .bind(target_branch)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.try_into()).transpose()
    }

    /// All active entries for a repo, ordered by (target_branch, enqueued_at).
    pub async fn list_active(&self, repo: &Repo) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query_as::<_, QueueEntryRow>(
            r#"
            SELECT * FROM queue_entries
            WHERE repo_id = ? AND state IN ('queued', 'testing', 'success')
            ORDER BY target_branch ASC, enqueued_at ASC, id ASC
            "#,
        )
        .bind(repo.id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// All active entries across all repos, for startup recovery logging.
    pub async fn load_active_across_repos(&self) -> Result<Vec<(Repo, QueueEntry)>> {
        let rows = sqlx::query_as::<_, ActiveEntryRow>(
            r#"
            SELECT r.id AS repo_id, r.owner, r.name, r.created_at AS repo_created_at,
                   e.id AS entry_id, e.pr_number, e.pr_head_sha, e.target_branch,
                   e.state, e.enqueued_at, e.testing_started_at, e.completed_at,
                   e.merge_branch_name, e.merge_branch_sha, e.error_message
            FROM queue_entries e
            JOIN repos r ON r.id = e.repo_id
            WHERE e.state IN ('queued', 'testing', 'success')
            ORDER BY r.owner, r.name, e.target_branch, e.enqueued_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Transition the entry's state, maintaining the timing columns:
    /// `testing_started_at` on entry into Testing, `completed_at` on entry
    /// into Success or a terminal state.
    pub async fn update_state(
        &self,
        repo: &Repo,
        pr_number: i64,
        new_state: EntryState,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        match new_state {
            EntryState::Queued => {
                sqlx::query(
                    r#"
                    UPDATE queue_entries
                    SET state = ?, testing_started_at = NULL, completed_at = NULL
                    WHERE repo_id = ? AND pr_number = ?
                    "#,
                )
                .bind(new_state.as_str())
                .bind(repo.id)
                .bind(pr_number)
                .execute(&self.pool)
                .await?;
            }
            EntryState::Testing => {
                sqlx::query(
                    r#"
                    UPDATE queue_entries
                    SET state = ?, testing_started_at = ?
                    WHERE repo_id = ? AND pr_number = ?
                    "#,
                )
                .bind(new_state.as_str())
                .bind(&now)
                .bind(repo.id)
                .bind(pr_number)
                .execute(&self.pool)
                .await?;
            }
            EntryState::Success | EntryState::Failed | EntryState::Cancelled => {
                sqlx::query(
                    r#"
                    UPDATE queue_entries
                    SET state = ?, completed_at = ?
                    WHERE repo_id = ? AND pr_number = ?
                    "#,
                )
                .bind(new_state.as_str())
                .bind(&now)
                .bind(repo.id)
                .bind(pr_number)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Record the test-merge artifact for the entry.
    pub async fn set_merge_branch(
        &self,
        repo: &Repo,
        pr_number: i64,
        branch_name: &str,
        sha: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_entries
            SET merge_branch_name = ?, merge_branch_sha = ?
            WHERE repo_id = ? AND pr_number = ?
            "#,
        )
        .bind(branch_name)
        .bind(sha)
        .bind(repo.id)
        .bind(pr_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the free-text reason a removal is about to happen for.
    pub async fn set_error(&self, repo: &Repo, pr_number: i64, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE queue_entries SET error_message = ? WHERE repo_id = ? AND pr_number = ?",
        )
        .bind(message)
        .bind(repo.id)
        .bind(pr_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove the entry (and its check statuses, via cascade). The head
    /// check and the delete run in one transaction, so `was_head` reflects
    /// the queue at the moment of removal; removing a missing entry is a
    /// no-op. Retried once on writer contention.
    pub async fn dequeue_pr(&self, repo: &Repo, pr_number: i64) -> Result<Dequeued> {
        let mut attempt = 0;
        loop {
            match self.try_dequeue_pr(repo, pr_number).await {
                Err(Error::Database(e)) if attempt == 0 && is_busy(&e) => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_dequeue_pr(&self, repo: &Repo, pr_number: i64) -> Result<Dequeued> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, QueueEntryRow>(
            "SELECT * FROM queue_entries WHERE repo_id = ? AND pr_number = ?",
        )
        .bind(repo.id)
        .bind(pr_number)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(Dequeued {
                found: false,
                was_head: false,
                entry: None,
            });
        };
        let entry: QueueEntry = row.try_into()?;

        let head = sqlx::query_as::<_, QueueEntryRow>(HEAD_SQL)
            .bind(repo.id)
            .bind(&entry.target_branch)
            .fetch_optional(&mut *tx)
            .await?;
        let was_head = head.map(|h| h.id) == Some(entry.id);

        sqlx::query("DELETE FROM queue_entries WHERE id = ?")
            .bind(entry.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Dequeued {
            found: true,
            was_head,
            entry: Some(entry),
        })
    }

    /// Remove every entry for the repo. Used when a repo leaves management.
    pub async fn dequeue_all(&self, repo: &Repo) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queue_entries WHERE repo_id = ?")
            .bind(repo.id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Remove terminal rows for the target branch and return the next head.
    /// Runs as one transaction so the delete and the head read see the same
    /// queue; retried once on writer contention.
    pub async fn advance(&self, repo: &Repo, target_branch: &str) -> Result<Option<QueueEntry>> {
        let mut attempt = 0;
        loop {
            match self.try_advance(repo, target_branch).await {
                Err(Error::Database(e)) if attempt == 0 && is_busy(&e) => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_advance(&self, repo: &Repo, target_branch: &str) -> Result<Option<QueueEntry>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM queue_entries
            WHERE repo_id = ? AND target_branch = ? AND state IN ('failed', 'cancelled')
            "#,
        )
        .bind(repo.id)
        .bind(target_branch)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, QueueEntryRow>(HEAD_SQL)
            .bind(repo.id)
            .bind(target_branch)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        row.map(|r| r.try_into()).transpose()
    }

    // ==================== Check Status Operations ====================

    /// Upsert the status for (entry, context); the latest write wins.
    pub async fn save_check_status(
        &self,
        entry_id: i64,
        context: &str,
        state: CheckState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO check_statuses (entry_id, context, state, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (entry_id, context)
            DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(entry_id)
        .bind(context)
        .bind(state.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All recorded statuses for an entry, oldest context first.
    pub async fn get_check_statuses(&self, entry_id: i64) -> Result<Vec<CheckStatus>> {
        let rows = sqlx::query_as::<_, CheckStatusRow>(
            "SELECT * FROM check_statuses WHERE entry_id = ? ORDER BY id ASC",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

/// 1-based position of the entry within its (repo, target branch) queue,
/// read inside the caller's transaction.
async fn position_of(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &QueueEntry,
) -> Result<i64> {
    let enqueued_at = entry.enqueued_at.to_rfc3339();
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM queue_entries
        WHERE repo_id = ? AND target_branch = ?
          AND state IN ('queued', 'testing', 'success')
          AND (enqueued_at < ? OR (enqueued_at = ? AND id <= ?))
        "#,
    )
    .bind(entry.repo_id)
    .bind(&entry.target_branch)
    .bind(&enqueued_at)
    .bind(&enqueued_at)
    .bind(entry.id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(count)
}

/// Whether the error is SQLite writer contention worth one retry.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::InvalidTimestamp(s.to_string()))
}

// ==================== Row Types ====================

#[derive(sqlx::FromRow)]
struct RepoRow {
    id: i64,
    owner: String,
    name: String,
    created_at: String,
}

impl TryFrom<RepoRow> for Repo {
    type Error = Error;

    fn try_from(row: RepoRow) -> Result<Self> {
        Ok(Repo {
            id: row.id,
            owner: row.owner,
            name: row.name,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueueEntryRow {
    id: i64,
    repo_id: i64,
    pr_number: i64,
    pr_head_sha: String,
    target_branch: String,
    state: String,
    enqueued_at: String,
    testing_started_at: Option<String>,
    completed_at: Option<String>,
    merge_branch_name: Option<String>,
    merge_branch_sha: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = Error;

    fn try_from(row: QueueEntryRow) -> Result<Self> {
        Ok(QueueEntry {
            id: row.id,
            repo_id: row.repo_id,
            pr_number: row.pr_number,
            pr_head_sha: row.pr_head_sha,
            target_branch: row.target_branch,
            state: EntryState::from_str(&row.state)?,
            enqueued_at: parse_ts(&row.enqueued_at)?,
            testing_started_at: row.testing_started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
            merge_branch_name: row.merge_branch_name,
            merge_branch_sha: row.merge_branch_sha,
            error_message: row.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActiveEntryRow {
    repo_id: i64,
    owner: String,
    name: String,
    repo_created_at: String,
    entry_id: i64,
    pr_number: i64,
    pr_head_sha: String,
    target_branch: String,
    state: String,
    enqueued_at: String,
    testing_started_at: Option<String>,
    completed_at: Option<String>,
    merge_branch_name: Option<String>,
    merge_branch_sha: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<ActiveEntryRow> for (Repo, QueueEntry) {
    type Error = Error;

    fn try_from(row: ActiveEntryRow) -> Result<Self> {
        let repo = Repo {
            id: row.repo_id,
            owner: row.owner,
            name: row.name,
            created_at: parse_ts(&row.repo_created_at)?,
        };
        let entry = QueueEntry {
            id: row.entry_id,
            repo_id: row.repo_id,
            pr_number: row.pr_number,
            pr_head_sha: row.pr_head_sha,
            target_branch: row.target_branch,
            state: EntryState::from_str(&row.state)?,
            enqueued_at: parse_ts(&row.enqueued_at)?,
            testing_started_at: row.testing_started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
            merge_branch_name: row.merge_branch_name,
            merge_branch_sha: row.merge_branch_sha,
            error_message: row.error_message,
        };
        Ok((repo, entry))
    }
}

#[derive(sqlx::FromRow)]
struct CheckStatusRow {
    id: i64,
    entry_id: i64,
    context: String,
    state: String,
    updated_at: String,
}

impl TryFrom<CheckStatusRow> for CheckStatus {
    type Error = Error;

    fn try_from(row: CheckStatusRow) -> Result<Self> {
        Ok(CheckStatus {
            id: row.id,
            entry_id: row.entry_id,
            context: row.context,
            state: CheckState::from_str(&row.state)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}
