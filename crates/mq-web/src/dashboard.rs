//! Dashboard pages
//!
//! Read-only HTML views over the registry (membership) and the queue
//! service (entries). Everything is precomputed into string view models so
//! the templates stay dumb.

use askama::Template;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use mq_core::{CheckStatus, QueueEntry};
use std::sync::Arc;
use tracing::error;

use crate::server::AppState;

// ==================== View Models ====================

pub struct RepoSummary {
    pub full_name: String,
    pub owner: String,
    pub name: String,
    pub active: usize,
}

pub struct QueueView {
    pub target_branch: String,
    pub entries: Vec<EntryView>,
}

pub struct EntryView {
    pub pr_number: i64,
    pub position: usize,
    pub state: String,
    pub head_sha: String,
    pub merge_branch: String,
    pub enqueued_at: String,
    pub error_message: String,
}

impl EntryView {
    fn new(entry: &QueueEntry, position: usize) -> Self {
        Self {
            pr_number: entry.pr_number,
            position,
            state: entry.state.as_str().to_string(),
            head_sha: entry.pr_head_sha.chars().take(10).collect(),
            merge_branch: entry.merge_branch_name.clone().unwrap_or_default(),
            enqueued_at: entry.enqueued_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            error_message: entry.error_message.clone().unwrap_or_default(),
        }
    }
}

pub struct CheckView {
    pub context: String,
    pub state: String,
    pub updated_at: String,
}

impl From<&CheckStatus> for CheckView {
    fn from(status: &CheckStatus) -> Self {
        Self {
            context: status.context.clone(),
            state: status.state.as_str().to_string(),
            updated_at: status.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

// ==================== Templates ====================

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    refresh_secs: u64,
    repos: Vec<RepoSummary>,
}

#[derive(Template)]
#[template(path = "repo.html")]
struct RepoTemplate {
    refresh_secs: u64,
    full_name: String,
    owner: String,
    name: String,
    queues: Vec<QueueView>,
}

#[derive(Template)]
#[template(path = "pr.html")]
struct PrTemplate {
    refresh_secs: u64,
    full_name: String,
    owner: String,
    name: String,
    pr_number: i64,
    entry: Option<EntryView>,
    checks: Vec<CheckView>,
}

fn render<T: Template>(template: T) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!(error = %e, "Template render failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ==================== Handlers ====================

pub async fn index(State(state): State<Arc<AppState>>) -> Response {
    let mut repos = Vec::new();
    for managed in state.registry.managed() {
        let active = match state.queue.list_active(&managed.repo).await {
            Ok(entries) => entries.len(),
            Err(e) => {
                error!(repo = %managed.repo_ref, error = %e, "Failed to list entries");
                0
            }
        };
        repos.push(RepoSummary {
            full_name: managed.repo_ref.full_name(),
            owner: managed.repo_ref.owner.clone(),
            name: managed.repo_ref.name.clone(),
            active,
        });
    }

    render(IndexTemplate {
        refresh_secs: state.config.dashboard_refresh_secs,
        repos,
    })
}

pub async fn repo_page(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Response {
    let full_name = format!("{}/{}", owner, name);
    let Some(managed) = state.registry.lookup(&full_name) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let entries = match state.queue.list_active(&managed.repo).await {
        Ok(entries) => entries,
        Err(e) => {
            error!(repo = %full_name, error = %e, "Failed to list entries");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // Entries arrive ordered by (target_branch, enqueued_at); fold them
    // into one block per target branch with 1-based positions.
    let mut queues: Vec<QueueView> = Vec::new();
    for entry in &entries {
        if queues.last().map(|q| q.target_branch.as_str()) != Some(entry.target_branch.as_str()) {
            queues.push(QueueView {
                target_branch: entry.target_branch.clone(),
                entries: Vec::new(),
            });
        }
        if let Some(queue) = queues.last_mut() {
            let position = queue.entries.len() + 1;
            queue.entries.push(EntryView::new(entry, position));
        }
    }

    render(RepoTemplate {
        refresh_secs: state.config.dashboard_refresh_secs,
        full_name,
        owner,
        name,
        queues,
    })
}

pub async fn pr_page(
    State(state): State<Arc<AppState>>,
    Path((owner, name, number)): Path<(String, String, i64)>,
) -> Response {
    let full_name = format!("{}/{}", owner, name);
    let Some(managed) = state.registry.lookup(&full_name) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let entry = match state.queue.get_entry(&managed.repo, number).await {
        Ok(entry) => entry,
        Err(e) => {
            error!(repo = %full_name, pr = number, error = %e, "Failed to load entry");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let checks = match &entry {
        Some(entry) => match state.queue.get_check_statuses(entry).await {
            Ok(statuses) => statuses.iter().map(CheckView::from).collect(),
            Err(e) => {
                error!(repo = %full_name, pr = number, error = %e, "Failed to load check statuses");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    render(PrTemplate {
        refresh_secs: state.config.dashboard_refresh_secs,
        full_name,
        owner,
        name,
        pr_number: number,
        entry: entry.as_ref().map(|e| EntryView::new(e, 0)),
        checks,
    })
}

pub async fn stylesheet() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
        include_str!("../static/style.css"),
    )
}
