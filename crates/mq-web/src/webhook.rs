//! Status webhook receiver
//!
//! Low-latency path for check results: the forge pushes a commit status,
//! the handler correlates it to the entry testing that SHA, records it,
//! and applies the evaluator's verdict. Signature verification happens
//! before anything else; after successful authentication and parse the
//! reply is always 200 so the forge never retries into duplicate
//! processing.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use mq_core::{CheckState, CONTEXT_NAME};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::server::AppState;

/// Webhook response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    pub message: String,
}

fn ok(message: &str) -> (StatusCode, Json<WebhookResponse>) {
    (
        StatusCode::OK,
        Json(WebhookResponse {
            status: "ok".to_string(),
            message: message.to_string(),
        }),
    )
}

fn reject(status: StatusCode, message: &str) -> (StatusCode, Json<WebhookResponse>) {
    (
        status,
        Json(WebhookResponse {
            status: "error".to_string(),
            message: message.to_string(),
        }),
    )
}

/// A commit status event as delivered by the forge.
#[derive(Debug, Deserialize)]
struct StatusEvent {
    sha: String,
    context: String,
    state: String,
    repository: EventRepository,
    target_url: String,
}

#[derive(Debug, Deserialize)]
struct EventRepository {
    full_name: String,
}

/// Status webhook handler.
///
/// Non-POST requests never reach here; the router answers them with 405.
pub async fn status_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    // Authentication first; nothing is read from the payload before the
    // signature checks out.
    let signature = match headers.get("x-gitea-signature").and_then(|v| v.to_str().ok()) {
        Some(sig) => sig,
        None => {
            warn!("Missing X-Gitea-Signature header");
            return reject(StatusCode::UNAUTHORIZED, "Missing signature");
        }
    };

    if !verify_signature(
        state.config.webhook_secret.expose_secret(),
        &body,
        signature,
    ) {
        warn!("Invalid webhook signature");
        return reject(StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    let event: StatusEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Failed to parse status event");
            return reject(StatusCode::BAD_REQUEST, "Invalid status event payload");
        }
    };

    debug!(
        repo = %event.repository.full_name,
        sha = %event.sha,
        context = %event.context,
        state = %event.state,
        target_url = %event.target_url,
        "Received status event"
    );

    // Our own status reported back to us must never feed the evaluator.
    if event.context == CONTEXT_NAME {
        return ok("own context ignored");
    }

    let Some(managed) = state.registry.lookup(&event.repository.full_name) else {
        debug!(repo = %event.repository.full_name, "Status event for unmanaged repo");
        return ok("repo not managed");
    };

    // Everything below is best-effort: the event is authenticated and
    // parsed, so the forge gets its 200 regardless of downstream trouble.
    let entry = match state
        .checks
        .find_entry_by_merge_sha(&managed.repo, &event.sha)
        .await
    {
        Ok(Some(entry)) => entry,
        Ok(None) => return ok("sha not tracked"),
        Err(e) => {
            error!(repo = %managed.repo_ref, error = %e, "Entry correlation failed");
            return ok("correlation failed");
        }
    };

    let check_state = match event.state.as_str() {
        // The forge reports soft-failing checks as "warning"; they gate
        // nothing.
        "success" | "warning" => CheckState::Success,
        "failure" => CheckState::Failure,
        "error" => CheckState::Error,
        _ => CheckState::Pending,
    };

    info!(
        repo = %managed.repo_ref,
        pr = entry.pr_number,
        context = %event.context,
        state = check_state.as_str(),
        "Recording check status"
    );

    if let Err(e) = state
        .queue
        .save_check_status(&entry, &event.context, check_state)
        .await
    {
        error!(repo = %managed.repo_ref, pr = entry.pr_number, error = %e, "Failed to save check status");
        return ok("save failed");
    }

    let verdict = match state.checks.evaluate_entry(&managed.repo, &entry).await {
        Ok(verdict) => verdict,
        Err(e) => {
            error!(repo = %managed.repo_ref, pr = entry.pr_number, error = %e, "Check evaluation failed");
            return ok("evaluation failed");
        }
    };

    if let Err(e) = state
        .checks
        .apply_verdict(&managed.repo, &entry, &verdict)
        .await
    {
        error!(repo = %managed.repo_ref, pr = entry.pr_number, error = %e, "Failed to apply verdict");
    }

    ok("processed")
}

/// Verify the forge's webhook signature: hex-encoded HMAC-SHA256 of the
/// raw body. The comparison is constant-time.
fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let expected = match hex::decode(signature) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(error = %e, "Failed to decode signature hex");
            return false;
        }
    };

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "Failed to create HMAC");
            return false;
        }
    };
    mac.update(payload);

    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use mq_core::{EntryState, QueueService, Store};
    use mq_gitea::MockForge;
    use secrecy::SecretString;
    use tower::ServiceExt;

    use crate::config::AppConfig;
    use crate::server::{create_router, AppState};

    const SECRET: &str = "test-secret";

    fn test_config() -> AppConfig {
        AppConfig {
            external_url: "https://mq.example.com".to_string(),
            webhook_path: "/webhook".to_string(),
            webhook_secret: SecretString::new(SECRET.to_string()),
            poll_interval: std::time::Duration::from_secs(3600),
            check_timeout: chrono::Duration::hours(1),
            success_timeout: chrono::Duration::minutes(5),
            dashboard_refresh_secs: 10,
            fallback_required_checks: vec!["ci/build".to_string()],
            explicit_repos: vec![],
            topic: None,
            discovery_interval: std::time::Duration::from_secs(3600),
        }
    }

    async fn test_state() -> (Arc<AppState>, Arc<MockForge>) {
        let forge = Arc::new(MockForge::new());
        let queue = QueueService::new(Store::in_memory().await.unwrap());
        let config = Arc::new(test_config());
        let forge_dyn: Arc<dyn mq_gitea::ForgeClient> = forge.clone();
        let state = AppState::new(forge_dyn, queue, config);
        (Arc::new(state), forge)
    }

    fn sign(payload: &str) -> String {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn event_payload(sha: &str, context: &str, state: &str, repo: &str) -> String {
        serde_json::json!({
            "sha": sha,
            "context": context,
            "state": state,
            "repository": { "full_name": repo },
            "target_url": "https://ci.example.com/run/1"
        })
        .to_string()
    }

    async fn post(router: axum::Router, payload: &str, signature: Option<&str>) -> (StatusCode, String) {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/webhook")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header("x-gitea-signature", sig);
        }
        let response = router
            .oneshot(builder.body(Body::from(payload.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_non_post_is_405() {
        let (state, _forge) = test_state().await;
        let router = create_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/webhook")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_missing_signature_is_401() {
        let (state, _forge) = test_state().await;
        let router = create_router(state);

        let payload = event_payload("def456", "ci/build", "success", "org/app");
        let (status, _) = post(router, &payload, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_401() {
        let (state, _forge) = test_state().await;
        let router = create_router(state);

        let payload = event_payload("def456", "ci/build", "success", "org/app");
        let (status, _) = post(router, &payload, Some("0badc0de")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bad_json_is_400() {
        let (state, _forge) = test_state().await;
        let router = create_router(state);

        let payload = r#"{"sha": "def456"}"#;
        let (status, _) = post(router, payload, Some(&sign(payload))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_target_url_is_400() {
        let (state, _forge) = test_state().await;
        let router = create_router(state);

        let payload = serde_json::json!({
            "sha": "def456",
            "context": "ci/build",
            "state": "success",
            "repository": { "full_name": "org/app" }
        })
        .to_string();
        let (status, _) = post(router, &payload, Some(&sign(&payload))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_own_context_is_dropped() {
        let (state, _forge) = test_state().await;
        let router = create_router(state.clone());

        let payload = event_payload("def456", CONTEXT_NAME, "success", "org/app");
        let (status, body) = post(router, &payload, Some(&sign(payload.as_str()))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("own context ignored"));
    }

    #[tokio::test]
    async fn test_unmanaged_repo_is_dropped() {
        let (state, _forge) = test_state().await;
        let router = create_router(state);

        let payload = event_payload("def456", "ci/build", "success", "org/unknown");
        let (status, body) = post(router, &payload, Some(&sign(&payload))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("repo not managed"));
    }

    /// Set up a managed repo with PR #42 in Testing on merge SHA def456.
    async fn testing_entry(state: &Arc<AppState>, forge: &MockForge) -> mq_core::Repo {
        // The open PR with automerge scheduled, so the admitted poller's
        // reconciliation leaves the entry alone.
        forge.add_pull("org/app", 42, "main", "abc123");
        forge.set_timeline("org/app", 42, &["pull_scheduled_merge"]);
        forge.add_branch("org/app", "gitea-mq/42");

        let repo = state
            .queue
            .store()
            .get_or_create_repo("org", "app")
            .await
            .unwrap();
        state
            .queue
            .enqueue(&repo, 42, "abc123", "main")
            .await
            .unwrap();
        state
            .queue
            .set_merge_branch(&repo, 42, "gitea-mq/42", "def456")
            .await
            .unwrap();
        state
            .queue
            .update_state(&repo, 42, EntryState::Testing)
            .await
            .unwrap();

        state
            .registry
            .add(&mq_core::RepoRef::new("org", "app"))
            .await
            .unwrap();
        repo
    }

    #[tokio::test]
    async fn test_uncorrelated_sha_is_dropped() {
        let (state, forge) = test_state().await;
        let repo = testing_entry(&state, &forge).await;
        let router = create_router(state.clone());

        // A status for the PR's own head, not the merge branch.
        let payload = event_payload("abc123", "ci/build", "success", "org/app");
        let (status, body) = post(router, &payload, Some(&sign(&payload))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("sha not tracked"));

        let entry = state.queue.get_entry(&repo, 42).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Testing);
        assert!(state
            .queue
            .get_check_statuses(&entry)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_success_event_completes_entry() {
        let (state, forge) = test_state().await;
        let repo = testing_entry(&state, &forge).await;
        let router = create_router(state.clone());

        let payload = event_payload("def456", "ci/build", "success", "org/app");
        let (status, _) = post(router, &payload, Some(&sign(&payload))).await;
        assert_eq!(status, StatusCode::OK);

        let entry = state.queue.get_entry(&repo, 42).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Success);

        // Success status posted on the PR head, merge branch deleted.
        let statuses = forge.posted_statuses();
        let success = statuses
            .iter()
            .find(|s| s.status.description == "Merge queue passed")
            .expect("success status posted");
        assert_eq!(success.sha, "abc123");
        assert_eq!(success.status.context, CONTEXT_NAME);
        assert!(forge
            .deleted_branches()
            .contains(&("org/app".to_string(), "gitea-mq/42".to_string())));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let (state, forge) = test_state().await;
        let repo = testing_entry(&state, &forge).await;

        let payload = event_payload("def456", "ci/build", "success", "org/app");
        let sig = sign(&payload);
        let (status, _) = post(create_router(state.clone()), &payload, Some(&sig)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post(create_router(state.clone()), &payload, Some(&sig)).await;
        assert_eq!(status, StatusCode::OK);

        let entry = state.queue.get_entry(&repo, 42).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Success);
        let statuses = state.queue.get_check_statuses(&entry).await.unwrap();
        assert_eq!(statuses.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_event_removes_and_advances() {
        let (state, forge) = test_state().await;
        let repo = testing_entry(&state, &forge).await;

        // A second PR queued behind the head.
        forge.add_pull("org/app", 43, "main", "bbb222");
        forge.set_timeline("org/app", 43, &["pull_scheduled_merge"]);
        state
            .queue
            .enqueue(&repo, 43, "bbb222", "main")
            .await
            .unwrap();

        let payload = event_payload("def456", "ci/build", "failure", "org/app");
        let (status, _) = post(create_router(state.clone()), &payload, Some(&sign(&payload))).await;
        assert_eq!(status, StatusCode::OK);

        // Head removed, automerge cancelled, comment posted, next in line.
        assert!(state.queue.get_entry(&repo, 42).await.unwrap().is_none());
        assert!(forge
            .cancelled_automerges()
            .contains(&("org/app".to_string(), 42)));
        assert!(forge
            .posted_comments()
            .iter()
            .any(|c| c.number == 42 && c.body.contains("ci/build")));

        let failure = forge
            .posted_statuses()
            .into_iter()
            .find(|s| s.status.description.starts_with("Check failed"))
            .expect("failure status posted");
        assert_eq!(failure.sha, "abc123");
        assert_eq!(failure.status.description, "Check failed: ci/build");

        let head = state.queue.head(&repo, "main").await.unwrap().unwrap();
        assert_eq!(head.pr_number, 43);
    }

    #[test]
    fn test_verify_signature() {
        let payload = b"test payload";
        let sig = {
            use hmac::{Hmac, Mac};
            use sha2::Sha256;
            type HmacSha256 = Hmac<Sha256>;
            let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
            mac.update(payload);
            hex::encode(mac.finalize().into_bytes())
        };

        assert!(verify_signature(SECRET, payload, &sig));
        assert!(!verify_signature(SECRET, b"other payload", &sig));
        assert!(!verify_signature(SECRET, payload, "not-hex"));
        assert!(!verify_signature(
            SECRET,
            payload,
            "0000000000000000000000000000000000000000000000000000000000000000"
        ));
    }
}
