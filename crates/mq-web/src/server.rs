//! HTTP server assembly
//!
//! One router carries the webhook receiver, the health endpoint, and the
//! dashboard. Shutdown is signalled through the root watch channel and
//! bounded by a grace period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use mq_core::QueueService;
use mq_gitea::ForgeClient;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::checks::Checks;
use crate::config::AppConfig;
use crate::dashboard;
use crate::merge_driver::MergeDriver;
use crate::registry::Registry;
use crate::webhook::status_webhook_handler;
use crate::Result;

/// How long open connections get to finish after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state behind every handler.
pub struct AppState {
    pub forge: Arc<dyn ForgeClient>,
    pub queue: QueueService,
    pub config: Arc<AppConfig>,
    pub registry: Arc<Registry>,
    pub checks: Checks,
}

impl AppState {
    pub fn new(forge: Arc<dyn ForgeClient>, queue: QueueService, config: Arc<AppConfig>) -> Self {
        let registry = Arc::new(Registry::new(
            Arc::clone(&forge),
            queue.clone(),
            Arc::clone(&config),
        ));
        let driver = MergeDriver::new(Arc::clone(&forge), queue.clone(), Arc::clone(&config));
        let checks = Checks::new(
            Arc::clone(&forge),
            queue.clone(),
            driver,
            Arc::clone(&config),
        );
        Self {
            forge,
            queue,
            config,
            registry,
            checks,
        }
    }
}

async fn healthz() -> &'static str {
    "ok\n"
}

/// Build the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let webhook_path = state.config.webhook_path.clone();

    Router::new()
        .route(&webhook_path, post(status_webhook_handler))
        .route("/healthz", get(healthz))
        .route("/", get(dashboard::index))
        .route("/repo/:owner/:name", get(dashboard::repo_page))
        .route("/repo/:owner/:name/pr/:number", get(dashboard::pr_page))
        .route("/static/style.css", get(dashboard::stylesheet))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown channel signals, then drain connections within
/// the grace period.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");

    let graceful = {
        let mut shutdown = shutdown.clone();
        async move {
            let _ = shutdown.changed().await;
        }
    };
    let server = axum::serve(listener, router).with_graceful_shutdown(graceful);

    let deadline = {
        let mut shutdown = shutdown.clone();
        async move {
            let _ = shutdown.changed().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    };

    tokio::select! {
        result = server => result?,
        _ = deadline => warn!("Shutdown grace period elapsed, dropping connections"),
    }

    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use mq_core::Store;
    use mq_gitea::MockForge;
    use secrecy::SecretString;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let forge = Arc::new(MockForge::new());
        let queue = QueueService::new(Store::in_memory().await.unwrap());
        let config = Arc::new(AppConfig {
            external_url: "https://mq.example.com".to_string(),
            webhook_path: "/webhook".to_string(),
            webhook_secret: SecretString::new("secret".to_string()),
            poll_interval: Duration::from_secs(3600),
            check_timeout: chrono::Duration::hours(1),
            success_timeout: chrono::Duration::minutes(5),
            dashboard_refresh_secs: 10,
            fallback_required_checks: vec![],
            explicit_repos: vec![],
            topic: None,
            discovery_interval: Duration::from_secs(3600),
        });
        Arc::new(AppState::new(forge, queue, config))
    }

    #[tokio::test]
    async fn test_healthz() {
        let router = create_router(test_state().await);

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok\n");
    }

    #[tokio::test]
    async fn test_index_renders() {
        let router = create_router(test_state().await);

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_repo_page_is_404() {
        let router = create_router(test_state().await);

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/repo/org/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
