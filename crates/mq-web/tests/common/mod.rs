//! Shared setup for integration tests: an in-memory store, a scriptable
//! mock forge, and a poller wired the way the registry wires them.

// Not every test file touches every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mq_core::{QueueService, Repo, Store};
use mq_gitea::{ForgeClient, MockForge};
use mq_web::{AppConfig, Checks, MergeDriver, Poller};
use secrecy::SecretString;

pub struct Harness {
    pub forge: Arc<MockForge>,
    pub queue: QueueService,
    pub config: Arc<AppConfig>,
    pub repo: Repo,
    pub driver: MergeDriver,
    pub checks: Checks,
    pub poller: Poller,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        external_url: "https://mq.example.com".to_string(),
        webhook_path: "/webhook".to_string(),
        webhook_secret: SecretString::new("test-secret".to_string()),
        poll_interval: Duration::from_secs(3600),
        check_timeout: chrono::Duration::hours(1),
        success_timeout: chrono::Duration::minutes(5),
        dashboard_refresh_secs: 10,
        fallback_required_checks: vec![],
        explicit_repos: vec![],
        topic: None,
        discovery_interval: Duration::from_secs(3600),
    }
}

pub async fn harness_with_config(owner: &str, name: &str, config: AppConfig) -> Harness {
    let forge = Arc::new(MockForge::new());
    let queue = QueueService::new(Store::in_memory().await.unwrap());
    let config = Arc::new(config);
    let repo = queue.store().get_or_create_repo(owner, name).await.unwrap();

    let forge_dyn: Arc<dyn ForgeClient> = forge.clone();
    let driver = MergeDriver::new(forge_dyn.clone(), queue.clone(), config.clone());
    let checks = Checks::new(
        forge_dyn.clone(),
        queue.clone(),
        driver.clone(),
        config.clone(),
    );
    let poller = Poller::new(
        forge_dyn,
        queue.clone(),
        driver.clone(),
        checks.clone(),
        config.clone(),
        repo.clone(),
    );

    Harness {
        forge,
        queue,
        config,
        repo,
        driver,
        checks,
        poller,
    }
}

pub async fn harness(owner: &str, name: &str) -> Harness {
    harness_with_config(owner, name, test_config()).await
}
