//! Runtime configuration shared by the control-plane components
//!
//! Built once at startup from the environment and passed down as an
//! explicit dependency; there is no global configuration state.

use std::time::Duration;

use mq_core::RepoRef;
use secrecy::SecretString;

/// Settings every component reads.
#[derive(Clone)]
pub struct AppConfig {
    /// Public base URL of this instance, used as `target_url` on posted
    /// statuses and as the webhook delivery address.
    pub external_url: String,
    /// Path the forge delivers status events to.
    pub webhook_path: String,
    /// Shared HMAC secret for webhook signatures.
    pub webhook_secret: SecretString,
    /// Poller tick cadence.
    pub poll_interval: Duration,
    /// How long a Testing entry may wait for its checks.
    pub check_timeout: chrono::Duration,
    /// How long a Success entry may wait for the forge's automerge.
    pub success_timeout: chrono::Duration,
    /// Dashboard auto-refresh, in seconds.
    pub dashboard_refresh_secs: u64,
    /// Operator-configured required checks, used when branch protection
    /// yields none.
    pub fallback_required_checks: Vec<String>,
    /// Repos managed regardless of topic discovery.
    pub explicit_repos: Vec<RepoRef>,
    /// Topic that opts a repo into management.
    pub topic: Option<String>,
    /// Discovery reconciliation cadence.
    pub discovery_interval: Duration,
}

impl AppConfig {
    /// The URL the forge should deliver status webhooks to.
    pub fn webhook_url(&self) -> String {
        format!(
            "{}{}",
            self.external_url.trim_end_matches('/'),
            self.webhook_path
        )
    }

    /// Dashboard page for a PR; used as `target_url` on every posted
    /// status.
    pub fn pr_url(&self, repo: &RepoRef, pr_number: i64) -> String {
        format!(
            "{}/repo/{}/{}/pr/{}",
            self.external_url.trim_end_matches('/'),
            repo.owner,
            repo.name,
            pr_number
        )
    }
}
