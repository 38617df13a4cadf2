//! Topic-based membership reconciliation
//!
//! Periodically reconciles the registry with the repos that advertise the
//! configured topic. Explicit repos from static configuration are never
//! removed; neither is a repo whose topic fetch failed this cycle, so a
//! flaky forge cannot empty the registry.

use std::collections::HashSet;
use std::sync::Arc;

use mq_core::RepoRef;
use mq_gitea::ForgeClient;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::registry::Registry;
use crate::Result;

/// Periodic registry reconciler.
pub struct Discovery {
    forge: Arc<dyn ForgeClient>,
    registry: Arc<Registry>,
    config: Arc<AppConfig>,
}

impl Discovery {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        registry: Arc<Registry>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            forge,
            registry,
            config,
        }
    }

    /// Run until the shutdown channel signals, reconciling immediately and
    /// then on the configured interval. A failed cycle leaves the registry
    /// unchanged.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            topic = self.config.topic.as_deref().unwrap_or("<none>"),
            "Discovery started"
        );

        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "Discovery cycle failed, registry unchanged");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Discovery stopped");
    }

    /// One reconciliation cycle. Idempotent: identical forge state yields
    /// an identical registry.
    pub async fn reconcile(&self) -> Result<()> {
        let explicit: HashSet<String> = self
            .config
            .explicit_repos
            .iter()
            .map(|r| r.full_name())
            .collect();

        let mut desired: HashSet<String> = explicit.clone();
        let mut fetch_failed: HashSet<String> = HashSet::new();

        if let Some(topic) = self.config.topic.as_deref() {
            let repos = self.forge.list_accessible_repos().await?;
            for repo in repos {
                // Without admin we can manage neither branch protection
                // nor webhooks.
                if !repo.permissions.admin {
                    debug!(repo = %repo.full_name, "Skipping repo without admin permission");
                    continue;
                }
                let Some(repo_ref) = RepoRef::parse(&repo.full_name) else {
                    warn!(repo = %repo.full_name, "Unparseable repo name");
                    continue;
                };

                match self.forge.get_topics(&repo_ref).await {
                    Ok(topics) => {
                        if topics.iter().any(|t| t == topic) {
                            desired.insert(repo.full_name.clone());
                        }
                    }
                    Err(e) => {
                        warn!(repo = %repo.full_name, error = %e, "Topics fetch failed");
                        fetch_failed.insert(repo.full_name.clone());
                    }
                }
            }
        }

        let managed = self.registry.keys();

        for key in desired.iter() {
            if managed.contains(key) {
                continue;
            }
            let Some(repo_ref) = RepoRef::parse(key) else {
                continue;
            };
            if let Err(e) = self.registry.add(&repo_ref).await {
                warn!(repo = %key, error = %e, "Failed to admit repo");
            }
        }

        for key in managed.iter() {
            if desired.contains(key) {
                continue;
            }
            // Conservative: a repo we could not read topics for this cycle
            // stays managed.
            if fetch_failed.contains(key) {
                debug!(repo = %key, "Keeping repo with failed topics fetch");
                continue;
            }
            self.registry.remove(key);
        }

        Ok(())
    }
}
