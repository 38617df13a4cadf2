//! Managed repo registry
//!
//! Concurrency-safe set of repos under management, each owning one poller.
//! A single RW lock guards the map; admission work (forge calls, database
//! writes, poller spawn) happens outside it, and a concurrent add of the
//! same key is resolved by cancelling the loser's poller.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use mq_core::{QueueService, Repo, RepoRef, CONTEXT_NAME};
use mq_gitea::{CreateHookConfig, CreateHookOptions, ForgeClient};
use secrecy::ExposeSecret;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checks::Checks;
use crate::config::AppConfig;
use crate::merge_driver::MergeDriver;
use crate::poller::Poller;
use crate::Result;

/// Grace period for draining a removed repo's queue; detached from the
/// repo's own (already cancelled) shutdown channel.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A repo under management.
pub struct ManagedRepo {
    pub repo: Repo,
    pub repo_ref: RepoRef,
    shutdown: watch::Sender<bool>,
}

/// Registry of managed repos.
pub struct Registry {
    forge: Arc<dyn ForgeClient>,
    queue: QueueService,
    config: Arc<AppConfig>,
    repos: RwLock<HashMap<String, Arc<ManagedRepo>>>,
}

impl Registry {
    pub fn new(forge: Arc<dyn ForgeClient>, queue: QueueService, config: Arc<AppConfig>) -> Self {
        Self {
            forge,
            queue,
            config,
            repos: RwLock::new(HashMap::new()),
        }
    }

    fn driver(&self) -> MergeDriver {
        MergeDriver::new(
            Arc::clone(&self.forge),
            self.queue.clone(),
            Arc::clone(&self.config),
        )
    }

    /// Bring a repo under management: admission (branch protection, webhook,
    /// repo row, stale-branch sweep), then a poller of its own. Idempotent;
    /// a repo that is already managed is left alone.
    pub async fn add(&self, repo_ref: &RepoRef) -> Result<()> {
        let key = repo_ref.full_name();
        if self.contains(&key) {
            return Ok(());
        }

        info!(repo = %repo_ref, "Admitting repo");

        // Admission, outside the lock.
        self.ensure_protection(repo_ref).await?;
        self.ensure_webhook(repo_ref).await?;
        let repo = self
            .queue
            .store()
            .get_or_create_repo(&repo_ref.owner, &repo_ref.name)
            .await?;

        let driver = self.driver();
        driver.cleanup_stale(&repo).await?;

        let checks = Checks::new(
            Arc::clone(&self.forge),
            self.queue.clone(),
            driver.clone(),
            Arc::clone(&self.config),
        );
        let poller = Poller::new(
            Arc::clone(&self.forge),
            self.queue.clone(),
            driver,
            checks,
            Arc::clone(&self.config),
            repo.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(poller.run(shutdown_rx));

        let managed = Arc::new(ManagedRepo {
            repo,
            repo_ref: repo_ref.clone(),
            shutdown: shutdown_tx,
        });

        let mut repos = self.repos.write().expect("registry lock poisoned");
        if repos.contains_key(&key) {
            // Another task admitted the repo while we were; ours yields.
            drop(repos);
            debug!(repo = %repo_ref, "Lost admission race, cancelling poller");
            let _ = managed.shutdown.send(true);
            return Ok(());
        }
        repos.insert(key, managed);
        Ok(())
    }

    /// Take a repo out of management: stop its poller, then drain its
    /// queue asynchronously (best-effort branch cleanup, dequeue all).
    /// The repo row itself is retained.
    pub fn remove(&self, full_name: &str) {
        let managed = {
            let mut repos = self.repos.write().expect("registry lock poisoned");
            repos.remove(full_name)
        };

        let Some(managed) = managed else {
            return;
        };

        info!(repo = %managed.repo_ref, "Removing repo from management");
        let _ = managed.shutdown.send(true);

        let queue = self.queue.clone();
        let driver = self.driver();
        tokio::spawn(async move {
            let drain = async {
                match queue.list_active(&managed.repo).await {
                    Ok(entries) => {
                        for entry in &entries {
                            driver.cleanup_merge_branch(&managed.repo_ref, entry).await;
                        }
                    }
                    Err(e) => {
                        warn!(repo = %managed.repo_ref, error = %e, "Failed to list entries for drain")
                    }
                }
                match queue.store().dequeue_all(&managed.repo).await {
                    Ok(count) if count > 0 => {
                        info!(repo = %managed.repo_ref, count, "Drained queue entries")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(repo = %managed.repo_ref, error = %e, "Failed to drain queue"),
                }
            };

            if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                warn!(repo = %managed.repo_ref, "Drain timed out");
            }
        });
    }

    pub fn lookup(&self, full_name: &str) -> Option<Arc<ManagedRepo>> {
        self.repos
            .read()
            .expect("registry lock poisoned")
            .get(full_name)
            .cloned()
    }

    pub fn contains(&self, full_name: &str) -> bool {
        self.repos
            .read()
            .expect("registry lock poisoned")
            .contains_key(full_name)
    }

    pub fn list(&self) -> Vec<RepoRef> {
        let mut refs: Vec<RepoRef> = self
            .repos
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|m| m.repo_ref.clone())
            .collect();
        refs.sort_by_key(|r| r.full_name());
        refs
    }

    /// All managed repos, sorted by full name. The dashboard reads through
    /// this.
    pub fn managed(&self) -> Vec<Arc<ManagedRepo>> {
        let mut repos: Vec<Arc<ManagedRepo>> = self
            .repos
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        repos.sort_by_key(|m| m.repo_ref.full_name());
        repos
    }

    pub fn keys(&self) -> HashSet<String> {
        self.repos
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Stop every poller. Used at process shutdown.
    pub fn shutdown_all(&self) {
        let repos = self.repos.read().expect("registry lock poisoned");
        for managed in repos.values() {
            let _ = managed.shutdown.send(true);
        }
    }

    /// Make sure each status-checked protection rule on the repo requires
    /// our context, so the forge's automerge waits for the queue.
    async fn ensure_protection(&self, repo_ref: &RepoRef) -> Result<()> {
        let protections = self.forge.list_branch_protections(repo_ref).await?;

        if protections.is_empty() {
            warn!(repo = %repo_ref, "No branch protection; automerge will not be gated");
            return Ok(());
        }

        for mut protection in protections {
            let has_context = protection
                .status_check_contexts
                .iter()
                .any(|c| c == CONTEXT_NAME);
            if protection.enable_status_check && has_context {
                continue;
            }

            protection.enable_status_check = true;
            if !has_context {
                protection.status_check_contexts.push(CONTEXT_NAME.to_string());
            }

            info!(
                repo = %repo_ref,
                branch = %protection.branch_name,
                "Adding merge queue context to branch protection"
            );
            self.forge
                .update_branch_protection(repo_ref, &protection)
                .await?;
        }

        Ok(())
    }

    /// Make sure a status webhook pointing at this instance exists.
    async fn ensure_webhook(&self, repo_ref: &RepoRef) -> Result<()> {
        let url = self.config.webhook_url();
        let hooks = self.forge.list_hooks(repo_ref).await?;
        if hooks.iter().any(|h| h.config.url == url) {
            return Ok(());
        }

        info!(repo = %repo_ref, url = %url, "Creating status webhook");
        self.forge
            .create_hook(
                repo_ref,
                &CreateHookOptions {
                    hook_type: "gitea".to_string(),
                    events: vec!["status".to_string()],
                    active: true,
                    config: CreateHookConfig {
                        url,
                        content_type: "json".to_string(),
                        secret: self.config.webhook_secret.expose_secret().to_string(),
                    },
                },
            )
            .await?;
        Ok(())
    }
}
