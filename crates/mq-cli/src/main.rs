//! gitea-mq daemon
//!
//! Loads configuration from the environment, opens the store, and runs the
//! HTTP server, discovery loop, and per-repo pollers until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mq_core::{QueueService, RepoRef, Store};
use mq_gitea::{ForgeClient, GiteaClient};
use mq_web::{AppConfig, AppState, Discovery};
use secrecy::SecretString;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Initialize logging with the specified verbosity level
fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("mq_core={}", level).parse()?)
        .add_directive(format!("mq_gitea={}", level).parse()?)
        .add_directive(format!("mq_web={}", level).parse()?)
        .add_directive(format!("gitea_mq={}", level).parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 1);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "gitea-mq")]
#[command(about = "Merge queue for Gitea")]
#[command(version)]
struct Cli {
    /// Base URL of the Gitea instance
    #[arg(long, env = "GITEA_URL")]
    gitea_url: String,

    /// API token of the bot identity
    #[arg(long, env = "GITEA_TOKEN", hide_env_values = true)]
    gitea_token: String,

    /// SQLite database path
    #[arg(long, env = "MQ_DB_PATH", default_value = "gitea-mq.db")]
    db_path: PathBuf,

    /// Address to listen on
    #[arg(long, env = "MQ_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Public base URL of this instance; used as target_url on posted
    /// statuses and as the webhook delivery address
    #[arg(long, env = "MQ_EXTERNAL_URL")]
    external_url: String,

    /// Path status webhooks are delivered to
    #[arg(long, env = "MQ_WEBHOOK_PATH", default_value = "/webhook")]
    webhook_path: String,

    /// Shared HMAC secret for webhook signatures
    #[arg(long, env = "MQ_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: String,

    /// Seconds between poller ticks
    #[arg(long, env = "MQ_POLL_INTERVAL_SECS", default_value = "30")]
    poll_interval_secs: u64,

    /// Seconds a Testing entry may wait for its checks
    #[arg(long, env = "MQ_CHECK_TIMEOUT_SECS", default_value = "3600")]
    check_timeout_secs: i64,

    /// Seconds a passed entry may wait for the forge's automerge
    #[arg(long, env = "MQ_SUCCESS_TIMEOUT_SECS", default_value = "300")]
    success_timeout_secs: i64,

    /// Dashboard auto-refresh in seconds
    #[arg(long, env = "MQ_DASHBOARD_REFRESH_SECS", default_value = "10")]
    dashboard_refresh_secs: u64,

    /// Fallback required checks, used when branch protection yields none
    #[arg(long, env = "MQ_REQUIRED_CHECKS", value_delimiter = ',')]
    required_checks: Vec<String>,

    /// owner/name repos managed regardless of topic
    #[arg(long, env = "MQ_REPOS", value_delimiter = ',')]
    repos: Vec<String>,

    /// Topic that opts repos into management
    #[arg(long, env = "MQ_TOPIC")]
    topic: Option<String>,

    /// Seconds between discovery cycles
    #[arg(long, env = "MQ_DISCOVERY_INTERVAL_SECS", default_value = "300")]
    discovery_interval_secs: u64,

    /// Increase verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn app_config(&self) -> Result<AppConfig> {
        let explicit_repos = self
            .repos
            .iter()
            .filter(|r| !r.trim().is_empty())
            .map(|r| {
                RepoRef::parse(r.trim())
                    .with_context(|| format!("invalid repo reference '{}', expected owner/name", r))
            })
            .collect::<Result<Vec<_>>>()?;

        if explicit_repos.is_empty() && self.topic.is_none() {
            bail!("nothing to manage: set MQ_REPOS and/or MQ_TOPIC");
        }

        Ok(AppConfig {
            external_url: self.external_url.clone(),
            webhook_path: self.webhook_path.clone(),
            webhook_secret: SecretString::new(self.webhook_secret.clone()),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            check_timeout: chrono::Duration::seconds(self.check_timeout_secs),
            success_timeout: chrono::Duration::seconds(self.success_timeout_secs),
            dashboard_refresh_secs: self.dashboard_refresh_secs,
            fallback_required_checks: self.required_checks.clone(),
            explicit_repos,
            topic: self.topic.clone(),
            discovery_interval: Duration::from_secs(self.discovery_interval_secs),
        })
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_json)?;

    let config = Arc::new(cli.app_config()?);

    let store = Store::new(&cli.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", cli.db_path.display()))?;
    let queue = QueueService::new(store);

    // Queue state survives restarts; report what we resume with.
    let recovered = queue.store().load_active_across_repos().await?;
    if !recovered.is_empty() {
        info!(entries = recovered.len(), "Recovered active queue entries");
        for (repo, entry) in &recovered {
            info!(
                repo = %repo.full_name(),
                pr = entry.pr_number,
                target = %entry.target_branch,
                state = entry.state.as_str(),
                "Recovered entry"
            );
        }
    }

    let forge: Arc<dyn ForgeClient> = Arc::new(
        GiteaClient::new(
            cli.gitea_url.clone(),
            SecretString::new(cli.gitea_token.clone()),
        )
        .context("failed to build Gitea client")?,
    );

    let state = Arc::new(AppState::new(forge.clone(), queue, config.clone()));

    // Root shutdown channel: SIGINT/SIGTERM fans out to every task.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // Discovery admits explicit repos immediately and reconciles the topic
    // on its interval.
    let discovery = Discovery::new(forge, state.registry.clone(), config);
    tokio::spawn(discovery.run(shutdown_rx.clone()));

    mq_web::serve(cli.listen_addr, state.clone(), shutdown_rx).await?;

    state.registry.shutdown_all();
    info!("Shutdown complete");
    Ok(())
}
