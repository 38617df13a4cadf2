//! mq-web - Control plane and HTTP surface of the merge queue
//!
//! This crate holds everything that drives the queue against the forge:
//! - Per-repo reconciliation pollers
//! - The merge-branch driver
//! - Required-check resolution and verdict application
//! - The managed-repo registry and topic discovery
//! - The status webhook receiver and the dashboard

pub mod checks;
pub mod config;
pub mod dashboard;
pub mod discovery;
pub mod error;
pub mod merge_driver;
pub mod poller;
pub mod registry;
pub mod server;
pub mod webhook;

pub use checks::Checks;
pub use config::AppConfig;
pub use discovery::Discovery;
pub use error::{Error, Result};
pub use merge_driver::{merge_branch_name, MergeDriver, StartTesting, BRANCH_PREFIX};
pub use poller::{Poller, TickReport};
pub use registry::{ManagedRepo, Registry};
pub use server::{create_router, serve, AppState};
pub use webhook::WebhookResponse;
