//! Queue entry and check status records
//!
//! A queue entry tracks one pull request from the moment its automerge is
//! observed until the forge merges it (or it is removed with a reason).
//! Check statuses are the per-context results reported against the entry's
//! merge branch.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// State of a queue entry.
///
/// `Queued` and `Testing` are active; `Success` is terminal pending the
/// forge's own merge confirmation; `Failed` and `Cancelled` are terminal and
/// removed on the next queue advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Queued,
    Testing,
    Success,
    Failed,
    Cancelled,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Testing => "testing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Active entries occupy a queue position. Terminal entries only exist
    /// between the terminal write and the advance that removes them.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Testing | Self::Success)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

impl FromStr for EntryState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "testing" => Ok(Self::Testing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(Error::InvalidEntryState(s.to_string())),
        }
    }
}

/// State of a single named check on an entry's merge branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }

    pub fn is_failing(&self) -> bool {
        matches!(self, Self::Failure | Self::Error)
    }
}

impl FromStr for CheckState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "error" => Ok(Self::Error),
            _ => Err(Error::InvalidCheckState(s.to_string())),
        }
    }
}

/// One pull request's position in a merge queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub repo_id: i64,
    pub pr_number: i64,
    /// Head SHA at enqueue time. A later push invalidates the entry.
    pub pr_head_sha: String,
    pub target_branch: String,
    pub state: EntryState,
    pub enqueued_at: DateTime<Utc>,
    /// Set on the Queued -> Testing transition.
    pub testing_started_at: Option<DateTime<Utc>>,
    /// Set on any transition into Success or a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    pub merge_branch_name: Option<String>,
    pub merge_branch_sha: Option<String>,
    /// Reason for removal, readable between the terminal write and the
    /// advance that deletes the row.
    pub error_message: Option<String>,
}

/// Latest recorded result for one check context on an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub id: i64,
    pub entry_id: i64,
    pub context: String,
    pub state: CheckState,
    pub updated_at: DateTime<Utc>,
}
