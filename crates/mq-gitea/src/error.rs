//! Error types for mq-gitea
//!
//! Callers handle forge failures by kind, not by concrete variant: a
//! missing resource on a destructive operation is success, a merge conflict
//! is a queue event, and transient transport/server failures pause the
//! caller until its next cycle.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    #[error("Forge API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Git error: {0}")]
    Git(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForgeError {
    /// The resource is already gone; destructive operations treat this as
    /// success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The merge could not be produced because of conflicting changes.
    pub fn is_merge_conflict(&self) -> bool {
        matches!(self, Self::MergeConflict(_))
    }

    /// Network trouble or a server-side failure; retried implicitly by the
    /// next poll cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(ForgeError::NotFound("branch".into()).is_not_found());
        assert!(ForgeError::MergeConflict("pr 42".into()).is_merge_conflict());
        assert!(ForgeError::Api {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
        assert!(!ForgeError::Api {
            status: 403,
            message: "forbidden".into()
        }
        .is_transient());
        assert!(!ForgeError::NotFound("branch".into()).is_transient());
    }
}
