//! Managed repository records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A repository row as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Repo {
    /// "owner/name" as used in forge payloads and registry keys.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// An "owner/name" reference to a repository, independent of the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse "owner/name". Returns `None` when either part is empty or the
    /// separator is missing.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(owner, name))
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl From<&Repo> for RepoRef {
    fn from(repo: &Repo) -> Self {
        Self::new(repo.owner.clone(), repo.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_ref_parse() {
        let r = RepoRef::parse("org/app").unwrap();
        assert_eq!(r.owner, "org");
        assert_eq!(r.name, "app");
        assert_eq!(r.full_name(), "org/app");
    }

    #[test]
    fn test_repo_ref_parse_rejects_malformed() {
        assert!(RepoRef::parse("noslash").is_none());
        assert!(RepoRef::parse("/app").is_none());
        assert!(RepoRef::parse("org/").is_none());
    }
}
