//! Error types for mq-web

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] mq_core::Error),

    #[error(transparent)]
    Forge(#[from] mq_gitea::ForgeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transient forge trouble: the caller pauses and the next cycle
    /// retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Forge(e) if e.is_transient())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
