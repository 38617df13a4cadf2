//! Error types for mq-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid entry state: {0}")]
    InvalidEntryState(String),

    #[error("Invalid check state: {0}")]
    InvalidCheckState(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
