//! Error types for ingestion

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Link error: {0}")]
    Link(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Link manager already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub fn link<S: Into<String>>(msg: S) -> Self {
        Self::Link(msg.into())
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
