use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BroadcasterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode live frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to bind live socket {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to restrict live socket {}: {reason}", path.display())]
    Permissions { path: PathBuf, reason: String },

    /// Peer stopped reading; the subscriber is dropped
    #[error("Subscriber write stalled for {0:?}")]
    WriteTimeout(Duration),

    #[error("Live hub not started")]
    NotStarted,

    #[error("Live hub already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, BroadcasterError>;
