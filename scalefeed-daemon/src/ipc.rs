//! Unix socket control server (status, latest, publish, quit)

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use scalefeed_ingest::{LinkManager, LinkOpener, LinkState};
use scalefeed_store::{LivePayload, StoredRecord};

use crate::pipeline::Pipeline;

/// Upper bound on a single command line
const MAX_COMMAND_LEN: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("publish requires a JSON record")]
    MissingRecord,

    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] serde_json::Error),
}

/// Control command
#[derive(Debug, PartialEq)]
pub enum ControlCommand {
    Status,
    Latest,
    Publish(StoredRecord),
    Quit,
}

impl ControlCommand {
    pub fn parse(line: &str) -> std::result::Result<Self, ControlError> {
        let line = line.trim();
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));

        match verb.to_lowercase().as_str() {
            "status" => Ok(Self::Status),
            "latest" => Ok(Self::Latest),
            "publish" => {
                let rest = rest.trim();
                if rest.is_empty() {
                    return Err(ControlError::MissingRecord);
                }
                Ok(Self::Publish(serde_json::from_str(rest)?))
            }
            "quit" | "exit" | "shutdown" => Ok(Self::Quit),
            _ => Err(ControlError::UnknownCommand(line.to_string())),
        }
    }
}

/// Read-only view of the ingestion link for status reports
pub trait LinkStatus: Send + Sync {
    fn link_state(&self) -> LinkState;
    fn open_attempts(&self) -> u64;
    fn link_enabled(&self) -> bool;
}

impl<O: LinkOpener> LinkStatus for LinkManager<O> {
    fn link_state(&self) -> LinkState {
        self.state()
    }

    fn open_attempts(&self) -> u64 {
        LinkManager::open_attempts(self)
    }

    fn link_enabled(&self) -> bool {
        self.config().target().is_ok()
    }
}

/// Response to `status`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub link_state: String,
    pub link_enabled: bool,
    pub open_attempts: u64,
    pub subscribers: usize,
    /// `None` when the store could not be queried
    pub stored_records: Option<u64>,
    pub latest: LivePayload,
}

/// Everything a control command may touch
#[derive(Clone)]
pub struct ControlContext {
    pub pipeline: Pipeline,
    pub link: Arc<dyn LinkStatus>,
    pub shutdown: Arc<Notify>,
}

impl ControlContext {
    pub async fn status(&self) -> StatusReport {
        let store = Arc::clone(self.pipeline.store());
        let stored_records = match tokio::task::spawn_blocking(move || store.count()).await {
            Ok(Ok(count)) => Some(count),
            Ok(Err(e)) => {
                warn!("Failed to count stored records: {:#}", e);
                None
            }
            Err(e) => {
                error!("Record count task failed: {}", e);
                None
            }
        };

        StatusReport {
            link_state: self.link.link_state().to_string(),
            link_enabled: self.link.link_enabled(),
            open_attempts: self.link.open_attempts(),
            subscribers: self.pipeline.hub().subscriber_count(),
            stored_records,
            latest: (*self.pipeline.latest()).clone(),
        }
    }

    /// Run one command and produce its response text
    pub async fn execute(&self, command: ControlCommand) -> String {
        let response = match command {
            ControlCommand::Status => serde_json::to_string(&self.status().await),
            ControlCommand::Latest => serde_json::to_string(self.pipeline.latest().as_ref()),
            ControlCommand::Publish(record) => {
                let payload = self.pipeline.publish_record(&record);
                serde_json::to_string(payload.as_ref())
            }
            ControlCommand::Quit => {
                info!("Received quit command");
                self.shutdown.notify_one();
                return "Shutting down".to_string();
            }
        };

        response.unwrap_or_else(|e| format!("Error: {}", e))
    }
}

/// Unix socket control server
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    context: ControlContext,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale socket file
    pub fn bind(socket_path: &Path, context: ControlContext) -> Result<Self> {
        let _ = std::fs::remove_file(socket_path);

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind control socket {}", socket_path.display()))?;
        scalefeed_paths::secure_socket_permissions(socket_path)?;

        info!("Control server listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            context,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &context).await {
                            debug!("Control connection error: {:#}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Handle a single control connection: one command, one response
pub async fn handle_connection<S>(stream: S, context: &ControlContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader.take(MAX_COMMAND_LEN));

    let mut request = String::new();
    let n = reader
        .read_line(&mut request)
        .await
        .context("Failed to read control command")?;
    if n == 0 {
        return Ok(());
    }

    debug!("Received control command: {}", request.trim());

    let response = match ControlCommand::parse(&request) {
        Ok(command) => context.execute(command).await,
        Err(e) => format!("Error: {}", e),
    };

    writer.write_all(response.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    Ok(())
}
