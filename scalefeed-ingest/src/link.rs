//! Link supervisor: keeps the ingestion link open across faults
//!
//! ```text
//! Closed ──start──> Opening ──ok──> Open ──error/EOF──┐
//!                      │                              │
//!                      └──failed──> ReopenScheduled <─┘
//!                                        │ (reopen delay)
//!                                        └──> Opening ...
//! ```
//!
//! A single supervisor task owns the link, so there is never more than one
//! pending reopen. Retry is unbounded with a fixed delay.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_REOPEN_DELAY: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 1024;

/// Link settings, read once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Device path; `None` or empty disables ingestion
    pub path: Option<String>,
    pub baud_rate: u32,
    pub enabled: bool,
    pub reopen_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            path: None,
            baud_rate: DEFAULT_BAUD_RATE,
            enabled: true,
            reopen_delay: DEFAULT_REOPEN_DELAY,
        }
    }
}

impl LinkConfig {
    /// What to open, or why ingestion stays off.
    pub fn target(&self) -> std::result::Result<LinkTarget, LinkInactive> {
        if !self.enabled {
            return Err(LinkInactive::Disabled);
        }
        match self.path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => Ok(LinkTarget {
                path: path.to_string(),
                baud_rate: self.baud_rate,
            }),
            None => Err(LinkInactive::Unconfigured),
        }
    }
}

/// Reason a [`LinkConfig`] has nothing to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInactive {
    Disabled,
    Unconfigured,
}

impl fmt::Display for LinkInactive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkInactive::Disabled => f.write_str("disabled by configuration"),
            LinkInactive::Unconfigured => f.write_str("no link path configured"),
        }
    }
}

/// Address and rate of the link to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub path: String,
    pub baud_rate: u32,
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {} baud", self.path, self.baud_rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    ReopenScheduled,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Closed => write!(f, "closed"),
            LinkState::Opening => write!(f, "opening"),
            LinkState::Open => write!(f, "open"),
            LinkState::ReopenScheduled => write!(f, "reopen_scheduled"),
        }
    }
}

/// Opens the byte stream the supervisor reads from.
pub trait LinkOpener: Send + Sync + 'static {
    type Link: AsyncRead + Unpin + Send + 'static;

    fn open(&self, target: &LinkTarget) -> impl Future<Output = io::Result<Self::Link>> + Send;
}

/// Owns the ingestion link lifecycle and forwards every chunk to a sink.
pub struct LinkManager<O: LinkOpener> {
    opener: Arc<O>,
    config: LinkConfig,
    state_tx: Arc<watch::Sender<LinkState>>,
    open_attempts: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<O: LinkOpener> LinkManager<O> {
    pub fn new(opener: O, config: LinkConfig) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Closed);
        Self {
            opener: Arc::new(opener),
            config,
            state_tx: Arc::new(state_tx),
            open_attempts: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Start supervising the link, forwarding each received chunk to `sink`.
    ///
    /// Returns `Ok(false)` without doing anything when ingestion is disabled
    /// or no link path is configured.
    pub fn start<F>(&self, sink: F) -> Result<bool>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let target = match self.config.target() {
            Ok(target) => target,
            Err(reason) => {
                info!("Serial ingestion not started: {}", reason);
                return Ok(false);
            }
        };

        let mut task = self.task.lock();
        if task.is_some() {
            return Err(IngestError::AlreadyRunning);
        }

        info!("Starting serial ingestion on {}", target);
        *task = Some(tokio::spawn(supervise(
            Arc::clone(&self.opener),
            target,
            self.config.reopen_delay,
            Arc::clone(&self.state_tx),
            Arc::clone(&self.open_attempts),
            sink,
        )));

        Ok(true)
    }

    /// Stop supervising and close the link. Safe to call repeatedly.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            // Wait for the abort so the link is closed when we return
            let _ = task.await;
            info!("Serial ingestion stopped");
        }
        self.state_tx.send_replace(LinkState::Closed);
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Total open attempts since construction
    pub fn open_attempts(&self) -> u64 {
        self.open_attempts.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }
}

impl<O: LinkOpener> Drop for LinkManager<O> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn supervise<O, F>(
    opener: Arc<O>,
    target: LinkTarget,
    reopen_delay: Duration,
    state_tx: Arc<watch::Sender<LinkState>>,
    open_attempts: Arc<AtomicU64>,
    mut sink: F,
) where
    O: LinkOpener,
    F: FnMut(&[u8]) + Send + 'static,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        state_tx.send_replace(LinkState::Opening);
        open_attempts.fetch_add(1, Ordering::Relaxed);

        match opener.open(&target).await {
            Ok(mut link) => {
                state_tx.send_replace(LinkState::Open);
                info!("Serial link opened on {}", target);

                loop {
                    match link.read(&mut buffer).await {
                        Ok(0) => {
                            warn!("Serial link {} closed", target.path);
                            break;
                        }
                        Ok(n) => sink(&buffer[..n]),
                        Err(e) => {
                            warn!("Serial link error on {}: {}", target.path, e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Serial link open error ({}): {}", target.path, e);
            }
        }

        state_tx.send_replace(LinkState::ReopenScheduled);
        debug!("Reopening {} in {:?}", target.path, reopen_delay);
        tokio::time::sleep(reopen_delay).await;
    }
}
