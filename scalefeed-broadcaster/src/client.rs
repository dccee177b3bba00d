use std::sync::Arc;
use std::time::Duration;

use scalefeed_store::LivePayload;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::{BroadcasterError, Result};
use crate::events::LiveFrame;

pub type SubscriberId = u64;

/// One live connection and its keep-alive timer.
///
/// Payloads arrive through `updates` in hub broadcast order. The writer
/// ends when the hub drops the sender, the peer closes its side, or a
/// write fails or blocks longer than `write_timeout`.
pub struct Subscriber<S> {
    id: SubscriberId,
    stream: S,
    updates: mpsc::Receiver<Arc<LivePayload>>,
    retry: Duration,
    keep_alive: Duration,
    write_timeout: Duration,
}

impl<S> Subscriber<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        id: SubscriberId,
        stream: S,
        updates: mpsc::Receiver<Arc<LivePayload>>,
        retry: Duration,
        keep_alive: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            stream,
            updates,
            retry,
            keep_alive,
            write_timeout,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Write frames until the connection ends.
    pub async fn run(self) -> Result<()> {
        let Self {
            stream,
            mut updates,
            retry,
            keep_alive,
            write_timeout,
            ..
        } = self;
        let (mut reader, mut writer) = tokio::io::split(stream);

        send_frame(&mut writer, &LiveFrame::Retry(retry), write_timeout).await?;

        let mut keep_alive_timer = time::interval_at(Instant::now() + keep_alive, keep_alive);
        keep_alive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Inbound bytes are ignored; reading only detects closure
        let mut discard = [0u8; 256];

        loop {
            tokio::select! {
                biased;

                update = updates.recv() => match update {
                    Some(payload) => {
                        send_frame(&mut writer, &LiveFrame::Payload(payload), write_timeout).await?
                    }
                    None => return Ok(()),
                },

                _ = keep_alive_timer.tick() => {
                    send_frame(&mut writer, &LiveFrame::KeepAlive, write_timeout).await?;
                }

                read = reader.read(&mut discard) => match read {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }
}

async fn send_frame<W>(writer: &mut W, frame: &LiveFrame, write_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode()?;
    time::timeout(write_timeout, async {
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| BroadcasterError::WriteTimeout(write_timeout))??;
    Ok(())
}
