use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use scalefeed_store::{LivePayload, RecordStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;

use crate::client::{Subscriber, SubscriberId};
use crate::error::{BroadcasterError, Result};

/// Interval between keep-alive comments on an idle subscription
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(25);

/// Reconnect hint sent to every new subscriber
pub const DEFAULT_RETRY_HINT: Duration = Duration::from_secs(5);

/// Payloads queued for one subscriber before it is dropped as stalled
pub const DEFAULT_MAX_QUEUED: usize = 256;

/// Longest a single frame write may block
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    pub keep_alive_interval: Duration,
    pub retry_hint: Duration,
    pub max_queued: usize,
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE,
            retry_hint: DEFAULT_RETRY_HINT,
            max_queued: DEFAULT_MAX_QUEUED,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Latest-value fan-out to live subscribers.
///
/// Holds the most recent payload and pushes every broadcast to all open
/// subscriptions in broadcast order. A new subscriber receives the current
/// payload first. Before anything has been broadcast the current payload
/// is seeded from the store's latest record (once), or stays all-null.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct LiveHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    store: Option<Arc<dyn RecordStore>>,
    state: Mutex<HubState>,
    seeded: OnceCell<()>,
    server: Mutex<Option<HubServer>>,
}

#[derive(Default)]
struct HubState {
    latest: Option<Arc<LivePayload>>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<LivePayload>>>,
    next_id: SubscriberId,
}

impl HubState {
    fn publish(&mut self, payload: LivePayload) -> Arc<LivePayload> {
        let payload = Arc::new(payload);
        self.latest = Some(Arc::clone(&payload));
        self.subscribers
            .retain(|id, updates| match updates.try_send(Arc::clone(&payload)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Dropping stalled subscriber {}", id);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Dropping closed subscriber {}", id);
                    false
                }
            });
        payload
    }
}

struct HubServer {
    socket_path: PathBuf,
    accept_task: JoinHandle<()>,
}

impl LiveHub {
    pub fn new(config: HubConfig, store: Option<Arc<dyn RecordStore>>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                store,
                state: Mutex::new(HubState::default()),
                seeded: OnceCell::new(),
                server: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Replace the current payload and push it to every subscriber
    pub fn broadcast(&self, payload: LivePayload) -> Arc<LivePayload> {
        self.inner.state.lock().publish(payload)
    }

    /// Broadcast `payload` only if `expected` is still the current payload.
    ///
    /// Returns whether the broadcast happened.
    pub fn broadcast_if_latest(&self, expected: &Arc<LivePayload>, payload: LivePayload) -> bool {
        let mut state = self.inner.state.lock();
        match &state.latest {
            Some(current) if Arc::ptr_eq(current, expected) => {
                state.publish(payload);
                true
            }
            _ => false,
        }
    }

    /// Current payload, or the all-null payload when nothing is known yet
    pub fn latest(&self) -> Arc<LivePayload> {
        self.current()
            .unwrap_or_else(|| Arc::new(LivePayload::empty()))
    }

    /// Current payload if one has been broadcast or seeded
    pub fn current(&self) -> Option<Arc<LivePayload>> {
        self.inner.state.lock().latest.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Attach a connection as a live subscriber.
    ///
    /// The subscriber gets the reconnect hint, then the current payload,
    /// then every later broadcast. It is removed when the connection
    /// closes, a write fails or stalls, or more than
    /// [`HubConfig::max_queued`] payloads are waiting for it.
    pub async fn subscribe<S>(&self, stream: S) -> SubscriberId
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.seed_from_store().await;

        let (updates_tx, updates_rx) = mpsc::channel(self.inner.config.max_queued.max(1));
        let (id, total) = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;

            // Registered under the same lock as broadcasts, so the first
            // payload and the following ones cannot interleave
            let current = state
                .latest
                .clone()
                .unwrap_or_else(|| Arc::new(LivePayload::empty()));
            let _ = updates_tx.try_send(current);
            state.subscribers.insert(id, updates_tx);
            (id, state.subscribers.len())
        };
        tracing::info!("Subscriber {} connected. Total: {}", id, total);

        let subscriber = Subscriber::new(
            id,
            stream,
            updates_rx,
            self.inner.config.retry_hint,
            self.inner.config.keep_alive_interval,
            self.inner.config.write_timeout,
        );
        let hub = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = subscriber.run().await {
                tracing::debug!("Subscriber {} write failed: {}", id, e);
            }
            if let Some(inner) = hub.upgrade() {
                LiveHub { inner }.remove(id);
            }
        });

        id
    }

    fn remove(&self, id: SubscriberId) {
        let mut state = self.inner.state.lock();
        if state.subscribers.remove(&id).is_some() {
            tracing::info!(
                "Subscriber {} disconnected. Remaining: {}",
                id,
                state.subscribers.len()
            );
        }
    }

    /// Close every open subscription
    pub fn disconnect_all(&self) {
        let mut state = self.inner.state.lock();
        let count = state.subscribers.len();
        state.subscribers.clear();
        if count > 0 {
            tracing::info!("Disconnected {} subscribers", count);
        }
    }

    async fn seed_from_store(&self) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };

        self.inner
            .seeded
            .get_or_init(|| async move {
                if self.inner.state.lock().latest.is_some() {
                    return;
                }

                match tokio::task::spawn_blocking(move || store.find_latest()).await {
                    Ok(Ok(Some(record))) => {
                        let mut state = self.inner.state.lock();
                        // A broadcast may have landed during the lookup
                        if state.latest.is_none() {
                            state.latest = Some(Arc::new(LivePayload::from(&record)));
                            tracing::info!("Live payload seeded from record {}", record.id);
                        }
                    }
                    Ok(Ok(None)) => tracing::debug!("No stored records, live payload stays empty"),
                    Ok(Err(e)) => tracing::warn!("Failed to load latest record: {:#}", e),
                    Err(e) => tracing::warn!("Latest record lookup task failed: {}", e),
                }
            })
            .await;
    }

    /// Serve subscriptions on a Unix socket
    pub async fn start(&self, socket_path: impl AsRef<Path>) -> Result<()> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let mut server = self.inner.server.lock();
        if server.is_some() {
            return Err(BroadcasterError::AlreadyRunning);
        }

        // Remove stale socket file
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener =
            UnixListener::bind(&socket_path).map_err(|source| BroadcasterError::Bind {
                path: socket_path.clone(),
                source,
            })?;
        scalefeed_paths::secure_socket_permissions(&socket_path).map_err(|e| {
            BroadcasterError::Permissions {
                path: socket_path.clone(),
                reason: format!("{:#}", e),
            }
        })?;

        tracing::info!("Live hub started on {:?} (permissions: 0600)", socket_path);

        let hub = Arc::downgrade(&self.inner);
        let accept_task = tokio::spawn(accept_loop(listener, hub));

        *server = Some(HubServer {
            socket_path,
            accept_task,
        });

        Ok(())
    }

    /// Stop serving, remove the socket file and close all subscriptions
    pub async fn stop(&self) -> Result<()> {
        let server = self
            .inner
            .server
            .lock()
            .take()
            .ok_or(BroadcasterError::NotStarted)?;

        server.accept_task.abort();
        let _ = server.accept_task.await;

        if server.socket_path.exists() {
            std::fs::remove_file(&server.socket_path)?;
        }

        self.disconnect_all();
        tracing::info!("Live hub stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.server.lock().is_some()
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        self.inner
            .server
            .lock()
            .as_ref()
            .map(|server| server.socket_path.clone())
    }
}

async fn accept_loop(listener: UnixListener, hub: Weak<HubInner>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let Some(inner) = hub.upgrade() else {
                    break;
                };
                let hub = LiveHub { inner };
                tokio::spawn(async move {
                    hub.subscribe(stream).await;
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept subscriber: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    tracing::info!("Subscriber acceptance task stopped");
}

impl Drop for HubInner {
    fn drop(&mut self) {
        if let Some(server) = self.server.get_mut().take() {
            server.accept_task.abort();
            let _ = std::fs::remove_file(&server.socket_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use scalefeed_store::{MemoryRecordStore, NewRecord, StoredRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};

    type Frames = BufReader<DuplexStream>;

    async fn connect(hub: &LiveHub) -> Frames {
        let (client, server) = duplex(4096);
        hub.subscribe(server).await;
        BufReader::new(client)
    }

    async fn next_frame(frames: &mut Frames) -> String {
        let mut frame = String::new();
        loop {
            let mut line = String::new();
            let n = frames.read_line(&mut line).await.unwrap();
            assert!(n > 0, "subscription closed");
            if line == "\n" {
                return frame;
            }
            frame.push_str(&line);
        }
    }

    async fn next_payload(frames: &mut Frames) -> LivePayload {
        let frame = next_frame(frames).await;
        let json = frame
            .strip_prefix("data: ")
            .unwrap_or_else(|| panic!("not a data frame: {:?}", frame));
        serde_json::from_str(json.trim_end()).unwrap()
    }

    async fn skip_retry(frames: &mut Frames) {
        assert_eq!(next_frame(frames).await, "retry: 5000\n");
    }

    fn reading(weight: f64) -> LivePayload {
        LivePayload {
            weight: Some(weight),
            volume: Some(300.0),
            price: Some(50.0),
            fee_type: Some("A".to_string()),
            timestamp: Some(Utc::now()),
            id: None,
        }
    }

    fn record(weight: f64) -> NewRecord {
        NewRecord {
            weight,
            volume: 410.0,
            price: 95.5,
            fee_type: "C".to_string(),
            source: Some("Scale Device".to_string()),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        }
    }

    struct CountingStore {
        inner: MemoryRecordStore,
        lookups: AtomicUsize,
    }

    impl RecordStore for CountingStore {
        fn create(&self, record: &NewRecord) -> anyhow::Result<StoredRecord> {
            self.inner.create(record)
        }

        fn find_latest(&self) -> anyhow::Result<Option<StoredRecord>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_latest()
        }

        fn count(&self) -> anyhow::Result<u64> {
            self.inner.count()
        }
    }

    struct BrokenStore;

    impl RecordStore for BrokenStore {
        fn create(&self, _record: &NewRecord) -> anyhow::Result<StoredRecord> {
            anyhow::bail!("store offline")
        }

        fn find_latest(&self) -> anyhow::Result<Option<StoredRecord>> {
            anyhow::bail!("store offline")
        }

        fn count(&self) -> anyhow::Result<u64> {
            anyhow::bail!("store offline")
        }
    }

    #[tokio::test]
    async fn test_cold_start_without_records_sends_empty_payload() {
        let hub = LiveHub::new(HubConfig::default(), Some(Arc::new(MemoryRecordStore::new())));
        let mut frames = connect(&hub).await;

        skip_retry(&mut frames).await;
        let frame = next_frame(&mut frames).await;
        assert_eq!(
            frame,
            "data: {\"weight\":null,\"volume\":null,\"price\":null,\"feeType\":null,\"timestamp\":null,\"id\":null}\n"
        );
        assert!(hub.current().is_none());
    }

    #[tokio::test]
    async fn test_cold_start_replays_latest_record() {
        let store = MemoryRecordStore::new();
        store.create(&record(1.0)).unwrap();
        let stored = store.create(&record(2.25)).unwrap();
        let hub = LiveHub::new(HubConfig::default(), Some(Arc::new(store)));

        let mut frames = connect(&hub).await;
        skip_retry(&mut frames).await;
        let payload = next_payload(&mut frames).await;

        assert_eq!(payload.id, Some(stored.id));
        assert_eq!(payload.weight, Some(2.25));
        assert_eq!(payload.fee_type.as_deref(), Some("C"));
        assert_eq!(hub.latest().id, Some(stored.id));
    }

    #[tokio::test]
    async fn test_store_consulted_once() {
        let store = Arc::new(CountingStore {
            inner: MemoryRecordStore::new(),
            lookups: AtomicUsize::new(0),
        });
        let hub = LiveHub::new(HubConfig::default(), Some(store.clone()));

        let _first = connect(&hub).await;
        let _second = connect(&hub).await;

        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_before_subscribe_skips_store() {
        let store = Arc::new(CountingStore {
            inner: MemoryRecordStore::new(),
            lookups: AtomicUsize::new(0),
        });
        store.inner.create(&record(9.0)).unwrap();
        let hub = LiveHub::new(HubConfig::default(), Some(store.clone()));

        hub.broadcast(reading(1.0));
        let mut frames = connect(&hub).await;
        skip_retry(&mut frames).await;

        assert_eq!(next_payload(&mut frames).await.weight, Some(1.0));
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_failure_falls_back_to_empty_payload() {
        let hub = LiveHub::new(HubConfig::default(), Some(Arc::new(BrokenStore)));
        let mut frames = connect(&hub).await;

        skip_retry(&mut frames).await;
        assert!(next_payload(&mut frames).await.is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_sees_current_then_every_broadcast_in_order() {
        let hub = LiveHub::new(HubConfig::default(), None);
        hub.broadcast(reading(1.0));

        let mut frames = connect(&hub).await;
        for weight in [2.0, 3.0, 4.0] {
            hub.broadcast(reading(weight));
        }

        skip_retry(&mut frames).await;
        for expected in [1.0, 2.0, 3.0, 4.0] {
            assert_eq!(next_payload(&mut frames).await.weight, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_broadcast_if_latest() {
        let hub = LiveHub::new(HubConfig::default(), None);
        let first = hub.broadcast(reading(1.0));

        let promoted = LivePayload {
            id: Some(7),
            ..(*first).clone()
        };
        assert!(hub.broadcast_if_latest(&first, promoted));
        assert_eq!(hub.latest().id, Some(7));

        // `first` is no longer current
        assert!(!hub.broadcast_if_latest(&first, reading(5.0)));
        assert_eq!(hub.latest().weight, Some(1.0));
    }

    #[tokio::test]
    async fn test_latest_defaults_to_empty_payload() {
        let hub = LiveHub::new(HubConfig::default(), None);
        assert!(hub.latest().is_empty());

        hub.broadcast(reading(3.5));
        assert_eq!(hub.latest().weight, Some(3.5));
    }

    #[tokio::test]
    async fn test_closed_subscriber_does_not_block_others() {
        let hub = LiveHub::new(HubConfig::default(), None);
        let gone = connect(&hub).await;
        let mut live = connect(&hub).await;
        assert_eq!(hub.subscriber_count(), 2);

        drop(gone);
        hub.broadcast(reading(1.0));

        skip_retry(&mut live).await;
        assert!(next_payload(&mut live).await.is_empty());
        assert_eq!(next_payload(&mut live).await.weight, Some(1.0));

        tokio::time::timeout(Duration::from_secs(1), async {
            while hub.subscriber_count() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_on_idle_subscription() {
        let hub = LiveHub::new(HubConfig::default(), None);
        let mut frames = connect(&hub).await;
        let connected_at = tokio::time::Instant::now();

        skip_retry(&mut frames).await;
        next_payload(&mut frames).await;

        assert_eq!(next_frame(&mut frames).await, ": keep-alive\n");
        assert!(connected_at.elapsed() >= DEFAULT_KEEP_ALIVE);

        // Broadcasts in between do not reset the keep-alive schedule
        hub.broadcast(reading(1.0));
        assert_eq!(next_payload(&mut frames).await.weight, Some(1.0));
        assert_eq!(next_frame(&mut frames).await, ": keep-alive\n");
        assert!(connected_at.elapsed() >= DEFAULT_KEEP_ALIVE * 2);
        assert!(connected_at.elapsed() < DEFAULT_KEEP_ALIVE * 2 + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_dropped_without_blocking_others() {
        let config = HubConfig {
            max_queued: 8,
            ..HubConfig::default()
        };
        let hub = LiveHub::new(config, None);

        // Never read: the writer blocks once the 64-byte pipe is full
        let (mut stalled, server) = duplex(64);
        hub.subscribe(server).await;
        let (client, server) = duplex(64 * 1024);
        hub.subscribe(server).await;
        let mut healthy = BufReader::new(client);

        for i in 0..100 {
            hub.broadcast(reading(i as f64));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(hub.subscriber_count(), 1);

        skip_retry(&mut healthy).await;
        assert!(next_payload(&mut healthy).await.is_empty());
        for i in 0..100 {
            assert_eq!(next_payload(&mut healthy).await.weight, Some(i as f64));
        }

        // The blocked write gives up and closes the connection
        tokio::time::sleep(DEFAULT_WRITE_TIMEOUT * 2).await;
        let mut buffered = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), stalled.read_to_end(&mut buffered))
            .await
            .expect("stalled connection closed")
            .unwrap();
        assert!(buffered.len() <= 64);
    }

    #[tokio::test]
    async fn test_disconnect_all_ends_subscriptions() {
        let hub = LiveHub::new(HubConfig::default(), None);
        let mut frames = connect(&hub).await;
        skip_retry(&mut frames).await;
        next_payload(&mut frames).await;

        hub.disconnect_all();
        assert_eq!(hub.subscriber_count(), 0);

        let mut rest = String::new();
        assert_eq!(frames.read_line(&mut rest).await.unwrap(), 0);
    }
}
