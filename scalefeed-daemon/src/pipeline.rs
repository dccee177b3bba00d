//! Serial bytes → assembler → gate → live hub / record store

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use scalefeed_broadcaster::LiveHub;
use scalefeed_ingest::{GateConfig, MeasurementAssembler, PersistDecision, PersistGate};
use scalefeed_store::{LivePayload, Measurement, RecordStore, StoredRecord};

/// Ingestion pipeline state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    assembler: Mutex<MeasurementAssembler>,
    gate: Mutex<PersistGate>,
    hub: LiveHub,
    store: Arc<dyn RecordStore>,
    source_label: Option<String>,
}

impl Pipeline {
    pub fn new(
        hub: LiveHub,
        store: Arc<dyn RecordStore>,
        gate: GateConfig,
        source_label: Option<String>,
    ) -> Result<Self> {
        let gate = PersistGate::new(gate).context("Invalid persistence thresholds")?;

        Ok(Self {
            inner: Arc::new(PipelineInner {
                assembler: Mutex::new(MeasurementAssembler::new()),
                gate: Mutex::new(gate),
                hub,
                store,
                source_label,
            }),
        })
    }

    /// Feed raw link bytes. Returns the number of measurements finalized.
    pub fn ingest(&self, chunk: &[u8]) -> usize {
        let measurements = self.inner.assembler.lock().consume(chunk);
        let count = measurements.len();
        for measurement in measurements {
            self.process(measurement);
        }
        count
    }

    /// Data sink for the link manager
    pub fn sink(&self) -> impl FnMut(&[u8]) + Send + 'static {
        let pipeline = self.clone();
        move |chunk: &[u8]| {
            pipeline.ingest(chunk);
        }
    }

    /// Broadcast a finalized measurement and persist it if the gate allows.
    ///
    /// Returns the persist task when one was started.
    pub fn process(&self, measurement: Measurement) -> Option<JoinHandle<()>> {
        let payload = LivePayload::from(&measurement);
        let previous = self.inner.hub.current();
        let decision = {
            let mut gate = self.inner.gate.lock();
            let now = Instant::now();
            let decision = gate.evaluate(previous.as_deref(), &payload, now);
            if decision.should_persist() {
                gate.begin_persist(&payload, now);
            }
            decision
        };

        debug!(
            "Measurement: weight={} volume={} price={} fee_type={} ({:?})",
            measurement.weight,
            measurement.volume,
            measurement.price,
            measurement.fee_type_label(),
            decision
        );

        let broadcast = self.inner.hub.broadcast(payload);

        match decision {
            PersistDecision::Persist => Some(self.spawn_persist(&measurement, broadcast)),
            PersistDecision::Throttled | PersistDecision::Duplicate => None,
        }
    }

    fn spawn_persist(&self, measurement: &Measurement, broadcast: Arc<LivePayload>) -> JoinHandle<()> {
        let record = measurement.to_new_record(self.inner.source_label.as_deref());
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let store = Arc::clone(&inner.store);
            match tokio::task::spawn_blocking(move || store.create(&record)).await {
                Ok(Ok(stored)) => {
                    inner.gate.lock().record_persisted(&broadcast, Instant::now());

                    let promoted = LivePayload {
                        id: Some(stored.id),
                        ..(*broadcast).clone()
                    };
                    if inner.hub.broadcast_if_latest(&broadcast, promoted) {
                        info!("Persisted record {} (live)", stored.id);
                    } else {
                        info!("Persisted record {} (superseded)", stored.id);
                    }
                }
                Ok(Err(e)) => {
                    inner.gate.lock().persist_failed(&broadcast);
                    warn!("Failed to persist measurement: {:#}", e);
                }
                Err(e) => {
                    inner.gate.lock().persist_failed(&broadcast);
                    error!("Persist task failed: {}", e);
                }
            }
        })
    }

    /// Make a record created outside the ingestion path the live payload
    pub fn publish_record(&self, record: &StoredRecord) -> Arc<LivePayload> {
        debug!("Publishing record {}", record.id);
        self.inner.hub.broadcast(LivePayload::from(record))
    }

    pub fn latest(&self) -> Arc<LivePayload> {
        self.inner.hub.latest()
    }

    pub fn hub(&self) -> &LiveHub {
        &self.inner.hub
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }
}
