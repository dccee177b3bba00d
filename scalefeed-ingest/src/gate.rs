//! Change/throttle gate deciding which measurements reach the durable store
//!
//! Live broadcast is never gated; only persistence is. A measurement is
//! persisted when it differs significantly from the previously broadcast
//! payload, or when the minimum persist interval has elapsed, unless it is
//! identical (by [`Fingerprint`]) to the last persisted one within that
//! interval.

use std::fmt;
use std::time::Duration;

use scalefeed_store::LivePayload;
use tokio::time::Instant;

use crate::error::{IngestError, Result};

pub const DEFAULT_WEIGHT_THRESHOLD: f64 = 0.05;
pub const DEFAULT_VOLUME_THRESHOLD: f64 = 5.0;
pub const DEFAULT_PRICE_THRESHOLD: f64 = 0.5;
pub const DEFAULT_MIN_PERSIST_INTERVAL: Duration = Duration::from_secs(15);

/// Significance thresholds and persist interval
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub weight_threshold: f64,
    pub volume_threshold: f64,
    pub price_threshold: f64,
    pub min_persist_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            weight_threshold: DEFAULT_WEIGHT_THRESHOLD,
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            price_threshold: DEFAULT_PRICE_THRESHOLD,
            min_persist_interval: DEFAULT_MIN_PERSIST_INTERVAL,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("weight_threshold", self.weight_threshold),
            ("volume_threshold", self.volume_threshold),
            ("price_threshold", self.price_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(IngestError::invalid_config(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Rounded identity of a payload used for de-duplication.
///
/// Numbers are rounded to two decimal places; the category code is kept
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(payload: &LivePayload) -> Self {
        fn number(value: Option<f64>) -> String {
            match value {
                Some(v) => format!("{:.2}", v),
                None => "null".to_string(),
            }
        }

        Self(format!(
            "{}|{}|{}|{}",
            number(payload.weight),
            number(payload.volume),
            number(payload.price),
            payload.fee_type.as_deref().unwrap_or("null"),
        ))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of [`PersistGate::evaluate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistDecision {
    Persist,
    /// Insignificant change inside the minimum interval
    Throttled,
    /// Same fingerprint as the last persisted payload inside the interval
    Duplicate,
}

impl PersistDecision {
    pub fn should_persist(self) -> bool {
        matches!(self, PersistDecision::Persist)
    }
}

fn numbers_differ(previous: Option<f64>, current: Option<f64>, threshold: f64) -> bool {
    match (previous, current) {
        (Some(a), Some(b)) if a.is_finite() && b.is_finite() => (a - b).abs() >= threshold,
        _ => true,
    }
}

/// Whether `current` differs enough from `previous` to be worth persisting.
///
/// No previous payload always counts as significant.
pub fn is_significant_change(
    config: &GateConfig,
    previous: Option<&LivePayload>,
    current: &LivePayload,
) -> bool {
    let Some(previous) = previous else {
        return true;
    };

    numbers_differ(previous.weight, current.weight, config.weight_threshold)
        || numbers_differ(previous.volume, current.volume, config.volume_threshold)
        || numbers_differ(previous.price, current.price, config.price_threshold)
        || previous.fee_type != current.fee_type
}

/// Persist decision state: fingerprint and time of the last successful
/// persist, plus the write currently in flight.
///
/// An in-flight write counts as the latest persist until the store answers,
/// so a burst of identical readings queues a single write.
#[derive(Debug)]
pub struct PersistGate {
    config: GateConfig,
    last_persisted: Option<(Fingerprint, Instant)>,
    pending: Option<(Fingerprint, Instant)>,
}

impl PersistGate {
    pub fn new(config: GateConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            last_persisted: None,
            pending: None,
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Decide whether `candidate` should be persisted.
    ///
    /// `previous` is the payload broadcast before `candidate`. A write still
    /// in flight is compared against in place of the last confirmed one.
    /// Does not mutate state; call [`begin_persist`](Self::begin_persist)
    /// when acting on [`PersistDecision::Persist`].
    pub fn evaluate(
        &self,
        previous: Option<&LivePayload>,
        candidate: &LivePayload,
        now: Instant,
    ) -> PersistDecision {
        let Some((fingerprint, at)) = self.pending.as_ref().or(self.last_persisted.as_ref())
        else {
            return PersistDecision::Persist;
        };

        if now.saturating_duration_since(*at) >= self.config.min_persist_interval {
            return PersistDecision::Persist;
        }

        if !is_significant_change(&self.config, previous, candidate) {
            PersistDecision::Throttled
        } else if *fingerprint == Fingerprint::of(candidate) {
            PersistDecision::Duplicate
        } else {
            PersistDecision::Persist
        }
    }

    /// Mark a write of `payload` started at `at` as in flight.
    pub fn begin_persist(&mut self, payload: &LivePayload, at: Instant) {
        self.pending = Some((Fingerprint::of(payload), at));
    }

    /// Remember a successful persist of `payload` at `at`.
    pub fn record_persisted(&mut self, payload: &LivePayload, at: Instant) {
        let fingerprint = Fingerprint::of(payload);
        self.clear_pending(&fingerprint);
        self.last_persisted = Some((fingerprint, at));
    }

    /// Forget the in-flight write of `payload`; the last confirmed persist
    /// stays as it was.
    pub fn persist_failed(&mut self, payload: &LivePayload) {
        self.clear_pending(&Fingerprint::of(payload));
    }

    fn clear_pending(&mut self, fingerprint: &Fingerprint) {
        if self.pending.as_ref().is_some_and(|(f, _)| f == fingerprint) {
            self.pending = None;
        }
    }

    pub fn last_persisted(&self) -> Option<&(Fingerprint, Instant)> {
        self.last_persisted.as_ref()
    }

    pub fn pending(&self) -> Option<&(Fingerprint, Instant)> {
        self.pending.as_ref()
    }
}
