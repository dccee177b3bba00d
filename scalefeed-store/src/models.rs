//! Data models shared by the ingestion pipeline, the live hub and the store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display label for a measurement whose category code was never observed.
pub const UNKNOWN_FEE_TYPE: &str = "unknown";

/// Category code written to the store for measurements without one.
pub const STORED_UNKNOWN_FEE_TYPE: &str = "U";

/// One fully assembled sensor reading.
///
/// Only built once weight, volume and price have all been observed; never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub weight: f64,
    pub volume: f64,
    pub price: f64,
    /// Single uppercase category code, `None` when the device never sent one
    pub fee_type: Option<char>,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    /// Category code, or `"unknown"`.
    pub fn fee_type_label(&self) -> String {
        match self.fee_type {
            Some(code) => code.to_string(),
            None => UNKNOWN_FEE_TYPE.to_string(),
        }
    }

    /// Build the record the store should persist for this measurement.
    pub fn to_new_record(&self, source: Option<&str>) -> NewRecord {
        NewRecord {
            weight: self.weight,
            volume: self.volume,
            price: self.price,
            fee_type: self
                .fee_type
                .map(|code| code.to_string())
                .unwrap_or_else(|| STORED_UNKNOWN_FEE_TYPE.to_string()),
            source: source.map(str::to_string),
            timestamp: self.timestamp,
        }
    }
}

/// Subscriber-visible projection of the latest measurement or stored record.
///
/// Every field is nullable: a subscriber joining a fresh process with an
/// empty store receives the all-null payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LivePayload {
    pub weight: Option<f64>,
    pub volume: Option<f64>,
    pub price: Option<f64>,
    pub fee_type: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Durable record identifier, once the reading has been stored
    pub id: Option<i64>,
}

impl LivePayload {
    /// The all-null payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when no reading has been projected into this payload.
    pub fn is_empty(&self) -> bool {
        self.weight.is_none() && self.volume.is_none() && self.price.is_none()
    }
}

impl From<&Measurement> for LivePayload {
    fn from(m: &Measurement) -> Self {
        Self {
            weight: Some(m.weight),
            volume: Some(m.volume),
            price: Some(m.price),
            fee_type: m.fee_type.map(|code| code.to_string()),
            timestamp: Some(m.timestamp),
            id: None,
        }
    }
}

impl From<&StoredRecord> for LivePayload {
    fn from(record: &StoredRecord) -> Self {
        Self {
            weight: Some(record.weight),
            volume: Some(record.volume),
            price: Some(record.price),
            fee_type: Some(record.fee_type.clone())
                .filter(|code| !code.is_empty() && code != STORED_UNKNOWN_FEE_TYPE),
            timestamp: Some(record.timestamp),
            id: Some(record.id),
        }
    }
}

/// Record handed to [`crate::RecordStore::create`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecord {
    pub weight: f64,
    pub volume: f64,
    pub price: f64,
    pub fee_type: String,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Record as persisted, carrying its store identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: i64,
    pub weight: f64,
    pub volume: f64,
    pub price: f64,
    pub fee_type: String,
    #[serde(default)]
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StoredRecord {
    pub fn from_new(id: i64, record: &NewRecord) -> Self {
        Self {
            id,
            weight: record.weight,
            volume: record.volume,
            price: record.price,
            fee_type: record.fee_type.clone(),
            source: record.source.clone(),
            timestamp: record.timestamp,
        }
    }
}
