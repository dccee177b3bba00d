//! Scalefeed serial ingestion
//!
//! Turns the raw line-oriented output of a weighing/pricing device into
//! finalized measurements and decides which of them deserve a durable write.
//!
//! ## Architecture
//!
//! ```text
//! Serial device (tokio-serial)
//!   │
//!   └─> LinkManager (open / reopen loop)
//!         │ chunks
//!         └─> MeasurementAssembler (line split + field patterns)
//!               │ Measurement
//!               └─> PersistGate (significance + throttle + de-dup)
//! ```

pub mod assembler;
pub mod error;
pub mod gate;
pub mod link;
pub mod serial;

pub use assembler::{parse_line, Accumulation, Field, MeasurementAssembler};
pub use error::{IngestError, Result};
pub use gate::{
    is_significant_change, Fingerprint, GateConfig, PersistDecision, PersistGate,
    DEFAULT_MIN_PERSIST_INTERVAL, DEFAULT_PRICE_THRESHOLD, DEFAULT_VOLUME_THRESHOLD,
    DEFAULT_WEIGHT_THRESHOLD,
};
pub use link::{
    LinkConfig, LinkInactive, LinkManager, LinkOpener, LinkState, LinkTarget,
    DEFAULT_BAUD_RATE, DEFAULT_REOPEN_DELAY,
};
pub use serial::SerialOpener;
