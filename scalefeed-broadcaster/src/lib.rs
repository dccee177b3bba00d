//! Live fan-out hub for scale readings
//!
//! Keeps the most recent live payload and streams it to any number of
//! subscribers as server-sent-event frames over a Unix domain socket.
//!
//! # Features
//!
//! - Unix domain socket server (owner-only permissions)
//! - Current payload replayed to every new subscriber
//! - Cold start seeded from the latest stored record
//! - Per-subscriber keep-alive comments
//! - Closed, failing or stalled subscribers are dropped without affecting others
//!
//! # Wire format
//!
//! ```text
//! retry: 5000
//!
//! data: {"weight":2.25,"volume":410.0,"price":95.5,"feeType":"C","timestamp":"...","id":12}
//!
//! : keep-alive
//!
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use scalefeed_broadcaster::{HubConfig, LiveHub};
//! use scalefeed_store::LivePayload;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = LiveHub::new(HubConfig::default(), None);
//!     hub.start("/tmp/scalefeed_live.sock").await?;
//!
//!     hub.broadcast(LivePayload {
//!         weight: Some(2.25),
//!         ..LivePayload::empty()
//!     });
//!
//!     hub.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod events;
pub mod hub;

// Re-exports
pub use client::SubscriberId;
pub use error::{BroadcasterError, Result};
pub use events::LiveFrame;
pub use hub::{
    HubConfig, LiveHub, DEFAULT_KEEP_ALIVE, DEFAULT_MAX_QUEUED, DEFAULT_RETRY_HINT,
    DEFAULT_WRITE_TIMEOUT,
};
