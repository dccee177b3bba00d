//! Scalefeed daemon library
//!
//! This module re-exports the daemon's modules for integration testing.

pub mod config;
pub mod ipc;
pub mod pipeline;

pub use config::DaemonConfig;
pub use ipc::{ControlCommand, ControlContext, ControlServer, LinkStatus, StatusReport};
pub use pipeline::Pipeline;
