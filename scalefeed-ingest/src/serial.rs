//! Serial port opener backed by `tokio-serial`

use std::future::Future;
use std::io;

use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::link::{LinkOpener, LinkTarget};

/// Opens the configured device as an async serial stream (8N1).
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl LinkOpener for SerialOpener {
    type Link = SerialStream;

    fn open(&self, target: &LinkTarget) -> impl Future<Output = io::Result<SerialStream>> + Send {
        let builder = tokio_serial::new(target.path.clone(), target.baud_rate);
        async move { builder.open_native_async().map_err(io::Error::from) }
    }
}
