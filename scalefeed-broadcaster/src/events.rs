use std::sync::Arc;
use std::time::Duration;

use scalefeed_store::LivePayload;

/// Frames pushed to live subscribers, in server-sent-events wire format
#[derive(Debug, Clone, PartialEq)]
pub enum LiveFrame {
    /// Reconnect hint, sent once when the subscription starts
    Retry(Duration),

    /// Current live payload
    Payload(Arc<LivePayload>),

    /// Comment frame that keeps idle connections from timing out
    KeepAlive,
}

impl LiveFrame {
    /// Encode the frame including its blank-line terminator
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            LiveFrame::Retry(delay) => Ok(format!("retry: {}\n\n", delay.as_millis())),
            LiveFrame::Payload(payload) => {
                let json = serde_json::to_string(payload.as_ref())?;
                Ok(format!("data: {}\n\n", json))
            }
            LiveFrame::KeepAlive => Ok(": keep-alive\n\n".to_string()),
        }
    }
}
