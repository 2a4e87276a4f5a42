//! Downstream byte-sink interface and a channel-backed implementation.

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Downstream callback that receives decoded message payloads.
///
/// Invoked synchronously from the receive task's sole scheduling thread, so
/// implementations must not block indefinitely.
pub trait ByteSink: Send + Sync {
    /// Delivers one decoded payload together with the identifier of the
    /// worker channel it arrived on.
    fn receive(&self, payload: &[u8], channel_id: &str);
}

/// One delivery forwarded through a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkMessage {
    /// Decoded payload bytes.
    pub payload: Vec<u8>,
    /// Channel identifier of the worker that produced the payload.
    pub channel_id: String,
}

/// A [`ByteSink`] backed by a bounded tokio channel.
///
/// Delivery uses `try_send`: when the host drains too slowly the payload is
/// dropped with a warning rather than stalling the receive loop.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SinkMessage>,
}

impl ChannelSink {
    /// Creates a sink with the given channel capacity, returning the sink
    /// and the receiver the host drains.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl ByteSink for ChannelSink {
    fn receive(&self, payload: &[u8], channel_id: &str) {
        let message = SinkMessage {
            payload: payload.to_vec(),
            channel_id: channel_id.to_string(),
        };
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(channel = %channel_id, "sink channel full, dropping payload");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(channel = %channel_id, "sink channel closed, dropping payload");
            }
        }
    }
}
