//! Application side of the transport: where decrypted payloads go.

use bytes::Bytes;
use tokio::sync::mpsc;

use meshlink_core::NodeId;

/// Consumer of decrypted application payloads. Called from the receive
/// task, so implementations must not block.
pub trait PayloadReceiver: Send + Sync + 'static {
    fn accept(&self, from: NodeId, payload: Bytes);
}

/// A payload delivered by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub from: NodeId,
    pub payload: Bytes,
}

impl PayloadReceiver for mpsc::UnboundedSender<Inbound> {
    fn accept(&self, from: NodeId, payload: Bytes) {
        if self.send(Inbound { from, payload }).is_err() {
            tracing::debug!(peer = from, "payload receiver closed, dropping payload");
        }
    }
}

/// Receiver that forwards into an unbounded channel, plus its read end.
pub fn channel() -> (mpsc::UnboundedSender<Inbound>, mpsc::UnboundedReceiver<Inbound>) {
    mpsc::unbounded_channel()
}
