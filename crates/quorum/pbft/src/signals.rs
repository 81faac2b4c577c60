//! Outgoing and incoming message signals
//!
//! Transport is external. The engine publishes every message it sends on `outgoing` and every
//! message handed to it on `incoming`; subscribers relay or observe them. Publishing never
//! blocks and a missing or lagging subscriber never fails the engine.

use crate::PbftMessage;
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity
pub const DEFAULT_SIGNAL_CAPACITY: usize = 1024;

/// Broadcast channels for PBFT traffic
#[derive(Debug, Clone)]
pub struct PbftSignals {
    outgoing: broadcast::Sender<PbftMessage>,
    incoming: broadcast::Sender<PbftMessage>,
}

impl Default for PbftSignals {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNAL_CAPACITY)
    }
}

impl PbftSignals {
    /// Create signals with the given per-channel capacity
    pub fn new(capacity: usize) -> Self {
        let (outgoing, _) = broadcast::channel(capacity);
        let (incoming, _) = broadcast::channel(capacity);
        Self { outgoing, incoming }
    }

    /// Subscribe to messages this node sends
    pub fn subscribe_outgoing(&self) -> broadcast::Receiver<PbftMessage> {
        self.outgoing.subscribe()
    }

    /// Subscribe to messages this node receives
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<PbftMessage> {
        self.incoming.subscribe()
    }

    /// Publish an outgoing message
    pub fn emit_outgoing(&self, msg: PbftMessage) {
        trace!(target: "quorum::pbft", kind = msg.kind(), "outgoing");
        // no subscribers is fine
        let _ = self.outgoing.send(msg);
    }

    /// Publish an incoming message
    pub fn emit_incoming(&self, msg: PbftMessage) {
        let _ = self.incoming.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PbftCheckpoint;
    use alloy_primitives::B256;
    use quorum_primitives::PrivateKey;

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let signals = PbftSignals::default();
        let key = PrivateKey::from_seed(b"bp").public_key();
        let checkpoint = PbftCheckpoint::new(1, B256::ZERO, key, B256::ZERO);
        signals.emit_outgoing(PbftMessage::Checkpoint(checkpoint));
    }

    #[test]
    fn test_subscriber_receives_outgoing() {
        let signals = PbftSignals::new(4);
        let mut rx = signals.subscribe_outgoing();
        let key = PrivateKey::from_seed(b"bp").public_key();
        let msg = PbftMessage::Checkpoint(PbftCheckpoint::new(1, B256::ZERO, key, B256::ZERO));
        signals.emit_outgoing(msg.clone());
        assert_eq!(rx.try_recv().unwrap(), msg);
        assert!(signals.subscribe_incoming().try_recv().is_err());
    }
}
