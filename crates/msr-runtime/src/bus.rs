use tokio::sync::broadcast;

use msr_core::ports::EngineEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Observer bus for downstream consumers (API, dashboard, execution).
///
/// Backed by a `tokio::sync::broadcast` channel: each subscriber has its
/// own cursor, so a slow or failing observer lags or drops on its own
/// receiver and never affects the engine or its peers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A bus with no subscribers is a no-op.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
