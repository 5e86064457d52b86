//! Broadcast event bus for controller lifecycle events.

use duet_rs_protocol::{EventMsg, EventSink};
use log::debug;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default channel buffer for `EventBus::default`.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Broadcast-backed `EventSink`. Slow subscribers lag and skip events.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EventMsg>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        debug!("event bus initialized (buffer={})", buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventMsg> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream; lagged receivers yield an error item.
    pub fn stream(&self) -> BroadcastStream<EventMsg> {
        BroadcastStream::new(self.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: EventMsg) {
        let _ = self.sender.send(event);
    }
}
