use tokio::sync::broadcast;

/// Notification emitted by a single core.
///
/// Subscriptions are scoped to one core instance; there is no global bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreEvent {
    /// New blocks were committed.
    Append { length: u64, byte_length: u64 },
    /// A block was served to a peer.
    Upload { index: u64, bytes: u64 },
    /// A block was fetched from a peer and verified.
    Download { index: u64, bytes: u64 },
    /// A newer signed head was accepted from a peer.
    Head { length: u64 },
    /// The core was closed.
    Closed,
}

/// Receiver side of a core's event channel.
pub type EventStream = broadcast::Receiver<CoreEvent>;

/// Capacity of each core's broadcast channel. Slow subscribers lag rather
/// than block appends.
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// Per-core event fan-out.
#[derive(Debug)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        self.sender.subscribe()
    }

    /// Deliver to current subscribers. Having none is not an error.
    pub(crate) fn emit(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(CoreEvent::Append {
            length: 1,
            byte_length: 3,
        });
        bus.emit(CoreEvent::Upload { index: 0, bytes: 3 });
        assert_eq!(
            rx.try_recv().unwrap(),
            CoreEvent::Append {
                length: 1,
                byte_length: 3
            }
        );
        assert_eq!(rx.try_recv().unwrap(), CoreEvent::Upload { index: 0, bytes: 3 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        EventBus::new().emit(CoreEvent::Closed);
    }
}
