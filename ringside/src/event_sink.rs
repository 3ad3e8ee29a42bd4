use std::fmt;

use tokio::sync::mpsc::UnboundedSender;

use crate::Event;

/// Producer-side handle for appending events to an
/// [`EventQueue`](crate::EventQueue).
///
/// Obtain one with [`EventQueue::sink`](crate::EventQueue::sink) and clone it
/// freely: the signal bridge, simulator connect loop and asynchronous calls
/// each hold their own. Appending is O(1) and never blocks, so it is safe
/// from any task or callback.
#[derive(Clone)]
pub struct EventSink {
    sender: UnboundedSender<Event>,
}

impl EventSink {
    pub(crate) fn new(sender: UnboundedSender<Event>) -> Self {
        Self { sender }
    }

    /// Add `event` to the tail of the queue.
    ///
    /// Events appended after the queue has been dropped are discarded.
    pub fn append(&self, event: Event) {
        if let Err(e) = self.sender.send(event) {
            tracing::trace!(kind = %e.0.kind(), "queue dropped, discarding event");
        }
    }

    /// Whether the owning queue has been dropped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("is_closed", &self.is_closed())
            .finish()
    }
}
