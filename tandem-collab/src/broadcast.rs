//! Fan-out of committed operations and presence changes to subscribers.
//!
//! Every document session owns one broadcast group. Events are wrapped in an
//! `Arc` once and shared by all receivers; each receiver buffers up to
//! `capacity` events before it starts lagging.
//!
//! Performance target: 1,000 events to 100 subscribers < 10ms
//! Reference: Patterson & Hennessy, Section 6.4 (Interconnection Networks)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tandem_core::{CommittedOperation, UserId};
use tokio::sync::broadcast;

use crate::presence::PresenceDelta;

/// Something subscribers of a document need to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    Committed(CommittedOperation),
    Presence(PresenceDelta),
}

impl DocumentEvent {
    /// Events are not echoed to the user who caused them.
    pub fn is_visible_to(&self, user: &UserId) -> bool {
        match self {
            DocumentEvent::Committed(op) => op.author() != user,
            DocumentEvent::Presence(delta) => &delta.user.user != user,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    /// Events sent while nobody was subscribed.
    pub events_unheard: u64,
    pub subscribers: usize,
}

/// Broadcast channel for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<DocumentEvent>>,
    capacity: usize,
    events_sent: AtomicU64,
    events_unheard: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many events a slow subscriber may fall behind
    /// before it observes `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            events_sent: AtomicU64::new(0),
            events_unheard: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DocumentEvent>> {
        self.sender.subscribe()
    }

    /// Lock-free send. Returns the number of subscribers reached.
    pub fn send(&self, event: DocumentEvent) -> usize {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(event)) {
            Ok(count) => count,
            Err(_) => {
                self.events_unheard.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn send_committed(&self, operation: CommittedOperation) -> usize {
        self.send(DocumentEvent::Committed(operation))
    }

    pub fn send_presence(&self, delta: PresenceDelta) -> usize {
        self.send(DocumentEvent::Presence(delta))
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_unheard: self.events_unheard.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
