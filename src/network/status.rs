//! Status bus
//!
//! Fire-and-forget broadcast of pool and session activity for the rest of
//! the node and for operational tooling. Publishing never waits for or
//! requires a subscriber; slow subscribers lose the oldest events.

use crate::network::address::Address;
use crate::network::peer::PeerId;
use crate::network::session::SessionState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events kept per subscriber before the oldest are dropped
pub const DEFAULT_STATUS_CAPACITY: usize = 1024;

/// Observable pool and session activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Aggregate connection counts changed
    PeerCount { active: usize, outgoing: usize },
    /// Number of peers that passed the checkpoint challenge changed
    VerifiedCount(usize),
    /// A session was created for `address`
    Connected {
        id: PeerId,
        address: Address,
        incoming: bool,
    },
    StateChanged { id: PeerId, state: SessionState },
    Verified { id: PeerId },
    Disconnected {
        id: PeerId,
        address: Address,
        reason: Option<String>,
    },
}

/// Multi-producer broadcast of [`StatusEvent`]s
#[derive(Clone)]
pub struct StatusBus {
    sender: broadcast::Sender<StatusEvent>,
    published: Arc<AtomicU64>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STATUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event; returns the number of subscribers reached
    pub fn publish(&self, event: StatusEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total events published, including those nobody received
    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}
