//! Peer identities and the messages exchanged between sessions and the pool
//!
//! A session never calls into the pool directly: it reports through
//! [`PoolEvent`]s and receives [`SessionCommand`]s through its
//! [`PeerHandle`].

use crate::crypto::Hash256;
use crate::network::address::{Address, ServiceFlags};
use crate::network::dns::DnsOutcome;
use crate::network::session::SessionState;
use crate::network::transport::TransportError;
use crate::network::wire::WireError;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Process-local peer identifier, never reused while the process runs
pub type PeerId = u64;

/// Why a session ended. The `Display` text is the disconnect reason.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Checkpoint mismatch: {0}")]
    Checkpoint(String),
    #[error("Timed out in {0}")]
    Timeout(&'static str),
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("Disconnected: {0}")]
    Stopped(String),
}

// =============================================================================
// Pool -> session
// =============================================================================

/// Requests the pool sends to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Stop the session
    Disconnect(String),
    /// New work may be available from the job sources
    JobsAvailable,
}

/// Node-wide notifications fanned out to running sessions
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Our best chain moved to a new tip
    Tip { height: u64, hash: Hash256 },
    /// A local transaction to announce
    Transaction(Bytes),
}

/// The pool's handle on one session
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl PeerHandle {
    pub fn new(id: PeerId, tx: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { id, tx }
    }

    /// Ask the session to stop. Returns false when it already ended.
    pub fn disconnect(&self, reason: &str) -> bool {
        self.tx
            .send(SessionCommand::Disconnect(reason.to_string()))
            .is_ok()
    }

    pub fn jobs_available(&self) -> bool {
        self.tx.send(SessionCommand::JobsAvailable).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Session -> pool
// =============================================================================

/// What a session learned from the remote version message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteInfo {
    pub version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub start_height: u64,
    pub relay: bool,
}

/// Events delivered to the pool
#[derive(Debug)]
pub enum PoolEvent {
    /// A session moved to a new state
    StateChanged { id: PeerId, state: SessionState },
    /// Both directions of the handshake completed. `address` carries the
    /// refreshed services and last-connected time.
    HandshakeComplete {
        id: PeerId,
        address: Address,
        remote: RemoteInfo,
    },
    /// The peer answered the checkpoint challenge correctly
    Verified { id: PeerId },
    /// The peer gossiped addresses
    AddressesLearned { id: PeerId, addresses: Vec<Address> },
    /// The session finished teardown
    Closed {
        id: PeerId,
        address: Address,
        reason: Option<String>,
    },
    /// A DNS seed query finished
    DnsResolved(DnsOutcome),
}

/// Snapshot of one connected peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: Address,
    pub incoming: bool,
    pub state: SessionState,
    pub verified: bool,
    pub remote: Option<RemoteInfo>,
    /// Unix time the session was created
    pub since: i64,
}

impl PeerInfo {
    pub fn new(id: PeerId, address: Address, incoming: bool) -> Self {
        Self {
            id,
            address,
            incoming,
            state: SessionState::PreInit,
            verified: false,
            remote: None,
            since: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_reports_closed_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(1, tx);

        assert!(handle.jobs_available());
        assert_eq!(rx.try_recv().unwrap(), SessionCommand::JobsAvailable);

        drop(rx);
        assert!(!handle.disconnect("bye"));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_error_text_is_reason() {
        let err = PeerError::Checkpoint("header hash differs".to_string());
        assert_eq!(err.to_string(), "Checkpoint mismatch: header hash differs");
        assert_eq!(PeerError::Timeout("verify").to_string(), "Timed out in verify");
    }
}
