//! Peer pool indices and candidate selection
//!
//! [`PeerPool`] is the synchronous core of the pool: the address index, the
//! active/outgoing/verified sets, per-address back-off and DNS bookkeeping.
//! It never performs I/O; the [`PoolManager`](crate::network::manager::PoolManager)
//! actor owns it and acts on its decisions.

use crate::config::{Chain, NodeConfig};
use crate::network::address::{Address, AddressError, AddressId, NetworkKind, Protocol, ServiceFlags};
use crate::network::addrman::{AddressQuery, AddressSource};
use crate::network::dns::DnsOutcome;
use crate::network::peer::{PeerHandle, PeerId, PeerInfo, RemoteInfo, SessionCommand};
use crate::network::session::SessionState;
use crate::network::transport::TransportError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Already connected to {0}")]
    Duplicate(Address),
    #[error("Inbound connection limit reached")]
    InboundLimit,
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("Pool stopped")]
    Stopped,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
}

/// Outcome of one target-maintenance step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// Open an outgoing connection to this address
    Connect(Address),
    /// Nothing usable; start a DNS seed query
    ResolveDns,
    /// Nothing usable and a DNS query is pending or rate-limited
    Idle,
    /// The outgoing target is met
    Satisfied,
}

/// A peer removed from the pool
#[derive(Debug, Clone)]
pub struct Removed {
    pub info: PeerInfo,
    pub was_verified: bool,
}

struct Entry {
    handle: PeerHandle,
    info: PeerInfo,
}

/// Pool state shared by nothing: owned by the manager task
pub struct PeerPool {
    chain: Chain,
    target: usize,
    max_inbound: usize,
    kinds: Vec<NetworkKind>,
    preferred: ServiceFlags,
    retry_backoff: Duration,
    dns_interval: Duration,
    configured: Vec<Address>,
    seeds: Vec<String>,

    next_id: PeerId,
    index: HashMap<AddressId, PeerId>,
    peers: HashMap<PeerId, Entry>,
    outgoing: HashSet<PeerId>,
    verified: HashSet<PeerId>,
    attempts: HashMap<AddressId, Instant>,

    dns_results: VecDeque<Address>,
    dns_in_flight: bool,
    dns_not_before: Option<Instant>,
}

impl PeerPool {
    pub fn new(config: &NodeConfig) -> Result<Self, PoolError> {
        Ok(Self {
            chain: config.chain,
            target: config.target_outgoing,
            max_inbound: config.max_inbound,
            kinds: config.network_kinds.clone(),
            preferred: config.preferred_services,
            retry_backoff: config.timeouts.retry_backoff,
            dns_interval: config.timeouts.dns,
            configured: config.configured_peers()?,
            seeds: config.seeds(),
            next_id: 1,
            index: HashMap::new(),
            peers: HashMap::new(),
            outgoing: HashSet::new(),
            verified: HashSet::new(),
            attempts: HashMap::new(),
            dns_results: VecDeque::new(),
            dns_in_flight: false,
            dns_not_before: None,
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Index a new peer and allocate its id. The returned receiver feeds the
    /// session's command queue.
    pub fn register(
        &mut self,
        address: Address,
        incoming: bool,
    ) -> Result<(PeerId, mpsc::UnboundedReceiver<SessionCommand>), PoolError> {
        let key = address.id();
        if self.index.contains_key(&key) {
            return Err(PoolError::Duplicate(address));
        }
        if incoming && self.inbound_count() >= self.max_inbound {
            return Err(PoolError::InboundLimit);
        }

        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        self.index.insert(key, id);
        self.peers.insert(
            id,
            Entry {
                handle: PeerHandle::new(id, tx),
                info: PeerInfo::new(id, address, incoming),
            },
        );
        if !incoming {
            self.outgoing.insert(id);
        }
        Ok((id, rx))
    }

    /// Stop a peer and drop it from every index. Unknown ids are a no-op.
    pub fn disconnect(&mut self, id: PeerId, reason: &str) -> Option<Removed> {
        let entry = self.peers.remove(&id)?;
        entry.handle.disconnect(reason);

        let key = entry.info.address.id();
        if self.index.get(&key) == Some(&id) {
            self.index.remove(&key);
        } else {
            log::error!("Peer {} missing from the address index", id);
            debug_assert!(false, "address index out of sync for peer {}", id);
        }
        self.outgoing.remove(&id);
        let was_verified = self.verified.remove(&id);

        Some(Removed {
            info: entry.info,
            was_verified,
        })
    }

    /// Returns true when the peer was not verified before
    pub fn mark_verified(&mut self, id: PeerId) -> bool {
        match self.peers.get_mut(&id) {
            Some(entry) => {
                entry.info.verified = true;
                self.verified.insert(id)
            }
            None => false,
        }
    }

    pub fn set_state(&mut self, id: PeerId, state: SessionState) {
        if let Some(entry) = self.peers.get_mut(&id) {
            entry.info.state = state;
        }
    }

    /// Record what the handshake revealed
    pub fn handshake_complete(&mut self, id: PeerId, address: Address, remote: RemoteInfo) {
        if let Some(entry) = self.peers.get_mut(&id) {
            entry.info.address.merge(&address);
            entry.info.remote = Some(remote);
        }
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn is_connected(&self, address: &AddressId) -> bool {
        self.index.contains_key(address)
    }

    pub fn peer(&self, id: PeerId) -> Option<&PeerInfo> {
        self.peers.get(&id).map(|entry| &entry.info)
    }

    pub fn is_outgoing(&self, id: PeerId) -> bool {
        self.outgoing.contains(&id)
    }

    pub fn active_count(&self) -> usize {
        self.peers.len()
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn inbound_count(&self) -> usize {
        self.peers.len() - self.outgoing.len()
    }

    pub fn verified_count(&self) -> usize {
        self.verified.len()
    }

    pub fn handles(&self) -> impl Iterator<Item = &PeerHandle> {
        self.peers.values().map(|entry| &entry.handle)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Every peer, ordered by id
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().map(|e| e.info.clone()).collect();
        peers.sort_by_key(|info| info.id);
        peers
    }

    // =========================================================================
    // Candidate selection
    // =========================================================================

    /// One step towards the outgoing target.
    ///
    /// Precedence: configured peers, the best address advertising the
    /// preferred services, fresh DNS results, then any usable address.
    /// Connected addresses and addresses still in back-off are skipped. The
    /// attempt time of the returned address is recorded.
    pub fn select_candidate(&mut self, source: &dyn AddressSource, now: Instant) -> Candidate {
        if self.outgoing.len() >= self.target {
            return Candidate::Satisfied;
        }

        let backoff = self.retry_backoff;
        self.attempts
            .retain(|_, attempted| now.saturating_duration_since(*attempted) < backoff);

        let exclude: HashSet<AddressId> = self
            .index
            .keys()
            .chain(self.attempts.keys())
            .copied()
            .collect();

        let configured = self
            .configured
            .iter()
            .find(|address| !exclude.contains(&address.id()))
            .cloned();
        if let Some(address) = configured {
            return self.attempt(address, now);
        }

        if !self.preferred.is_empty() {
            let query = AddressQuery {
                protocol: Protocol::Native,
                kinds: &self.kinds,
                services: self.preferred,
                exclude: &exclude,
            };
            if let Some(address) = source.get(&query) {
                return self.attempt(address, now);
            }
        }

        while let Some(address) = self.dns_results.pop_front() {
            if !exclude.contains(&address.id()) && self.kinds.contains(&address.kind) {
                return self.attempt(address, now);
            }
        }

        let query = AddressQuery {
            protocol: Protocol::Native,
            kinds: &self.kinds,
            services: ServiceFlags::empty(),
            exclude: &exclude,
        };
        if let Some(address) = source.get(&query) {
            return self.attempt(address, now);
        }

        let rate_limited = self.dns_not_before.map_or(false, |t| now < t);
        if self.seeds.is_empty() || self.dns_in_flight || rate_limited {
            return Candidate::Idle;
        }
        self.dns_in_flight = true;
        self.dns_not_before = Some(now + self.dns_interval);
        Candidate::ResolveDns
    }

    fn attempt(&mut self, address: Address, now: Instant) -> Candidate {
        self.attempts.insert(address.id(), now);
        Candidate::Connect(address)
    }

    /// Whether `address` was attempted recently enough to be skipped
    pub fn in_backoff(&self, address: &AddressId, now: Instant) -> bool {
        self.attempts
            .get(address)
            .map_or(false, |t| now.saturating_duration_since(*t) < self.retry_backoff)
    }

    /// Take in a finished DNS query. Returns the number of new candidates.
    pub fn dns_resolved(&mut self, outcome: &DnsOutcome) -> usize {
        self.dns_in_flight = false;
        if !outcome.success {
            return 0;
        }

        let before = self.dns_results.len();
        for address in &outcome.addresses {
            if address.chain == self.chain
                && !self.dns_results.iter().any(|known| known == address)
            {
                self.dns_results.push_back(address.clone());
            }
        }
        self.dns_results.len() - before
    }

    pub fn dns_in_flight(&self) -> bool {
        self.dns_in_flight
    }
}
