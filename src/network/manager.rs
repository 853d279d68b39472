//! Peer pool manager
//!
//! [`PoolManager`] is the pool's actor. It owns the [`PeerPool`] indices and
//! is the only task that touches them: commands arrive from [`PoolHandle`]s,
//! session reports arrive as [`PoolEvent`]s, accepted connections arrive
//! from listener tasks, and two tickers drive target maintenance and
//! address-book dumps.

use crate::config::{Chain, NodeConfig, Timeouts};
use crate::crypto::Hash256;
use crate::network::address::{Address, NetworkKind};
use crate::network::addrman::AddressSource;
use crate::network::dns;
use crate::network::job::JobSources;
use crate::network::peer::{NodeEvent, PeerId, PeerInfo, PoolEvent};
use crate::network::pool::{Candidate, PeerPool, PoolError, Removed};
use crate::network::session::{Session, SessionContext};
use crate::network::status::{StatusBus, StatusEvent};
use crate::network::transport::{
    Connector, InboundConnection, TcpAcceptor, Transport, TransportError,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Node events buffered per session before the slowest lag
const NODE_EVENT_CAPACITY: usize = 256;

/// How long shutdown waits for sessions to finish teardown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const SHUTDOWN_REASON: &str = "node shutting down";

/// Requests accepted by the manager
#[derive(Debug)]
pub enum PoolCommand {
    AddPeer {
        address: Address,
        reply: oneshot::Sender<Result<PeerId, PoolError>>,
    },
    AddListener {
        address: Address,
        reply: oneshot::Sender<Result<Address, PoolError>>,
    },
    Disconnect {
        id: PeerId,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    BroadcastTransaction(Bytes),
    NotifyTip { height: u64, hash: Hash256 },
    JobsAvailable,
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    Shutdown(oneshot::Sender<()>),
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable front door to a running pool
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::UnboundedSender<PoolCommand>,
    status: StatusBus,
}

impl PoolHandle {
    fn send(&self, command: PoolCommand) -> Result<(), PoolError> {
        self.commands.send(command).map_err(|_| PoolError::Stopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> Result<T, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| PoolError::Stopped)
    }

    /// Open an outgoing connection to `address`
    pub async fn add_peer(&self, mut address: Address) -> Result<PeerId, PoolError> {
        address.incoming = false;
        self.request(|reply| PoolCommand::AddPeer { address, reply })
            .await?
    }

    /// Accept connections on `address`; returns the address actually bound
    pub async fn add_listener(&self, address: Address) -> Result<Address, PoolError> {
        self.request(|reply| PoolCommand::AddListener { address, reply })
            .await?
    }

    /// Returns false when the peer was already gone
    pub async fn disconnect(&self, id: PeerId, reason: &str) -> Result<bool, PoolError> {
        let reason = reason.to_string();
        self.request(|reply| PoolCommand::Disconnect { id, reason, reply })
            .await
    }

    pub fn broadcast_transaction(&self, tx: Bytes) -> Result<(), PoolError> {
        self.send(PoolCommand::BroadcastTransaction(tx))
    }

    pub fn notify_tip(&self, height: u64, hash: Hash256) -> Result<(), PoolError> {
        self.send(PoolCommand::NotifyTip { height, hash })
    }

    /// Wake idle sessions after new work was queued
    pub fn jobs_available(&self) -> Result<(), PoolError> {
        self.send(PoolCommand::JobsAvailable)
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, PoolError> {
        self.request(PoolCommand::Peers).await
    }

    /// Disconnect everything, wait for teardown and flush the address book
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        self.request(PoolCommand::Shutdown).await
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn status(&self) -> &StatusBus {
        &self.status
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct PoolManager {
    chain: Chain,
    timeouts: Timeouts,
    pool: PeerPool,
    ctx: SessionContext,
    connector: Connector,
    addresses: Arc<dyn AddressSource>,
    status: StatusBus,

    commands: mpsc::UnboundedReceiver<PoolCommand>,
    events: mpsc::UnboundedReceiver<PoolEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundConnection>,
    inbound: mpsc::UnboundedReceiver<InboundConnection>,

    listeners: Vec<JoinHandle<()>>,
    sessions: HashMap<PeerId, JoinHandle<()>>,
}

impl PoolManager {
    pub fn new(
        config: &NodeConfig,
        addresses: Arc<dyn AddressSource>,
        jobs: JobSources,
        connector: Connector,
    ) -> Result<(Self, PoolHandle), PoolError> {
        let pool = PeerPool::new(config)?;
        let status = StatusBus::new();

        let (events_tx, events) = mpsc::unbounded_channel();
        let (node_events, _) = broadcast::channel(NODE_EVENT_CAPACITY);
        let ctx = SessionContext::new(
            config,
            jobs,
            addresses.clone(),
            events_tx,
            node_events,
            status.clone(),
        );

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let manager = Self {
            chain: config.chain,
            timeouts: config.timeouts.clone(),
            pool,
            ctx,
            connector,
            addresses,
            status: status.clone(),
            commands,
            events,
            inbound_tx,
            inbound,
            listeners: Vec::new(),
            sessions: HashMap::new(),
        };
        let handle = PoolHandle {
            commands: commands_tx,
            status,
        };
        Ok((manager, handle))
    }

    /// Build and start a pool in one step
    pub fn start(
        config: &NodeConfig,
        addresses: Arc<dyn AddressSource>,
        jobs: JobSources,
        connector: Connector,
    ) -> Result<(PoolHandle, JoinHandle<()>), PoolError> {
        let (manager, handle) = Self::new(config, addresses, jobs, connector)?;
        Ok((handle, manager.spawn()))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        log::info!(
            "Peer pool started on {} ({} known addresses)",
            self.chain.name(),
            self.addresses.len()
        );

        let mut connect_tick = interval(self.timeouts.connect_interval);
        connect_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dump_tick = interval(self.timeouts.dump);
        dump_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PoolCommand::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.events.recv() => self.on_event(event),
                Some(connection) = self.inbound.recv() => self.accept_inbound(connection),
                _ = connect_tick.tick() => self.ensure_target(),
                _ = dump_tick.tick() => self.flush(),
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn on_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::AddPeer { address, reply } => {
                let result = self.add_peer(address, None);
                let _ = reply.send(result);
            }
            PoolCommand::AddListener { address, reply } => {
                let result = self.add_listener(&address).await;
                match &result {
                    Ok(bound) => log::info!("Listening on {}", bound),
                    Err(e) => log::warn!("Cannot listen on {}: {}", address, e),
                }
                let _ = reply.send(result);
            }
            PoolCommand::Disconnect { id, reason, reply } => {
                let found = self.disconnect(id, &reason);
                let _ = reply.send(found);
            }
            PoolCommand::BroadcastTransaction(tx) => {
                let reached = self.ctx.node_events.send(NodeEvent::Transaction(tx)).unwrap_or(0);
                log::debug!("Transaction offered to {} sessions", reached);
            }
            PoolCommand::NotifyTip { height, hash } => {
                let _ = self.ctx.node_events.send(NodeEvent::Tip { height, hash });
            }
            PoolCommand::JobsAvailable => {
                for handle in self.pool.handles() {
                    handle.jobs_available();
                }
            }
            PoolCommand::Peers(reply) => {
                let _ = reply.send(self.pool.snapshot());
            }
            PoolCommand::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    /// Create a session for `address`. Inbound connections bring their own
    /// transport; outbound ones get one from the connector.
    fn add_peer(
        &mut self,
        address: Address,
        inbound: Option<Box<dyn Transport>>,
    ) -> Result<PeerId, PoolError> {
        let incoming = inbound.is_some();
        let transport = match inbound {
            Some(transport) => transport,
            None => self.connector.outbound(&address)?,
        };

        let (id, commands) = self.pool.register(address.clone(), incoming)?;
        let session = Session::new(id, address.clone(), transport, self.ctx.clone(), commands);
        self.sessions.insert(id, session.spawn());

        log::debug!(
            "Peer {} created for {} ({})",
            id,
            address,
            if incoming { "inbound" } else { "outbound" }
        );
        self.status.publish(StatusEvent::Connected {
            id,
            address,
            incoming,
        });
        self.publish_counts();
        Ok(id)
    }

    async fn add_listener(&mut self, address: &Address) -> Result<Address, PoolError> {
        match address.kind {
            NetworkKind::Ipv4 | NetworkKind::Ipv6 => {
                let socket = address
                    .socket_addr()
                    .ok_or(TransportError::Unsupported(address.kind))?;
                let acceptor = TcpAcceptor::bind(socket).await?;
                let bound = Address::from_socket_addr(acceptor.local_addr(), self.chain, false);
                self.listeners.push(acceptor.spawn(self.inbound_tx.clone()));
                Ok(bound)
            }
            NetworkKind::Bus => {
                let bus = self
                    .connector
                    .bus()
                    .ok_or_else(|| TransportError::Bus("no message bus attached".to_string()))?;
                let name = address
                    .endpoint_name()
                    .ok_or(TransportError::Unsupported(NetworkKind::Bus))?;
                let listener = bus.bind(name)?;
                let bound = Address::bus(listener.endpoint(), self.chain, false);
                self.listeners.push(listener.spawn(self.inbound_tx.clone()));
                Ok(bound)
            }
            NetworkKind::Onion => Err(TransportError::Unsupported(NetworkKind::Onion).into()),
        }
    }

    fn accept_inbound(&mut self, connection: InboundConnection) {
        let address = connection.remote_address(self.chain);
        match self.add_peer(address.clone(), Some(connection.into_transport())) {
            Ok(id) => log::debug!("Accepted {} as peer {}", address, id),
            Err(e) => log::info!("Refused inbound connection from {}: {}", address, e),
        }
    }

    fn disconnect(&mut self, id: PeerId, reason: &str) -> bool {
        match self.pool.disconnect(id, reason) {
            Some(removed) => {
                self.on_removed(removed, Some(reason.to_string()));
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Target maintenance
    // =========================================================================

    fn ensure_target(&mut self) {
        match self
            .pool
            .select_candidate(self.addresses.as_ref(), Instant::now())
        {
            Candidate::Connect(address) => {
                log::debug!("Connecting to candidate {}", address);
                if let Err(e) = self.add_peer(address.clone(), None) {
                    log::warn!("Cannot connect to {}: {}", address, e);
                }
            }
            Candidate::ResolveDns => {
                dns::spawn_resolve(
                    self.pool.seeds().to_vec(),
                    self.chain,
                    self.timeouts.dns,
                    self.ctx.events.clone(),
                );
            }
            Candidate::Idle | Candidate::Satisfied => {}
        }
    }

    // =========================================================================
    // Session events
    // =========================================================================

    fn on_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::StateChanged { id, state } => self.pool.set_state(id, state),
            PoolEvent::HandshakeComplete {
                id,
                address,
                remote,
            } => {
                if self.pool.is_outgoing(id) {
                    self.addresses.add_or_update(&address);
                }
                self.pool.handshake_complete(id, address, remote);
            }
            PoolEvent::Verified { id } => {
                if self.pool.mark_verified(id) {
                    self.status
                        .publish(StatusEvent::VerifiedCount(self.pool.verified_count()));
                }
            }
            PoolEvent::AddressesLearned { id, addresses } => {
                for address in &addresses {
                    self.addresses.add_or_update(address);
                }
                log::debug!(
                    "Peer {} taught us {} addresses ({} known)",
                    id,
                    addresses.len(),
                    self.addresses.len()
                );
            }
            PoolEvent::Closed {
                id,
                address,
                reason,
            } => {
                self.sessions.remove(&id);
                if let Some(removed) = self
                    .pool
                    .disconnect(id, reason.as_deref().unwrap_or("closed"))
                {
                    self.on_removed(removed, reason);
                } else {
                    log::debug!("Peer {} ({}) finished teardown", id, address);
                }
            }
            PoolEvent::DnsResolved(outcome) => {
                for address in &outcome.addresses {
                    self.addresses.add_or_update(address);
                }
                let fresh = self.pool.dns_resolved(&outcome);
                log::debug!("{} new candidates from DNS", fresh);
            }
        }
    }

    fn on_removed(&self, removed: Removed, reason: Option<String>) {
        self.status.publish(StatusEvent::Disconnected {
            id: removed.info.id,
            address: removed.info.address,
            reason,
        });
        self.publish_counts();
        if removed.was_verified {
            self.status
                .publish(StatusEvent::VerifiedCount(self.pool.verified_count()));
        }
    }

    fn publish_counts(&self) {
        self.status.publish(StatusEvent::PeerCount {
            active: self.pool.active_count(),
            outgoing: self.pool.outgoing_count(),
        });
    }

    fn flush(&self) {
        if let Err(e) = self.addresses.flush() {
            log::warn!("Failed to save address book: {}", e);
        }
    }

    async fn shutdown(&mut self) {
        log::info!(
            "Shutting down peer pool ({} peers)",
            self.pool.active_count()
        );

        for listener in &self.listeners {
            listener.abort();
        }
        for listener in self.listeners.drain(..) {
            let _ = listener.await;
        }
        for id in self.pool.ids() {
            self.disconnect(id, SHUTDOWN_REASON);
        }

        let sessions: Vec<JoinHandle<()>> = self.sessions.drain().map(|(_, h)| h).collect();
        let pending = sessions.len();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(sessions))
            .await
            .is_err()
        {
            log::warn!("{} sessions did not stop within {:?}", pending, SHUTDOWN_GRACE);
        }

        self.flush();
    }
}
