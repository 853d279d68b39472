//! Peer session
//!
//! One [`Session`] runs per connection as its own task. It owns the
//! transport, the state machine, the timers and at most one job, and
//! processes transport frames, pool commands, node notifications and timer
//! expiries one at a time from a single `select!` loop. It talks to the pool
//! only through [`PoolEvent`]s.
//!
//! ```text
//! pre_init -> init -> connect -> handshake -> verify -> run
//!                                    \________________/
//!                                       (inbound)
//! any state -> shutdown
//! ```
//!
//! Every state before `run` has a deadline; expiry disconnects. Retrying is
//! the pool's business.

pub mod state;
pub mod timer;
pub mod verify;

pub use state::{KnownHashes, SessionState};
pub use timer::{Timer, Timers};
pub use verify::Challenge;

use crate::config::{Chain, Checkpoint, NodeConfig, Timeouts};
use crate::crypto::Hash256;
use crate::network::address::{Address, ServiceFlags};
use crate::network::addrman::{AddressFilter, AddressSource};
use crate::network::job::{Job, JobSources};
use crate::network::message::{
    block_hash, txid, BlockHeader, InvItem, InvType, Message, NetAddr, RejectCode, RejectMessage,
    VersionMessage, MAX_ADDR_PER_MESSAGE, MAX_HEADERS_PER_MESSAGE, MAX_INV_PER_MESSAGE,
    MIN_PROTOCOL_VERSION,
};
use crate::network::peer::{
    NodeEvent, PeerError, PeerId, PoolEvent, RemoteInfo, SessionCommand,
};
use crate::network::status::{StatusBus, StatusEvent};
use crate::network::transport::{
    Frame, FrameCodec, TransmitOutcome, Transport, TransportError, TransportEvent,
    SEND_QUEUE_CAPACITY,
};
use crate::network::wire;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// =============================================================================
// Constants
// =============================================================================

/// Transport events buffered before the reader task waits
const EVENT_CAPACITY: usize = 64;

/// Block hashes remembered per peer
const KNOWN_BLOCKS: usize = 1024;

/// Transaction hashes remembered per peer
const KNOWN_TXS: usize = 4096;

/// Announced transactions kept for `getdata`
const RELAY_CACHE: usize = 256;

// =============================================================================
// Context
// =============================================================================

/// What sessions need from the node; shared by every session of a pool
#[derive(Clone)]
pub struct SessionContext {
    pub chain: Chain,
    pub timeouts: Timeouts,
    pub checkpoint: Checkpoint,
    pub local_services: ServiceFlags,
    pub user_agent: String,
    pub relay: bool,
    /// Sent in our version messages to detect connections to ourselves
    pub nonce: u64,
    pub jobs: JobSources,
    pub addresses: Arc<dyn AddressSource>,
    pub events: mpsc::UnboundedSender<PoolEvent>,
    pub node_events: broadcast::Sender<NodeEvent>,
    pub status: StatusBus,
}

impl SessionContext {
    pub fn new(
        config: &NodeConfig,
        jobs: JobSources,
        addresses: Arc<dyn AddressSource>,
        events: mpsc::UnboundedSender<PoolEvent>,
        node_events: broadcast::Sender<NodeEvent>,
        status: StatusBus,
    ) -> Self {
        Self {
            chain: config.chain,
            timeouts: config.timeouts.clone(),
            checkpoint: config.checkpoint(),
            local_services: config.local_services,
            user_agent: config.user_agent.clone(),
            relay: config.relay,
            nonce: rand::random(),
            jobs,
            addresses,
            events,
            node_events,
            status,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// The actor driving one connection
pub struct Session {
    id: PeerId,
    address: Address,
    incoming: bool,
    ctx: SessionContext,
    transport: Box<dyn Transport>,
    state: SessionState,
    timers: Timers,

    commands: mpsc::UnboundedReceiver<SessionCommand>,
    /// Handed to the transport once the stream is up
    sink: Option<mpsc::Sender<TransportEvent>>,
    inbox: mpsc::Receiver<TransportEvent>,
    node_events: Option<broadcast::Receiver<NodeEvent>>,

    remote: Option<RemoteInfo>,
    version_sent: bool,
    verack_received: bool,
    challenge: Option<Challenge>,

    job: Job,
    ping_nonce: Option<u64>,
    local_height: u64,
    remote_height: u64,
    known_blocks: KnownHashes,
    known_txs: KnownHashes,
    relayed: VecDeque<(Hash256, Bytes)>,
}

impl Session {
    pub fn new(
        id: PeerId,
        address: Address,
        transport: Box<dyn Transport>,
        ctx: SessionContext,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let (sink, inbox) = mpsc::channel(EVENT_CAPACITY);
        let local_height = ctx.jobs.headers().height();

        Self {
            id,
            address,
            incoming: transport.kind().is_inbound(),
            ctx,
            transport,
            state: SessionState::PreInit,
            timers: Timers::default(),
            commands,
            sink: Some(sink),
            inbox,
            node_events: None,
            remote: None,
            version_sent: false,
            verack_received: false,
            challenge: None,
            job: Job::None,
            ping_nonce: None,
            local_height,
            remote_height: 0,
            known_blocks: KnownHashes::new(KNOWN_BLOCKS),
            known_txs: KnownHashes::new(KNOWN_TXS),
            relayed: VecDeque::new(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drive the connection until it ends, then tear down
    pub async fn run(mut self) {
        let error = match self.drive().await {
            Ok(()) => None,
            Err(e) => Some(e),
        };

        match &error {
            Some(e @ (PeerError::Protocol(_) | PeerError::Checkpoint(_) | PeerError::Wire(_))) => {
                log::warn!("Peer {} ({}) disconnected: {}", self.id, self.address, e)
            }
            Some(e) => log::info!("Peer {} ({}) disconnected: {}", self.id, self.address, e),
            None => log::info!("Peer {} ({}) disconnected", self.id, self.address),
        }

        self.teardown(error.map(|e| e.to_string())).await;
    }

    async fn drive(&mut self) -> Result<(), PeerError> {
        self.establish().await?;
        self.serve().await
    }

    // -------------------------------------------------------------------------
    // Connection setup
    // -------------------------------------------------------------------------

    async fn establish(&mut self) -> Result<(), PeerError> {
        self.advance(SessionState::Init);
        if let Some(endpoint) = self.transport.init().await? {
            log::debug!("Peer {} registered as {}", self.id, endpoint);
        }

        self.advance(SessionState::Connect);
        self.timers.state.arm(self.ctx.timeouts.connect);

        let outcome = {
            let mut connect = self.transport.connect();
            loop {
                tokio::select! {
                    result = &mut connect => break result?,
                    _ = self.timers.state.expired() => return Err(PeerError::Timeout("connect")),
                    command = self.commands.recv() => check_stop(command)?,
                }
            }
        };

        self.start_transport()?;

        if !outcome.ready {
            log::debug!(
                "Peer {} waiting for rendezvous as {}",
                self.id,
                outcome.dealer_endpoint.as_deref().unwrap_or("?")
            );
            loop {
                tokio::select! {
                    event = self.inbox.recv() => match event {
                        Some(TransportEvent::Ready) => break,
                        Some(TransportEvent::Frame(_)) => {
                            return Err(PeerError::Protocol("data before ready".to_string()))
                        }
                        Some(TransportEvent::Closed(reason)) => return Err(closed(reason)),
                        None => return Err(closed(None)),
                    },
                    _ = self.timers.state.expired() => return Err(PeerError::Timeout("connect")),
                    command = self.commands.recv() => check_stop(command)?,
                }
            }
        }

        log::info!(
            "Connected to peer {} ({}, {})",
            self.id,
            self.address,
            if self.incoming { "inbound" } else { "outbound" }
        );

        self.advance(SessionState::Handshake);
        self.timers.state.arm(self.ctx.timeouts.handshake);
        self.timers.activity.arm(self.ctx.timeouts.activity);
        if !self.incoming {
            self.send_version()?;
        }
        Ok(())
    }

    fn start_transport(&mut self) -> Result<(), PeerError> {
        let sink = self
            .sink
            .take()
            .ok_or_else(|| PeerError::Protocol("transport started twice".to_string()))?;
        let codec = FrameCodec::new(wire::HEADER_SIZE, wire::body_size(self.ctx.chain.magic()));
        self.transport.on_connect(codec, sink)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    async fn serve(&mut self) -> Result<(), PeerError> {
        loop {
            tokio::select! {
                event = self.inbox.recv() => self.on_transport_event(event)?,
                command = self.commands.recv() => match command {
                    Some(SessionCommand::JobsAvailable) => self.dispatch()?,
                    other => check_stop(other)?,
                },
                event = next_node_event(&mut self.node_events) => self.on_node_event(event)?,
                _ = self.timers.state.expired() => {
                    return Err(PeerError::Timeout(self.state.name()))
                }
                _ = self.timers.activity.expired() => return Err(PeerError::Timeout("activity")),
                _ = self.timers.ping.expired() => self.on_ping_timer()?,
                _ = self.timers.job.expired() => self.on_job_timeout(),
                _ = self.timers.peers.expired() => self.on_peers_timer()?,
                _ = self.timers.dispatch.expired() => {
                    self.timers.dispatch.cancel();
                    self.dispatch()?
                }
            }
        }
    }

    fn on_transport_event(&mut self, event: Option<TransportEvent>) -> Result<(), PeerError> {
        match event {
            Some(TransportEvent::Frame(frame)) => self.on_frame(frame),
            Some(TransportEvent::Ready) => Ok(()),
            Some(TransportEvent::Closed(reason)) => Err(closed(reason)),
            None => Err(closed(None)),
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), PeerError> {
        if self.state == SessionState::Shutdown {
            log::error!("Peer {} received a frame after shutdown", self.id);
            debug_assert!(false, "frame handled in shutdown state");
            return Ok(());
        }

        self.timers.activity.arm(self.ctx.timeouts.activity);
        if self.state == SessionState::Run {
            self.timers.ping.arm(self.ctx.timeouts.ping);
        }

        let message = wire::decode(self.ctx.chain.magic(), &frame)?;
        log::trace!("Peer {} sent {}", self.id, message.command());

        match self.state {
            SessionState::Handshake => self.on_handshake_message(message),
            SessionState::Verify => self.on_verify_message(message),
            SessionState::Run => self.on_run_message(message),
            state => Err(PeerError::Protocol(format!(
                "{} received in state {}",
                message.command(),
                state
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    fn on_handshake_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::Version(version) => self.on_version(version),
            Message::VerAck => self.on_verack(),
            Message::Reject(reject) => {
                log::warn!("Peer {} rejected {}: {}", self.id, reject.message, reject.reason);
                Ok(())
            }
            other => Err(PeerError::Protocol(format!(
                "{} before handshake completed",
                other.command()
            ))),
        }
    }

    fn send_version(&mut self) -> Result<(), PeerError> {
        let version = VersionMessage::new(
            self.ctx.local_services,
            self.ctx.nonce,
            self.ctx.user_agent.clone(),
            self.local_height,
            self.ctx.relay,
        );
        self.send(&Message::Version(version))?;
        self.version_sent = true;
        Ok(())
    }

    fn on_version(&mut self, version: VersionMessage) -> Result<(), PeerError> {
        if self.remote.is_some() {
            return Err(PeerError::Protocol("duplicate version".to_string()));
        }
        if version.version < MIN_PROTOCOL_VERSION {
            self.send(&Message::Reject(RejectMessage {
                message: "version".to_string(),
                code: RejectCode::Obsolete,
                reason: format!("protocol version {} or newer required", MIN_PROTOCOL_VERSION),
            }))?;
            return Err(PeerError::Protocol(format!(
                "obsolete protocol version {}",
                version.version
            )));
        }
        if version.nonce == self.ctx.nonce {
            return Err(PeerError::Protocol("connected to self".to_string()));
        }

        self.remote_height = version.start_height;
        self.remote = Some(RemoteInfo {
            version: version.version,
            services: version.services,
            user_agent: version.user_agent,
            start_height: version.start_height,
            relay: version.relay,
        });

        if !self.version_sent {
            self.send_version()?;
        }
        self.send(&Message::VerAck)?;
        self.check_handshake()
    }

    fn on_verack(&mut self) -> Result<(), PeerError> {
        if self.verack_received {
            return Err(PeerError::Protocol("duplicate verack".to_string()));
        }
        if !self.version_sent {
            return Err(PeerError::Protocol("verack before our version".to_string()));
        }
        self.verack_received = true;
        self.check_handshake()
    }

    /// Both directions done: record the peer and move on
    fn check_handshake(&mut self) -> Result<(), PeerError> {
        let remote = match (&self.remote, self.verack_received) {
            (Some(remote), true) => remote.clone(),
            _ => return Ok(()),
        };

        self.address.services = remote.services;
        self.address.last_connected = Some(chrono::Utc::now().timestamp());
        log::info!(
            "Handshake with peer {} complete: {} at height {}",
            self.id,
            remote.user_agent,
            remote.start_height
        );
        self.report(PoolEvent::HandshakeComplete {
            id: self.id,
            address: self.address.clone(),
            remote,
        });

        if self.incoming {
            self.enter_run()
        } else {
            self.enter_verify()
        }
    }

    // -------------------------------------------------------------------------
    // Checkpoint verification
    // -------------------------------------------------------------------------

    fn enter_verify(&mut self) -> Result<(), PeerError> {
        self.advance(SessionState::Verify);
        self.timers.state.arm(self.ctx.timeouts.verify);

        let filters = self
            .remote
            .as_ref()
            .map_or(false, |r| r.services.contains(ServiceFlags::COMPACT_FILTERS));
        let challenge = Challenge::new(self.ctx.checkpoint, filters);
        for request in challenge.requests() {
            self.send(&request)?;
        }
        self.challenge = Some(challenge);
        Ok(())
    }

    fn on_verify_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::Headers(headers) => {
                self.challenge()?.on_headers(&headers)?;
                self.check_verified()
            }
            Message::CFHeaders {
                filter_type,
                stop_hash,
                previous_filter_header,
                filter_hashes,
            } => {
                self.challenge()?.on_cfheaders(
                    filter_type,
                    &stop_hash,
                    &previous_filter_header,
                    &filter_hashes,
                )?;
                self.check_verified()
            }
            other => self.on_common_message(other),
        }
    }

    fn challenge(&mut self) -> Result<&mut Challenge, PeerError> {
        self.challenge
            .as_mut()
            .ok_or_else(|| PeerError::Protocol("no checkpoint challenge pending".to_string()))
    }

    fn check_verified(&mut self) -> Result<(), PeerError> {
        if !self.challenge.as_ref().map_or(false, Challenge::is_satisfied) {
            return Ok(());
        }
        self.challenge = None;
        log::info!(
            "Peer {} passed checkpoint at height {}",
            self.id,
            self.ctx.checkpoint.height
        );
        self.ctx.status.publish(StatusEvent::Verified { id: self.id });
        self.report(PoolEvent::Verified { id: self.id });
        self.enter_run()
    }

    // -------------------------------------------------------------------------
    // Run state
    // -------------------------------------------------------------------------

    fn enter_run(&mut self) -> Result<(), PeerError> {
        self.advance(SessionState::Run);
        self.timers.state.cancel();
        self.timers.ping.arm(self.ctx.timeouts.ping);
        self.node_events = Some(self.ctx.node_events.subscribe());
        self.local_height = self.ctx.jobs.headers().height();

        self.request_addresses()?;
        self.dispatch()
    }

    fn on_run_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::Headers(headers) => self.on_headers(headers),
            Message::Block(block) => self.on_block(block),
            Message::NotFound(items) => self.on_not_found(items),
            other => self.on_common_message(other),
        }
    }

    /// Messages handled the same way in verify and run
    fn on_common_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::Version(_) => Err(PeerError::Protocol("duplicate version".to_string())),
            Message::VerAck => Err(PeerError::Protocol("duplicate verack".to_string())),
            Message::Ping(nonce) => self.send(&Message::Pong(nonce)),
            Message::Pong(nonce) => {
                if self.ping_nonce == Some(nonce) {
                    self.ping_nonce = None;
                } else {
                    log::debug!("Peer {} sent unexpected pong {}", self.id, nonce);
                }
                Ok(())
            }
            Message::GetAddr => self.on_get_addr(),
            Message::Addr(entries) => self.on_addr(entries),
            Message::GetHeaders { locator, stop } => {
                let headers = self.ctx.jobs.headers().headers_after(
                    &locator,
                    &stop,
                    MAX_HEADERS_PER_MESSAGE,
                );
                self.send(&Message::Headers(headers))
            }
            Message::Inv(items) => self.on_inv(items),
            Message::GetData(items) => self.on_get_data(items),
            Message::Tx(tx) => {
                self.known_txs.insert(txid(&tx));
                Ok(())
            }
            Message::Reject(reject) => {
                log::warn!(
                    "Peer {} rejected {} ({:?}): {}",
                    self.id,
                    reject.message,
                    reject.code,
                    reject.reason
                );
                Ok(())
            }
            other => {
                log::debug!("Peer {} sent unexpected {}", self.id, other.command());
                Ok(())
            }
        }
    }

    fn request_addresses(&mut self) -> Result<(), PeerError> {
        self.send(&Message::GetAddr)?;
        self.timers.peers.arm(self.ctx.timeouts.peers);
        Ok(())
    }

    fn on_get_addr(&mut self) -> Result<(), PeerError> {
        let filter = AddressFilter {
            chain: Some(self.ctx.chain),
            exclude: [self.address.id()].into_iter().collect(),
            limit: MAX_ADDR_PER_MESSAGE,
            ..Default::default()
        };
        let entries: Vec<NetAddr> = self
            .ctx
            .addresses
            .find(&filter)
            .iter()
            .map(NetAddr::from_address)
            .collect();
        self.send(&Message::Addr(entries))
    }

    fn on_addr(&mut self, entries: Vec<NetAddr>) -> Result<(), PeerError> {
        if entries.len() > MAX_ADDR_PER_MESSAGE {
            return Err(PeerError::Protocol(format!(
                "addr with {} entries",
                entries.len()
            )));
        }
        let addresses: Vec<Address> = entries
            .iter()
            .map(|entry| entry.to_address(self.ctx.chain))
            .filter(Address::is_valid)
            .collect();
        if !addresses.is_empty() {
            log::debug!("Peer {} gossiped {} addresses", self.id, addresses.len());
            self.report(PoolEvent::AddressesLearned {
                id: self.id,
                addresses,
            });
        }
        Ok(())
    }

    fn on_inv(&mut self, items: Vec<InvItem>) -> Result<(), PeerError> {
        if items.len() > MAX_INV_PER_MESSAGE {
            return Err(PeerError::Protocol(format!("inv with {} entries", items.len())));
        }
        for item in items {
            match item.kind {
                InvType::Block => {
                    if self.known_blocks.insert(item.hash) {
                        self.remote_height = self.remote_height.max(self.local_height + 1);
                    }
                }
                InvType::Tx => {
                    self.known_txs.insert(item.hash);
                }
            }
        }
        Ok(())
    }

    fn on_get_data(&mut self, items: Vec<InvItem>) -> Result<(), PeerError> {
        if items.len() > MAX_INV_PER_MESSAGE {
            return Err(PeerError::Protocol(format!(
                "getdata with {} entries",
                items.len()
            )));
        }

        let mut missing = Vec::new();
        for item in items {
            let relayed = match item.kind {
                InvType::Tx => self
                    .relayed
                    .iter()
                    .find(|(hash, _)| *hash == item.hash)
                    .map(|(_, tx)| tx.clone()),
                InvType::Block => None,
            };
            match relayed {
                Some(tx) => self.send(&Message::Tx(tx.to_vec()))?,
                None => missing.push(item),
            }
        }

        if !missing.is_empty() {
            self.send(&Message::NotFound(missing))?;
        }
        Ok(())
    }

    fn on_node_event(&mut self, event: Result<NodeEvent, RecvError>) -> Result<(), PeerError> {
        match event {
            Ok(NodeEvent::Tip { height, hash }) => {
                self.local_height = height;
                if self.known_blocks.insert(hash) {
                    self.send(&Message::Inv(vec![InvItem::block(hash)]))?;
                }
            }
            Ok(NodeEvent::Transaction(tx)) => {
                if !self.remote.as_ref().map_or(false, |r| r.relay) {
                    return Ok(());
                }
                let hash = txid(&tx);
                if self.known_txs.insert(hash) {
                    self.relayed.push_back((hash, tx));
                    if self.relayed.len() > RELAY_CACHE {
                        self.relayed.pop_front();
                    }
                    self.send(&Message::Inv(vec![InvItem::tx(hash)]))?;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                log::debug!("Peer {} missed {} node events", self.id, skipped);
            }
            Err(RecvError::Closed) => {
                self.node_events = None;
            }
        }
        Ok(())
    }

    fn on_ping_timer(&mut self) -> Result<(), PeerError> {
        let nonce = rand::random();
        self.ping_nonce = Some(nonce);
        self.send(&Message::Ping(nonce))?;
        self.timers.ping.arm(self.ctx.timeouts.ping);
        Ok(())
    }

    fn on_peers_timer(&mut self) -> Result<(), PeerError> {
        self.timers.peers.cancel();
        self.request_addresses()
    }

    // -------------------------------------------------------------------------
    // Jobs
    // -------------------------------------------------------------------------

    /// Try to obtain work when idle; poll again later when there is none
    fn dispatch(&mut self) -> Result<(), PeerError> {
        if self.state != SessionState::Run || !self.job.is_none() {
            return Ok(());
        }
        self.timers.dispatch.cancel();

        let job = self.ctx.jobs.request(self.id);
        let request = match &job {
            Job::None => {
                self.timers.dispatch.arm(self.ctx.timeouts.dispatch);
                return Ok(());
            }
            Job::Headers(job) => Message::GetHeaders {
                locator: job.recent().to_vec(),
                stop: Hash256::ZERO,
            },
            Job::Blocks(batch) => {
                Message::GetData(batch.get().iter().copied().map(InvItem::block).collect())
            }
        };

        log::debug!("Peer {} took {} job", self.id, job.kind());
        self.job = job;
        self.timers.job.arm(self.ctx.timeouts.job);
        self.send(&request)
    }

    fn on_headers(&mut self, headers: Vec<BlockHeader>) -> Result<(), PeerError> {
        if headers.len() > MAX_HEADERS_PER_MESSAGE {
            return Err(PeerError::Protocol(format!(
                "headers with {} entries",
                headers.len()
            )));
        }
        let job = match std::mem::take(&mut self.job) {
            Job::Headers(job) => job,
            other => {
                self.job = other;
                log::debug!("Peer {} sent unsolicited headers", self.id);
                return Ok(());
            }
        };
        self.timers.job.cancel();

        for header in &headers {
            self.known_blocks.insert(header.block_hash());
        }
        let accepted = self.ctx.jobs.headers().complete(job, &headers);
        self.local_height = self.ctx.jobs.headers().height();

        if accepted {
            self.remote_height = self.remote_height.max(self.local_height);
            self.dispatch()
        } else {
            log::warn!(
                "Peer {} sent {} headers that do not extend our chain",
                self.id,
                headers.len()
            );
            self.timers.dispatch.arm(self.ctx.timeouts.dispatch);
            Ok(())
        }
    }

    fn on_block(&mut self, block: Vec<u8>) -> Result<(), PeerError> {
        if let Some(hash) = block_hash(&block) {
            self.known_blocks.insert(hash);
        }

        let batch = match &self.job {
            Job::Blocks(batch) => batch,
            _ => {
                log::debug!("Peer {} sent unsolicited block", self.id);
                return Ok(());
            }
        };
        let submission = self.ctx.jobs.blocks().submit(batch, &block);
        if !submission.accepted {
            log::debug!("Peer {} sent a block outside its batch", self.id);
            return Ok(());
        }

        if submission.complete {
            self.timers.job.cancel();
            if let Job::Blocks(batch) = std::mem::take(&mut self.job) {
                log::debug!("Peer {} finished {}", self.id, batch.id);
                self.ctx.jobs.blocks().complete(batch);
            }
            self.dispatch()
        } else {
            self.timers.job.arm(self.ctx.timeouts.job);
            Ok(())
        }
    }

    fn on_not_found(&mut self, items: Vec<InvItem>) -> Result<(), PeerError> {
        let stalled = match &self.job {
            Job::Blocks(batch) => items
                .iter()
                .any(|item| item.kind == InvType::Block && batch.contains(&item.hash)),
            _ => false,
        };
        if stalled {
            log::info!("Peer {} cannot serve its block batch, returning it", self.id);
            self.abandon_job();
            self.timers.dispatch.arm(self.ctx.timeouts.dispatch);
        }
        Ok(())
    }

    fn on_job_timeout(&mut self) {
        log::info!(
            "Peer {} made no progress on its {} job, abandoning it",
            self.id,
            self.job.kind()
        );
        self.abandon_job();
        self.timers.dispatch.arm(self.ctx.timeouts.dispatch);
    }

    fn abandon_job(&mut self) {
        self.timers.job.cancel();
        let job = std::mem::take(&mut self.job);
        self.ctx.jobs.release(job);
    }

    // -------------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------------

    fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        let (header, body) = wire::encode(self.ctx.chain.magic(), message)?;
        match self.transport.transmit(header, body) {
            TransmitOutcome::Queued => Ok(()),
            TransmitOutcome::Full => Err(PeerError::Transport(TransportError::SendQueueFull(
                SEND_QUEUE_CAPACITY,
            ))),
            TransmitOutcome::Closed => Err(closed(Some(format!(
                "cannot send {}",
                message.command()
            )))),
        }
    }

    fn advance(&mut self, next: SessionState) {
        if !self.state.can_advance_to(next, self.incoming) {
            log::error!(
                "Peer {}: illegal transition {} -> {}",
                self.id,
                self.state,
                next
            );
            debug_assert!(false, "illegal session transition {} -> {}", self.state, next);
            return;
        }

        log::debug!("Peer {} {} -> {}", self.id, self.state, next);
        self.state = next;
        if !next.tracks_activity() {
            self.timers.activity.cancel();
        }
        self.ctx.status.publish(StatusEvent::StateChanged {
            id: self.id,
            state: next,
        });
        self.report(PoolEvent::StateChanged {
            id: self.id,
            state: next,
        });
    }

    fn report(&self, event: PoolEvent) {
        if self.ctx.events.send(event).is_err() {
            log::debug!("Peer {}: pool no longer listening", self.id);
        }
    }

    /// Release timers, job and transport, then tell the pool
    async fn teardown(&mut self, reason: Option<String>) {
        self.advance(SessionState::Shutdown);
        self.timers.cancel_all();
        self.node_events = None;

        let job = std::mem::take(&mut self.job);
        if !job.is_none() {
            log::debug!("Peer {} returning {} job", self.id, job.kind());
            self.ctx.jobs.release(job);
        }

        self.transport.shutdown().await;
        debug_assert!(!self.timers.any_armed());

        self.report(PoolEvent::Closed {
            id: self.id,
            address: self.address.clone(),
            reason,
        });
    }
}

fn closed(reason: Option<String>) -> PeerError {
    PeerError::Closed(reason.unwrap_or_else(|| "remote closed the connection".to_string()))
}

/// Pool commands other than job notifications end the session
fn check_stop(command: Option<SessionCommand>) -> Result<(), PeerError> {
    match command {
        Some(SessionCommand::JobsAvailable) => Ok(()),
        Some(SessionCommand::Disconnect(reason)) => Err(PeerError::Stopped(reason)),
        None => Err(PeerError::Stopped("pool stopped".to_string())),
    }
}

async fn next_node_event(
    rx: &mut Option<broadcast::Receiver<NodeEvent>>,
) -> Result<NodeEvent, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
