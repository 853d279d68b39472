//! Connection transports
//!
//! A [`Transport`] carries framed bytes to and from one remote endpoint. Four
//! variants exist (outbound and inbound, over TCP or over the in-process
//! message bus) and all of them satisfy the same contract, so a session is
//! written once regardless of how its bytes travel.
//!
//! Lifecycle as driven by a session:
//!
//! 1. [`Transport::init`] performs any registration the transport needs
//!    before byte traffic (the bus dealer registers its endpoint here).
//! 2. [`Transport::connect`] establishes the stream. When it reports
//!    `ready = false` the session waits for [`TransportEvent::Ready`].
//! 3. [`Transport::on_connect`] starts the reader and writer tasks. From then
//!    on reassembled frames arrive on the session's event channel.
//! 4. [`Transport::transmit`] queues frames without blocking the caller. The
//!    queue holds at most [`SEND_QUEUE_CAPACITY`] frames.
//! 5. [`Transport::shutdown`] releases everything.

pub mod bus;
pub mod codec;
pub mod tcp;

use crate::config::Chain;
use crate::network::address::{Address, NetworkKind};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

pub use bus::{BusListener, BusPipe, InboundBus, MessageBus, OutboundBus};
pub use codec::{BodySizeFn, Frame, FrameCodec};
pub use tcp::{InboundTcp, OutboundTcp, TcpAcceptor};

/// Frames waiting for a connection's writer task
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection refused: {0}")]
    Refused(String),
    #[error("Framing error: {0}")]
    Framing(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Unsupported network kind {0:?}")]
    Unsupported(NetworkKind),
    #[error("Message bus error: {0}")]
    Bus(String),
    #[error("Send queue full ({0} frames pending)")]
    SendQueueFull(usize),
}

/// The four transport variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    OutboundTcp,
    InboundTcp,
    OutboundBus,
    InboundBus,
}

impl TransportKind {
    pub fn is_inbound(&self) -> bool {
        matches!(self, TransportKind::InboundTcp | TransportKind::InboundBus)
    }
}

/// Result of [`Transport::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// Whether byte traffic may start right away
    pub ready: bool,
    /// Dealer endpoint identifying us to a bus router
    pub dealer_endpoint: Option<String>,
}

impl ConnectOutcome {
    pub fn ready() -> Self {
        Self {
            ready: true,
            dealer_endpoint: None,
        }
    }
}

/// Result of [`Transport::transmit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// Handed to the writer task
    Queued,
    /// The writer queue is full; the remote is not reading
    Full,
    /// The connection is gone; nothing was sent
    Closed,
}

/// Events a transport delivers to its session
#[derive(Debug)]
pub enum TransportEvent {
    /// A reassembled frame
    Frame(Frame),
    /// Deferred readiness after `connect` reported `ready = false`
    Ready,
    /// The stream ended, with an error description when it failed
    Closed(Option<String>),
}

/// Byte-stream contract shared by every transport variant
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Registration needed before byte traffic; returns our endpoint name
    /// when the transport has one
    async fn init(&mut self) -> Result<Option<String>, TransportError> {
        Ok(None)
    }

    /// Establish the byte stream
    async fn connect(&mut self) -> Result<ConnectOutcome, TransportError>;

    /// Start moving bytes. Frames are reassembled with `codec` and delivered
    /// to `sink` together with readiness and close notifications.
    fn on_connect(
        &mut self,
        codec: FrameCodec,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Queue one frame for sending
    fn transmit(&mut self, header: Bytes, body: Bytes) -> TransmitOutcome;

    /// Release the connection; pending frames are flushed when possible
    async fn shutdown(&mut self);
}

/// Reader and writer tasks of a live connection
pub(crate) struct Link {
    writer: Option<mpsc::Sender<Frame>>,
    reader: JoinHandle<()>,
}

impl Link {
    /// Bounded queue feeding a writer task
    pub(crate) fn queue() -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        mpsc::channel(SEND_QUEUE_CAPACITY)
    }

    pub(crate) fn new(writer: mpsc::Sender<Frame>, reader: JoinHandle<()>) -> Self {
        Self {
            writer: Some(writer),
            reader,
        }
    }

    pub(crate) fn transmit(&self, header: Bytes, body: Bytes) -> TransmitOutcome {
        let tx = match &self.writer {
            Some(tx) => tx,
            None => return TransmitOutcome::Closed,
        };
        match tx.try_send(Frame { header, body }) {
            Ok(()) => TransmitOutcome::Queued,
            Err(TrySendError::Full(_)) => TransmitOutcome::Full,
            Err(TrySendError::Closed(_)) => TransmitOutcome::Closed,
        }
    }

    /// Stop reading; the writer drains its queue and exits on its own
    pub(crate) fn close(&mut self) {
        self.writer = None;
        self.reader.abort();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

/// Creates outbound transports by network kind
#[derive(Clone, Default)]
pub struct Connector {
    bus: Option<MessageBus>,
}

impl Connector {
    /// Connector for TCP only
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that can also dial bus endpoints
    pub fn with_bus(bus: MessageBus) -> Self {
        Self { bus: Some(bus) }
    }

    pub fn bus(&self) -> Option<&MessageBus> {
        self.bus.as_ref()
    }

    pub fn outbound(&self, address: &Address) -> Result<Box<dyn Transport>, TransportError> {
        match address.kind {
            NetworkKind::Ipv4 | NetworkKind::Ipv6 => {
                let remote = address
                    .socket_addr()
                    .ok_or_else(|| TransportError::Refused(address.to_string()))?;
                Ok(Box::new(OutboundTcp::new(remote)))
            }
            NetworkKind::Bus => {
                let bus = self
                    .bus
                    .clone()
                    .ok_or(TransportError::Unsupported(NetworkKind::Bus))?;
                let endpoint = address
                    .endpoint_name()
                    .ok_or_else(|| TransportError::Refused(address.to_string()))?;
                Ok(Box::new(OutboundBus::new(bus, endpoint)))
            }
            kind => Err(TransportError::Unsupported(kind)),
        }
    }
}

/// An accepted connection waiting for a session
pub enum InboundConnection {
    Tcp(InboundTcp),
    Bus(InboundBus),
}

impl InboundConnection {
    /// Identity of the remote side
    pub fn remote_address(&self, chain: Chain) -> Address {
        match self {
            InboundConnection::Tcp(t) => Address::from_socket_addr(t.remote(), chain, true),
            InboundConnection::Bus(b) => Address::bus(b.dealer(), chain, true),
        }
    }

    pub fn into_transport(self) -> Box<dyn Transport> {
        match self {
            InboundConnection::Tcp(t) => Box::new(t),
            InboundConnection::Bus(b) => Box::new(b),
        }
    }
}

impl std::fmt::Debug for InboundConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InboundConnection::Tcp(t) => write!(f, "InboundConnection::Tcp({})", t.remote()),
            InboundConnection::Bus(b) => write!(f, "InboundConnection::Bus({})", b.dealer()),
        }
    }
}
