//! Peer networking
//!
//! Discovers, opens, authenticates, supervises and tears down connections
//! to other nodes, and hands synchronization work to idle peers.
//!
//! # Layout
//! - [`transport`]: byte streams over TCP or the in-process message bus
//! - [`wire`]: message framing on top of a transport
//! - [`session`]: one actor per connection with its protocol state machine
//! - [`pool`] and [`manager`]: connection target, candidate selection, status
//! - [`job`] and [`sync`]: work distribution and the in-memory oracles
//! - [`addrman`] and [`dns`]: where candidate addresses come from

pub mod address;
pub mod addrman;
pub mod dns;
pub mod job;
pub mod manager;
pub mod message;
pub mod peer;
pub mod pool;
pub mod session;
pub mod status;
pub mod sync;
pub mod transport;
pub mod wire;

pub use address::{Address, AddressError, AddressId, NetworkKind, Protocol, ServiceFlags};
pub use addrman::{AddrBook, AddrBookError, AddressFilter, AddressQuery, AddressSource};
pub use dns::DnsOutcome;
pub use job::{
    BlockBatch, BlockOracle, HeaderJob, HeaderOracle, Job, JobId, JobSources, NoWork, Submission,
};
pub use manager::{PoolCommand, PoolHandle, PoolManager};
pub use message::{
    BlockHeader, InvItem, InvType, Message, NetAddr, RejectCode, RejectMessage, VersionMessage,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use peer::{
    NodeEvent, PeerError, PeerHandle, PeerId, PeerInfo, PoolEvent, RemoteInfo, SessionCommand,
};
pub use pool::{Candidate, PeerPool, PoolError};
pub use session::{Session, SessionContext, SessionState};
pub use status::{StatusBus, StatusEvent};
pub use sync::{BlockDownload, HeaderSync};
pub use transport::{Connector, MessageBus, Transport, TransportError};
pub use wire::WireError;
