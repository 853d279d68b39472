//! Node-peers: the peer-connection layer of a blockchain full node
//!
//! This crate provides:
//! - A connection pool that keeps a target number of outgoing peers
//! - A per-connection session state machine with checkpoint verification
//! - At-most-one-holder distribution of header and block download work
//! - TCP and in-process message-bus transports behind one interface
//! - A persistent address book and DNS seed resolution
//!
//! # Example
//!
//! ```rust,no_run
//! use node_peers::config::{Chain, NodeConfig};
//! use node_peers::network::{AddrBook, Connector, JobSources, PoolManager};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::for_chain(Chain::Regtest);
//! let book = Arc::new(AddrBook::new(config.chain));
//! let (pool, task) = PoolManager::start(&config, book, JobSources::idle(), Connector::new())?;
//!
//! for peer in pool.peers().await? {
//!     println!("{} {} {}", peer.id, peer.address, peer.state);
//! }
//! pool.shutdown().await?;
//! task.await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod network;

pub use config::{Chain, Checkpoint, ConfigError, NodeConfig, Timeouts};
pub use crypto::Hash256;
pub use network::{Address, PeerId, PoolHandle, PoolManager, SessionState, StatusEvent};
