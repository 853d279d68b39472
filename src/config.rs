//! Node configuration
//!
//! Chain parameters (network magic, ports, genesis, checkpoint), the timeout
//! table used by sessions and the pool, and the [`NodeConfig`] loaded from a
//! JSON file by the `peerd` binary.

use crate::crypto::Hash256;
use crate::network::address::{Address, AddressError, NetworkKind, ServiceFlags};
use crate::network::message::{filter_header, BlockHeader};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Chain parameters
// =============================================================================

/// Which network the node participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Chain {
    /// Network tag carried in every message header
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Chain::Mainnet => [0x4D, 0x49, 0x4E, 0x49], // "MINI"
            Chain::Testnet => [0x4D, 0x49, 0x4E, 0x54], // "MINT"
            Chain::Regtest => [0x4D, 0x49, 0x4E, 0x52], // "MINR"
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Chain::Mainnet => 8333,
            Chain::Testnet => 18333,
            Chain::Regtest => 18444,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Chain::Mainnet => "mainnet",
            Chain::Testnet => "testnet",
            Chain::Regtest => "regtest",
        }
    }

    /// Hard-coded genesis header of the chain
    pub fn genesis_header(&self) -> BlockHeader {
        let (time, bits, nonce) = match self {
            Chain::Mainnet => (1_704_067_200, 0x1d00_ffff, 2_083_236_893),
            Chain::Testnet => (1_704_067_201, 0x1d00_ffff, 414_098_458),
            Chain::Regtest => (1_704_067_202, 0x207f_ffff, 2),
        };
        BlockHeader {
            version: 1,
            prev_blockhash: Hash256::ZERO,
            merkle_root: Hash256::digest(format!("node-peers genesis {}", self.name()).as_bytes()),
            time,
            bits,
            nonce,
        }
    }

    /// Hash of the (empty) basic filter committed for the genesis block
    pub fn genesis_filter_hash(&self) -> Hash256 {
        Hash256::digest(&[0x00])
    }

    /// Built-in trust anchor used when no checkpoint is configured
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            height: 0,
            header_hash: self.genesis_header().block_hash(),
            filter_header_hash: filter_header(&self.genesis_filter_hash(), &Hash256::ZERO),
        }
    }

    /// DNS seeds queried when no better candidate exists
    pub fn dns_seeds(&self) -> Vec<String> {
        // Public seeds are not operated yet; deployments configure their own.
        Vec::new()
    }
}

/// A known-good (height, header hash, filter header hash) tuple used to
/// challenge new outbound peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    pub header_hash: Hash256,
    pub filter_header_hash: Hash256,
}

// =============================================================================
// Timeouts
// =============================================================================

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Every timer the peer layer arms, in seconds when serialized
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Limit for establishing the byte stream
    #[serde(with = "duration_secs")]
    pub connect: Duration,
    /// Limit for the version/verack exchange
    #[serde(with = "duration_secs")]
    pub handshake: Duration,
    /// Limit for answering the checkpoint challenge
    #[serde(with = "duration_secs")]
    pub verify: Duration,
    /// Silence tolerated before a peer is dropped
    #[serde(with = "duration_secs")]
    pub activity: Duration,
    /// Idle time in the run state before a ping is sent
    #[serde(with = "duration_secs")]
    pub ping: Duration,
    /// Time a job may go without progress before it is abandoned
    #[serde(with = "duration_secs")]
    pub job: Duration,
    /// Interval between `getaddr` requests
    #[serde(with = "duration_secs")]
    pub peers: Duration,
    /// Interval between job requests while no work is available
    #[serde(with = "duration_secs")]
    pub dispatch: Duration,
    /// Interval between pool target checks
    #[serde(with = "duration_secs")]
    pub connect_interval: Duration,
    /// How long an address rests after a connection attempt
    #[serde(with = "duration_secs")]
    pub retry_backoff: Duration,
    /// Minimum interval between DNS seed queries
    #[serde(with = "duration_secs")]
    pub dns: Duration,
    /// Interval between address book flushes
    #[serde(with = "duration_secs")]
    pub dump: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            handshake: Duration::from_secs(30),
            verify: Duration::from_secs(60),
            activity: Duration::from_secs(10 * 60),
            ping: Duration::from_secs(2 * 60),
            job: Duration::from_secs(60),
            peers: Duration::from_secs(30 * 60),
            dispatch: Duration::from_secs(5),
            connect_interval: Duration::from_secs(2),
            retry_backoff: Duration::from_secs(60),
            dns: Duration::from_secs(60),
            dump: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Node configuration
// =============================================================================

/// Peer layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain: Chain,
    /// Directory holding the address book
    pub data_dir: PathBuf,
    /// Addresses to accept connections on
    pub listen: Vec<String>,
    /// Peers to connect to before anything else
    pub peers: Vec<String>,
    /// Number of outgoing connections to maintain
    pub target_outgoing: usize,
    /// Inbound connections accepted at most
    pub max_inbound: usize,
    /// Network kinds considered usable when picking addresses
    pub network_kinds: Vec<NetworkKind>,
    /// Services a preferred candidate must advertise
    pub preferred_services: ServiceFlags,
    /// Services we advertise
    pub local_services: ServiceFlags,
    pub user_agent: String,
    /// Ask peers to relay transactions to us
    pub relay: bool,
    /// DNS seeds; empty means the chain defaults
    pub dns_seeds: Vec<String>,
    /// Overrides the chain's built-in checkpoint
    pub checkpoint: Option<Checkpoint>,
    pub timeouts: Timeouts,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain: Chain::Mainnet,
            data_dir: PathBuf::from(".peer_data"),
            listen: Vec::new(),
            peers: Vec::new(),
            target_outgoing: 8,
            max_inbound: 32,
            network_kinds: NetworkKind::dialable(),
            preferred_services: ServiceFlags::NETWORK | ServiceFlags::COMPACT_FILTERS,
            local_services: ServiceFlags::NETWORK,
            user_agent: format!("/node-peers:{}/", env!("CARGO_PKG_VERSION")),
            relay: true,
            dns_seeds: Vec::new(),
            checkpoint: None,
            timeouts: Timeouts::default(),
        }
    }
}

impl NodeConfig {
    /// Defaults for the given chain
    pub fn for_chain(chain: Chain) -> Self {
        Self {
            chain,
            ..Default::default()
        }
    }

    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pool cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_kinds.is_empty() {
            return Err(ConfigError::Invalid("no usable network kinds".to_string()));
        }
        if self.user_agent.len() > 256 {
            return Err(ConfigError::Invalid("user agent too long".to_string()));
        }
        self.configured_peers()?;
        Ok(())
    }

    /// The checkpoint new outbound peers are challenged with
    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint.unwrap_or_else(|| self.chain.checkpoint())
    }

    /// Explicitly configured peers, parsed
    pub fn configured_peers(&self) -> Result<Vec<Address>, AddressError> {
        self.peers
            .iter()
            .map(|p| Address::parse(p, self.chain))
            .collect()
    }

    /// Listen addresses, parsed
    pub fn listen_addresses(&self) -> Result<Vec<Address>, AddressError> {
        self.listen
            .iter()
            .map(|p| Address::parse(p, self.chain))
            .collect()
    }

    /// Configured seeds, or the chain defaults when none are configured
    pub fn seeds(&self) -> Vec<String> {
        if self.dns_seeds.is_empty() {
            self.chain.dns_seeds()
        } else {
            self.dns_seeds.clone()
        }
    }

    /// Address book file inside the data directory
    pub fn addr_book_path(&self) -> PathBuf {
        self.data_dir.join("peers.json")
    }
}
