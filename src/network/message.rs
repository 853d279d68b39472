//! Network message types for P2P communication
//!
//! Defines the messages a session exchanges with a remote peer. How a
//! message is laid out on the wire is the business of [`super::wire`].

use crate::crypto::Hash256;
use crate::network::address::{Address, NetworkKind, Protocol, ServiceFlags};
use crate::config::Chain;
use serde::{Deserialize, Serialize};

/// Protocol version we speak
pub const PROTOCOL_VERSION: u32 = 2;

/// Oldest protocol version we accept (first one serving filter headers)
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// Maximum addresses in one `addr` message
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Maximum headers in one `headers` message
pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;

/// Maximum entries in one inventory message
pub const MAX_INV_PER_MESSAGE: usize = 50_000;

/// Filter type of the basic block filter
pub const BASIC_FILTER: u8 = 0;

/// Size of a serialized block header
pub const HEADER_LEN: usize = 80;

/// Network message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Opens the handshake
    Version(VersionMessage),
    /// Acknowledges the remote version
    VerAck,
    /// Liveness probe
    Ping(u64),
    /// Liveness answer echoing the nonce
    Pong(u64),
    /// Ask for known peer addresses
    GetAddr,
    /// Gossiped peer addresses
    Addr(Vec<NetAddr>),
    /// Ask for headers following the first locator hash we share.
    /// An empty locator asks for the single header `stop`.
    GetHeaders { locator: Vec<Hash256>, stop: Hash256 },
    /// Block headers
    Headers(Vec<BlockHeader>),
    /// Ask for compact filter headers from `start_height` up to `stop_hash`
    GetCFHeaders {
        filter_type: u8,
        start_height: u32,
        stop_hash: Hash256,
    },
    /// Filter hashes to be chained onto `previous_filter_header`
    CFHeaders {
        filter_type: u8,
        stop_hash: Hash256,
        previous_filter_header: Hash256,
        filter_hashes: Vec<Hash256>,
    },
    /// Inventory announcement
    Inv(Vec<InvItem>),
    /// Request announced objects
    GetData(Vec<InvItem>),
    /// Requested objects we do not have
    NotFound(Vec<InvItem>),
    /// Serialized block (80-byte header first)
    Block(#[serde(with = "hex::serde")] Vec<u8>),
    /// Serialized transaction
    Tx(#[serde(with = "hex::serde")] Vec<u8>),
    /// Rejection of a previous message
    Reject(RejectMessage),
}

impl Message {
    /// Wire command name, at most 12 bytes
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetCFHeaders { .. } => "getcfheaders",
            Message::CFHeaders { .. } => "cfheaders",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Reject(_) => "reject",
        }
    }

    /// Serialize message body
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message body
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Handshake message for initial connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMessage {
    pub version: u32,
    pub services: ServiceFlags,
    /// Sender's unix time
    pub timestamp: i64,
    /// Random value used to detect connections to ourselves
    pub nonce: u64,
    pub user_agent: String,
    /// Sender's best height
    pub start_height: u64,
    /// Whether the sender wants transaction announcements
    pub relay: bool,
}

impl VersionMessage {
    pub fn new(
        services: ServiceFlags,
        nonce: u64,
        user_agent: String,
        start_height: u64,
        relay: bool,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services,
            timestamp: chrono::Utc::now().timestamp(),
            nonce,
            user_agent,
            start_height,
            relay,
        }
    }
}

/// Address entry in `addr` messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetAddr {
    pub kind: NetworkKind,
    #[serde(with = "hex::serde")]
    pub endpoint: Vec<u8>,
    pub port: u16,
    pub services: ServiceFlags,
    /// When the address was last seen alive
    pub timestamp: i64,
}

impl NetAddr {
    pub fn from_address(address: &Address) -> Self {
        Self {
            kind: address.kind,
            endpoint: address.endpoint.clone(),
            port: address.port,
            services: address.services,
            timestamp: address.last_connected.unwrap_or(0),
        }
    }

    /// Turn a gossiped entry into an address on our chain
    pub fn to_address(&self, chain: Chain) -> Address {
        Address {
            kind: self.kind,
            protocol: Protocol::Native,
            endpoint: self.endpoint.clone(),
            port: self.port,
            chain,
            services: self.services,
            last_connected: None,
            incoming: false,
        }
    }
}

/// 80-byte block header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_blockhash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Consensus serialization, little-endian integers
    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_blockhash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn block_hash(&self) -> Hash256 {
        Hash256::digest(&self.serialize())
    }
}

/// Hash of a serialized block, i.e. of its leading header
pub fn block_hash(block: &[u8]) -> Option<Hash256> {
    block.get(..HEADER_LEN).map(Hash256::digest)
}

/// Hash of a serialized transaction
pub fn txid(tx: &[u8]) -> Hash256 {
    Hash256::digest(tx)
}

/// Chain one filter hash onto the previous filter header
pub fn filter_header(filter_hash: &Hash256, previous: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(filter_hash.as_bytes());
    data[32..].copy_from_slice(previous.as_bytes());
    Hash256::digest(&data)
}

/// Filter headers for consecutive filter hashes starting after `previous`
pub fn chain_filter_headers(previous: &Hash256, filter_hashes: &[Hash256]) -> Vec<Hash256> {
    let mut headers = Vec::with_capacity(filter_hashes.len());
    let mut prev = *previous;
    for hash in filter_hashes {
        prev = filter_header(hash, &prev);
        headers.push(prev);
    }
    headers
}

/// Inventory object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvType {
    Tx,
    Block,
}

/// Inventory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvItem {
    pub kind: InvType,
    pub hash: Hash256,
}

impl InvItem {
    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvType::Block,
            hash,
        }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvType::Tx,
            hash,
        }
    }
}

/// Reject codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
}

/// Reject message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectMessage {
    /// Command of the rejected message
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: Hash256::ZERO,
            merkle_root: Hash256::digest(b"root"),
            time: 1_700_000_000,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::Ping(12345);
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_block_payload_is_hex() {
        let msg = Message::Block(vec![0xde, 0xad]);
        let json = String::from_utf8(msg.to_bytes().unwrap()).unwrap();
        assert!(json.contains("dead"));
        assert_eq!(Message::from_bytes(json.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_commands_fit_header() {
        let messages = vec![
            Message::VerAck,
            Message::GetCFHeaders {
                filter_type: BASIC_FILTER,
                start_height: 0,
                stop_hash: Hash256::ZERO,
            },
            Message::NotFound(vec![]),
        ];
        for msg in messages {
            assert!(msg.command().len() <= 12, "{}", msg.command());
        }
    }

    #[test]
    fn test_header_hash_covers_every_field() {
        let base = header(1);
        let mut other = base;
        other.nonce = 2;
        assert_ne!(base.block_hash(), other.block_hash());
        assert_eq!(base.serialize().len(), HEADER_LEN);
    }

    #[test]
    fn test_block_hash_uses_leading_header() {
        let h = header(7);
        let mut block = h.serialize().to_vec();
        block.extend_from_slice(b"transactions");
        assert_eq!(block_hash(&block), Some(h.block_hash()));
        assert_eq!(block_hash(&block[..10]), None);
    }

    #[test]
    fn test_filter_header_chain() {
        let hashes = vec![Hash256::digest(b"f0"), Hash256::digest(b"f1")];
        let chained = chain_filter_headers(&Hash256::ZERO, &hashes);
        assert_eq!(chained.len(), 2);
        assert_eq!(chained[0], filter_header(&hashes[0], &Hash256::ZERO));
        assert_eq!(chained[1], filter_header(&hashes[1], &chained[0]));
    }

    #[test]
    fn test_net_addr_roundtrip_to_address() {
        let mut address = Address::parse("10.1.2.3:8333", Chain::Mainnet).unwrap();
        address.services = ServiceFlags::NETWORK;
        let net = NetAddr::from_address(&address);
        let back = net.to_address(Chain::Mainnet);
        assert_eq!(back, address);
        assert_eq!(back.services, ServiceFlags::NETWORK);
    }
}
