//! Peer addresses
//!
//! An [`Address`] describes one reachable endpoint plus the metadata the pool
//! learns about it over time (advertised services, last successful
//! connection). Its identity is derived from the endpoint alone, so two
//! records for the same endpoint always compare equal no matter how fresh
//! their metadata is.

use crate::config::Chain;
use crate::crypto::double_sha256;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// URL scheme used to spell message-bus endpoints
pub const BUS_SCHEME: &str = "bus://";

/// Suffix identifying onion service host names
const ONION_SUFFIX: &str = ".onion";

bitflags! {
    /// Service bits advertised in `version` and `addr` messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        /// Serves the full block chain
        const NETWORK = 1;
        /// Supports bloom-filtered connections
        const BLOOM = 1 << 2;
        /// Serves witness data
        const WITNESS = 1 << 3;
        /// Serves compact block filters and filter headers
        const COMPACT_FILTERS = 1 << 6;
        /// Serves only the most recent blocks
        const NETWORK_LIMITED = 1 << 10;
    }
}

/// Address parsing errors
#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,
    #[error("Invalid address: {0}")]
    Invalid(String),
    #[error("Invalid port in {0}")]
    InvalidPort(String),
}

/// Network an endpoint lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Ipv4,
    Ipv6,
    Onion,
    /// In-process message-bus endpoint
    Bus,
}

impl NetworkKind {
    fn tag(self) -> u8 {
        match self {
            NetworkKind::Ipv4 => 1,
            NetworkKind::Ipv6 => 2,
            NetworkKind::Onion => 3,
            NetworkKind::Bus => 4,
        }
    }

    /// Kinds the node can dial without extra infrastructure
    pub fn dialable() -> Vec<NetworkKind> {
        vec![NetworkKind::Ipv4, NetworkKind::Ipv6, NetworkKind::Bus]
    }
}

/// Wire protocol family spoken at an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Magic-tagged, checksummed framing from [`crate::network::wire`]
    #[default]
    Native,
}

/// Stable identity of an address, derived from (kind, endpoint, port, chain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressId(pub u64);

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A peer endpoint and what we know about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub kind: NetworkKind,
    #[serde(default)]
    pub protocol: Protocol,
    /// Raw endpoint: 4 or 16 IP bytes, onion host name, or bus endpoint name
    #[serde(with = "hex::serde")]
    pub endpoint: Vec<u8>,
    pub port: u16,
    pub chain: Chain,
    #[serde(default)]
    pub services: ServiceFlags,
    /// Unix time of the last completed handshake
    #[serde(default)]
    pub last_connected: Option<i64>,
    #[serde(default)]
    pub incoming: bool,
}

impl Address {
    /// Build an address from a socket address
    pub fn from_socket_addr(addr: SocketAddr, chain: Chain, incoming: bool) -> Self {
        let (kind, endpoint) = match addr.ip() {
            IpAddr::V4(ip) => (NetworkKind::Ipv4, ip.octets().to_vec()),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => (NetworkKind::Ipv4, v4.octets().to_vec()),
                None => (NetworkKind::Ipv6, ip.octets().to_vec()),
            },
        };
        Self {
            kind,
            protocol: Protocol::Native,
            endpoint,
            port: addr.port(),
            chain,
            services: ServiceFlags::empty(),
            last_connected: None,
            incoming,
        }
    }

    /// Build a message-bus address for the named endpoint
    pub fn bus(endpoint: &str, chain: Chain, incoming: bool) -> Self {
        Self {
            kind: NetworkKind::Bus,
            protocol: Protocol::Native,
            endpoint: endpoint.as_bytes().to_vec(),
            port: 0,
            chain,
            services: ServiceFlags::empty(),
            last_connected: None,
            incoming,
        }
    }

    /// Parse `ip:port`, `[ipv6]:port`, a bare IP (default port),
    /// `name.onion:port` or `bus://endpoint`
    pub fn parse(s: &str, chain: Chain) -> Result<Self, AddressError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Some(name) = s.strip_prefix(BUS_SCHEME) {
            if name.is_empty() {
                return Err(AddressError::Invalid(s.to_string()));
            }
            return Ok(Self::bus(name, chain, false));
        }

        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::from_socket_addr(addr, chain, false));
        }

        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self::from_socket_addr(
                SocketAddr::new(ip, chain.default_port()),
                chain,
                false,
            ));
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| AddressError::InvalidPort(s.to_string()))?,
            ),
            None => (s, chain.default_port()),
        };
        if host.ends_with(ONION_SUFFIX) && host.len() > ONION_SUFFIX.len() {
            return Ok(Self {
                kind: NetworkKind::Onion,
                protocol: Protocol::Native,
                endpoint: host.as_bytes().to_vec(),
                port,
                chain,
                services: ServiceFlags::empty(),
                last_connected: None,
                incoming: false,
            });
        }

        Err(AddressError::Invalid(s.to_string()))
    }

    /// Content-derived identity; a pure function of kind, endpoint, port and chain
    pub fn id(&self) -> AddressId {
        let mut data = Vec::with_capacity(self.endpoint.len() + 7);
        data.push(self.kind.tag());
        data.extend_from_slice(&self.chain.magic());
        data.extend_from_slice(&self.port.to_le_bytes());
        data.extend_from_slice(&self.endpoint);
        let digest = double_sha256(&data);
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        AddressId(u64::from_le_bytes(id))
    }

    /// Socket address for IP kinds
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.kind {
            NetworkKind::Ipv4 => {
                let octets: [u8; 4] = self.endpoint.as_slice().try_into().ok()?;
                Some(SocketAddr::new(Ipv4Addr::from(octets).into(), self.port))
            }
            NetworkKind::Ipv6 => {
                let octets: [u8; 16] = self.endpoint.as_slice().try_into().ok()?;
                Some(SocketAddr::new(Ipv6Addr::from(octets).into(), self.port))
            }
            NetworkKind::Onion | NetworkKind::Bus => None,
        }
    }

    /// Endpoint name for bus and onion kinds
    pub fn endpoint_name(&self) -> Option<&str> {
        match self.kind {
            NetworkKind::Onion | NetworkKind::Bus => std::str::from_utf8(&self.endpoint).ok(),
            NetworkKind::Ipv4 | NetworkKind::Ipv6 => None,
        }
    }

    /// Whether the record describes something we could ever dial
    pub fn is_valid(&self) -> bool {
        match self.kind {
            NetworkKind::Ipv4 | NetworkKind::Ipv6 => match self.socket_addr() {
                Some(addr) => !addr.ip().is_unspecified() && addr.port() != 0,
                None => false,
            },
            NetworkKind::Onion => self.port != 0 && self.endpoint_name().is_some(),
            NetworkKind::Bus => self.endpoint_name().map_or(false, |n| !n.is_empty()),
        }
    }

    /// Refresh mutable metadata from a newer record for the same endpoint
    pub fn merge(&mut self, newer: &Address) {
        if !newer.services.is_empty() {
            self.services = newer.services;
        }
        self.last_connected = match (self.last_connected, newer.last_connected) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.endpoint == other.endpoint
            && self.port == other.port
            && self.chain == other.chain
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NetworkKind::Ipv4 | NetworkKind::Ipv6 => match self.socket_addr() {
                Some(addr) => write!(f, "{}", addr),
                None => write!(f, "<invalid {:?}>", self.kind),
            },
            NetworkKind::Onion => {
                write!(f, "{}:{}", self.endpoint_name().unwrap_or("?"), self.port)
            }
            NetworkKind::Bus => write!(f, "{}{}", BUS_SCHEME, self.endpoint_name().unwrap_or("?")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let addr = Address::parse("10.0.0.1:9000", Chain::Regtest).unwrap();
        assert_eq!(addr.kind, NetworkKind::Ipv4);
        assert_eq!(addr.endpoint, vec![10, 0, 0, 1]);
        assert_eq!(addr.port, 9000);
        assert_eq!(addr.to_string(), "10.0.0.1:9000");
    }

    #[test]
    fn test_parse_bare_ip_uses_default_port() {
        let addr = Address::parse("10.0.0.1", Chain::Mainnet).unwrap();
        assert_eq!(addr.port, Chain::Mainnet.default_port());
    }

    #[test]
    fn test_parse_ipv6_bus_and_onion() {
        let v6 = Address::parse("[2001:db8::1]:8333", Chain::Mainnet).unwrap();
        assert_eq!(v6.kind, NetworkKind::Ipv6);
        assert_eq!(v6.to_string(), "[2001:db8::1]:8333");

        let bus = Address::parse("bus://node-a", Chain::Regtest).unwrap();
        assert_eq!(bus.kind, NetworkKind::Bus);
        assert_eq!(bus.endpoint_name(), Some("node-a"));
        assert_eq!(bus.to_string(), "bus://node-a");

        let onion = Address::parse("abcdef.onion:9050", Chain::Mainnet).unwrap();
        assert_eq!(onion.kind, NetworkKind::Onion);
        assert!(onion.socket_addr().is_none());

        assert!(Address::parse("example.com:8333", Chain::Mainnet).is_err());
        assert_eq!(Address::parse("  ", Chain::Mainnet), Err(AddressError::Empty));
    }

    #[test]
    fn test_identity_ignores_metadata() {
        let mut a = Address::parse("10.0.0.1:9000", Chain::Regtest).unwrap();
        let b = Address::parse("10.0.0.1:9000", Chain::Regtest).unwrap();
        a.services = ServiceFlags::NETWORK | ServiceFlags::COMPACT_FILTERS;
        a.last_connected = Some(1_700_000_000);
        a.incoming = true;

        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_identity_depends_on_chain_and_port() {
        let a = Address::parse("10.0.0.1:9000", Chain::Regtest).unwrap();
        let other_port = Address::parse("10.0.0.1:9001", Chain::Regtest).unwrap();
        let other_chain = Address::parse("10.0.0.1:9000", Chain::Testnet).unwrap();

        assert_ne!(a.id(), other_port.id());
        assert_ne!(a.id(), other_chain.id());
    }

    #[test]
    fn test_mapped_ipv6_is_ipv4() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:9000".parse().unwrap();
        let addr = Address::from_socket_addr(mapped, Chain::Regtest, true);
        assert_eq!(addr.kind, NetworkKind::Ipv4);
        assert_eq!(addr, Address::parse("10.0.0.1:9000", Chain::Regtest).unwrap());
    }

    #[test]
    fn test_merge_keeps_newest_metadata() {
        let mut stored = Address::parse("10.0.0.1:9000", Chain::Regtest).unwrap();
        stored.last_connected = Some(200);
        stored.services = ServiceFlags::NETWORK;

        let mut newer = stored.clone();
        newer.last_connected = Some(100);
        newer.services = ServiceFlags::empty();

        stored.merge(&newer);
        assert_eq!(stored.last_connected, Some(200));
        assert_eq!(stored.services, ServiceFlags::NETWORK);
    }

    #[test]
    fn test_address_json_roundtrip_keeps_identity() {
        let mut addr = Address::parse("bus://relay", Chain::Testnet).unwrap();
        addr.services = ServiceFlags::NETWORK;
        let json = serde_json::to_string(&addr).unwrap();
        let decoded: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id(), addr.id());
        assert_eq!(decoded.services, ServiceFlags::NETWORK);
    }

    #[test]
    fn test_validity() {
        assert!(!Address::parse("0.0.0.0:8333", Chain::Mainnet).unwrap().is_valid());
        assert!(!Address::parse("10.0.0.1:0", Chain::Mainnet).unwrap().is_valid());
        assert!(Address::parse("10.0.0.1:1", Chain::Mainnet).unwrap().is_valid());
    }
}
