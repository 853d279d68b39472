//! Address source for peer selection
//!
//! The pool consumes addresses through the [`AddressSource`] trait.
//! [`AddrBook`] is the in-process implementation: records keyed by
//! [`AddressId`], never deleted, only refreshed, persisted as JSON in the
//! data directory.

use crate::config::Chain;
use crate::network::address::{Address, AddressId, NetworkKind, Protocol, ServiceFlags};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Records kept at most; updates to known records are always applied
pub const MAX_ADDRESSES: usize = 20_000;

/// Address book errors
#[derive(Error, Debug)]
pub enum AddrBookError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

// =============================================================================
// Queries
// =============================================================================

/// Candidate query used by the pool
#[derive(Debug, Clone, Copy)]
pub struct AddressQuery<'a> {
    pub protocol: Protocol,
    /// Usable network kinds
    pub kinds: &'a [NetworkKind],
    /// Services the candidate must advertise; empty means no preference
    pub services: ServiceFlags,
    /// Never returned
    pub exclude: &'a HashSet<AddressId>,
}

impl AddressQuery<'_> {
    pub fn matches(&self, address: &Address) -> bool {
        !address.incoming
            && address.protocol == self.protocol
            && self.kinds.contains(&address.kind)
            && address.services.contains(self.services)
            && !self.exclude.contains(&address.id())
            && address.is_valid()
    }
}

/// Richer filter for listing addresses
#[derive(Debug, Clone)]
pub struct AddressFilter {
    pub chain: Option<Chain>,
    /// Empty means any kind
    pub kinds: Vec<NetworkKind>,
    pub services: ServiceFlags,
    pub exclude: HashSet<AddressId>,
    /// Only addresses we completed a handshake with
    pub connected_only: bool,
    pub limit: usize,
}

impl Default for AddressFilter {
    fn default() -> Self {
        Self {
            chain: None,
            kinds: Vec::new(),
            services: ServiceFlags::empty(),
            exclude: HashSet::new(),
            connected_only: false,
            limit: usize::MAX,
        }
    }
}

impl AddressFilter {
    pub fn matches(&self, address: &Address) -> bool {
        !address.incoming
            && self.chain.map_or(true, |c| c == address.chain)
            && (self.kinds.is_empty() || self.kinds.contains(&address.kind))
            && address.services.contains(self.services)
            && (!self.connected_only || address.last_connected.is_some())
            && !self.exclude.contains(&address.id())
            && address.is_valid()
    }
}

/// Store of known peer addresses
pub trait AddressSource: Send + Sync {
    /// Insert a record or refresh the stored one
    fn add_or_update(&self, address: &Address);

    /// One candidate, or `None` when nothing matches. With preferred services
    /// the most recently connected match wins; otherwise any match.
    fn get(&self, query: &AddressQuery<'_>) -> Option<Address>;

    fn find(&self, filter: &AddressFilter) -> Vec<Address>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist pending changes
    fn flush(&self) -> Result<(), AddrBookError> {
        Ok(())
    }
}

// =============================================================================
// Address Book
// =============================================================================

/// In-memory address store with optional JSON persistence
pub struct AddrBook {
    chain: Chain,
    entries: RwLock<HashMap<AddressId, Address>>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl AddrBook {
    /// Book without persistence
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            entries: RwLock::new(HashMap::new()),
            path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Open the book stored at `path`, starting empty when the file is missing
    pub fn open(path: &Path, chain: Chain) -> Result<Self, AddrBookError> {
        let book = Self {
            path: Some(path.to_path_buf()),
            ..Self::new(chain)
        };

        if path.exists() {
            let reader = BufReader::new(fs::File::open(path)?);
            let records: Vec<Address> = serde_json::from_reader(reader)?;
            let mut entries = book.entries.write();
            for record in records.into_iter().filter(|a| a.chain == chain) {
                entries.insert(record.id(), record);
            }
            log::info!("Loaded {} addresses from {}", entries.len(), path.display());
        }

        Ok(book)
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }
}

impl AddressSource for AddrBook {
    fn add_or_update(&self, address: &Address) {
        if address.chain != self.chain || address.incoming || !address.is_valid() {
            return;
        }

        let mut entries = self.entries.write();
        let id = address.id();
        let full = entries.len() >= MAX_ADDRESSES;
        match entries.get_mut(&id) {
            Some(stored) => stored.merge(address),
            None if !full => {
                entries.insert(id, address.clone());
            }
            None => return,
        }
        self.dirty.store(true, Ordering::Relaxed);
    }

    fn get(&self, query: &AddressQuery<'_>) -> Option<Address> {
        let entries = self.entries.read();
        let candidates: Vec<&Address> = entries.values().filter(|a| query.matches(a)).collect();

        if query.services.is_empty() {
            return candidates.choose(&mut rand::thread_rng()).map(|a| (*a).clone());
        }

        candidates
            .into_iter()
            .max_by(|a, b| {
                a.last_connected
                    .cmp(&b.last_connected)
                    .then_with(|| b.id().cmp(&a.id()))
            })
            .cloned()
    }

    fn find(&self, filter: &AddressFilter) -> Vec<Address> {
        let entries = self.entries.read();
        let mut found: Vec<Address> = entries
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_connected.cmp(&a.last_connected));
        found.truncate(filter.limit);
        found
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn flush(&self) -> Result<(), AddrBookError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }

        let records: Vec<Address> = self.entries.read().values().cloned().collect();
        let result = write_atomically(path, &records);
        if result.is_err() {
            self.dirty.store(true, Ordering::Relaxed);
        } else {
            log::debug!("Saved {} addresses to {}", records.len(), path.display());
        }
        result
    }
}

/// Write to a temporary file first, then rename over the target
fn write_atomically(path: &Path, records: &[Address]) -> Result<(), AddrBookError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let temp_path = path.with_extension("tmp");
    let writer = BufWriter::new(fs::File::create(&temp_path)?);
    serde_json::to_writer_pretty(writer, records)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
