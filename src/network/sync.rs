//! In-memory synchronization oracles
//!
//! [`HeaderSync`] downloads headers sequentially from the chain's genesis,
//! one request in flight at a time. Accepted headers feed a
//! [`BlockDownload`] queue, which splits the hashes into batches so several
//! peers can download blocks in parallel.
//!
//! Neither oracle validates anything beyond linkage; consensus checks belong
//! to the chain engine that replaces them in a full node.

use crate::config::Chain;
use crate::crypto::Hash256;
use crate::network::job::{BlockBatch, BlockOracle, HeaderJob, HeaderOracle, JobId, Submission};
use crate::network::message::{block_hash, BlockHeader, MAX_HEADERS_PER_MESSAGE};
use crate::network::peer::PeerId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Constants
// =============================================================================

/// Blocks per download batch
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Pause before asking again once a peer reports no new headers
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Locator entries taken one by one before the step starts doubling
const LOCATOR_DENSE: usize = 10;

// =============================================================================
// Header Sync
// =============================================================================

struct HeaderState {
    /// Best chain, indexed by height
    headers: Vec<BlockHeader>,
    by_hash: HashMap<Hash256, u64>,
    in_flight: Option<JobId>,
    /// No header jobs until then
    idle_until: Option<Instant>,
}

impl HeaderState {
    fn tip_hash(&self) -> Hash256 {
        self.headers
            .last()
            .map(BlockHeader::block_hash)
            .unwrap_or(Hash256::ZERO)
    }

    /// Dense for the most recent headers, exponentially sparser further back,
    /// always ending at genesis
    fn locator(&self) -> Vec<Hash256> {
        let mut locator = Vec::new();
        let mut height = self.headers.len() as i64 - 1;
        let mut step = 1i64;

        while height > 0 {
            locator.push(self.headers[height as usize].block_hash());
            if locator.len() >= LOCATOR_DENSE {
                step *= 2;
            }
            height -= step;
        }
        if let Some(genesis) = self.headers.first() {
            locator.push(genesis.block_hash());
        }
        locator
    }
}

/// Sequential header download
pub struct HeaderSync {
    state: Mutex<HeaderState>,
    downloads: Option<Arc<BlockDownload>>,
    resync: Duration,
}

impl HeaderSync {
    /// Start from the chain's genesis header
    pub fn new(chain: Chain) -> Self {
        let genesis = chain.genesis_header();
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.block_hash(), 0);

        Self {
            state: Mutex::new(HeaderState {
                headers: vec![genesis],
                by_hash,
                in_flight: None,
                idle_until: None,
            }),
            downloads: None,
            resync: DEFAULT_RESYNC_INTERVAL,
        }
    }

    /// Queue the blocks of accepted headers for download
    pub fn with_downloads(mut self, downloads: Arc<BlockDownload>) -> Self {
        self.downloads = Some(downloads);
        self
    }

    pub fn with_resync_interval(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    /// Best height and hash
    pub fn tip(&self) -> (u64, Hash256) {
        let state = self.state.lock();
        (state.headers.len() as u64 - 1, state.tip_hash())
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }
}

impl HeaderOracle for HeaderSync {
    fn get_job(&self, peer: PeerId) -> Option<HeaderJob> {
        let mut state = self.state.lock();
        if state.in_flight.is_some() {
            return None;
        }
        if let Some(until) = state.idle_until {
            if Instant::now() < until {
                return None;
            }
            state.idle_until = None;
        }

        let job = HeaderJob {
            id: JobId::next(),
            locator: state.locator(),
        };
        state.in_flight = Some(job.id);
        log::debug!("Header {} assigned to peer {}", job.id, peer);
        Some(job)
    }

    fn complete(&self, job: HeaderJob, headers: &[BlockHeader]) -> bool {
        let mut state = self.state.lock();
        if state.in_flight != Some(job.id) {
            log::warn!("Completion for unknown header {}", job.id);
            return false;
        }
        state.in_flight = None;

        if headers.len() < MAX_HEADERS_PER_MESSAGE {
            state.idle_until = Some(Instant::now() + self.resync);
        }

        // Skip anything we already have, then everything must link to our tip
        let known = headers
            .iter()
            .take_while(|h| state.by_hash.contains_key(&h.block_hash()))
            .count();

        let mut accepted = Vec::new();
        for header in &headers[known..] {
            if header.prev_blockhash != state.tip_hash() {
                log::warn!(
                    "Header {} does not extend tip {}",
                    header.block_hash(),
                    state.tip_hash()
                );
                break;
            }
            let hash = header.block_hash();
            let height = state.headers.len() as u64;
            state.headers.push(*header);
            state.by_hash.insert(hash, height);
            accepted.push(hash);
        }

        if accepted.is_empty() {
            // Nothing new is fine; headers that fail to link are not
            return known == headers.len();
        }

        log::info!(
            "Accepted {} headers, height now {}",
            accepted.len(),
            state.headers.len() - 1
        );
        drop(state);

        if let Some(downloads) = &self.downloads {
            downloads.enqueue(accepted);
        }
        true
    }

    fn abandon(&self, job: HeaderJob) {
        let mut state = self.state.lock();
        if state.in_flight == Some(job.id) {
            state.in_flight = None;
            log::debug!("Header {} abandoned", job.id);
        }
    }

    fn height(&self) -> u64 {
        self.state.lock().headers.len() as u64 - 1
    }

    fn header(&self, hash: &Hash256) -> Option<BlockHeader> {
        let state = self.state.lock();
        let height = *state.by_hash.get(hash)?;
        state.headers.get(height as usize).copied()
    }

    fn headers_after(&self, locator: &[Hash256], stop: &Hash256, max: usize) -> Vec<BlockHeader> {
        if locator.is_empty() {
            return self.header(stop).into_iter().collect();
        }

        let state = self.state.lock();
        let start = locator
            .iter()
            .find_map(|hash| state.by_hash.get(hash))
            .map_or(1, |height| height + 1);

        let mut out = Vec::new();
        for header in state.headers.iter().skip(start as usize).take(max) {
            out.push(*header);
            if header.block_hash() == *stop {
                break;
            }
        }
        out
    }
}

// =============================================================================
// Block Download
// =============================================================================

#[derive(Default)]
struct DownloadState {
    queue: VecDeque<Hash256>,
    /// Outstanding hashes per batch
    in_flight: HashMap<JobId, HashSet<Hash256>>,
    received: u64,
}

/// Batched block download queue
pub struct BlockDownload {
    state: Mutex<DownloadState>,
    batch_size: usize,
}

impl BlockDownload {
    pub fn new(batch_size: usize) -> Self {
        Self {
            state: Mutex::new(DownloadState::default()),
            batch_size: batch_size.max(1),
        }
    }

    /// Append hashes to download
    pub fn enqueue(&self, hashes: impl IntoIterator<Item = Hash256>) {
        self.state.lock().queue.extend(hashes);
    }

    /// Hashes not yet handed out
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Batches currently held by sessions
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Blocks received so far
    pub fn received(&self) -> u64 {
        self.state.lock().received
    }
}

impl Default for BlockDownload {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl BlockOracle for BlockDownload {
    fn get_work(&self, peer: PeerId) -> Option<BlockBatch> {
        let mut state = self.state.lock();
        if state.queue.is_empty() {
            return None;
        }

        let take = self.batch_size.min(state.queue.len());
        let hashes: Vec<Hash256> = state.queue.drain(..take).collect();
        let batch = BlockBatch {
            id: JobId::next(),
            hashes,
        };
        state
            .in_flight
            .insert(batch.id, batch.hashes.iter().copied().collect());
        log::debug!(
            "Block {} ({} blocks) assigned to peer {}",
            batch.id,
            batch.hashes.len(),
            peer
        );
        Some(batch)
    }

    fn submit(&self, batch: &BlockBatch, block: &[u8]) -> Submission {
        let hash = match block_hash(block) {
            Some(hash) => hash,
            None => return Submission::default(),
        };

        let mut state = self.state.lock();
        let (accepted, complete) = match state.in_flight.get_mut(&batch.id) {
            Some(remaining) => {
                let accepted = remaining.remove(&hash);
                (accepted, remaining.is_empty())
            }
            None => (false, false),
        };
        if accepted {
            state.received += 1;
        }
        Submission { accepted, complete }
    }

    fn complete(&self, batch: BlockBatch) {
        let mut state = self.state.lock();
        if let Some(remaining) = state.in_flight.remove(&batch.id) {
            if !remaining.is_empty() {
                log::warn!("{} completed with {} blocks missing", batch.id, remaining.len());
                requeue(&mut state.queue, &batch, &remaining);
            }
        }
    }

    fn abandon(&self, batch: BlockBatch) {
        let mut state = self.state.lock();
        if let Some(remaining) = state.in_flight.remove(&batch.id) {
            log::debug!("{} abandoned, {} blocks requeued", batch.id, remaining.len());
            requeue(&mut state.queue, &batch, &remaining);
        }
    }
}

/// Put the missing hashes of a batch back at the front, in batch order
fn requeue(queue: &mut VecDeque<Hash256>, batch: &BlockBatch, remaining: &HashSet<Hash256>) {
    for hash in batch.hashes.iter().rev() {
        if remaining.contains(hash) {
            queue.push_front(*hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(parent: &BlockHeader, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: parent.block_hash(),
            merkle_root: Hash256::digest(&nonce.to_le_bytes()),
            time: parent.time + 600,
            bits: parent.bits,
            nonce,
        }
    }

    fn chain_of(len: usize) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut parent = Chain::Regtest.genesis_header();
        for n in 0..len {
            let next = child(&parent, n as u32);
            headers.push(next);
            parent = next;
        }
        headers
    }

    fn block_bytes(header: &BlockHeader) -> Vec<u8> {
        let mut block = header.serialize().to_vec();
        block.extend_from_slice(b"txs");
        block
    }

    #[test]
    fn test_single_header_job_in_flight() {
        let sync = HeaderSync::new(Chain::Regtest);
        let job = sync.get_job(1).unwrap();
        assert!(sync.get_job(2).is_none());

        sync.abandon(job);
        assert!(sync.get_job(2).is_some());
    }

    #[test]
    fn test_headers_extend_chain_and_feed_downloads() {
        let downloads = Arc::new(BlockDownload::new(2));
        let sync = HeaderSync::new(Chain::Regtest).with_downloads(downloads.clone());
        let headers = chain_of(3);

        let job = sync.get_job(1).unwrap();
        assert_eq!(
            job.recent(),
            &[Chain::Regtest.genesis_header().block_hash()]
        );
        assert!(sync.complete(job, &headers));
        assert_eq!(sync.height(), 3);
        assert_eq!(sync.tip().1, headers[2].block_hash());
        assert_eq!(downloads.queued(), 3);
    }

    #[test]
    fn test_unlinked_headers_rejected() {
        let sync = HeaderSync::new(Chain::Regtest);
        let mut headers = chain_of(2);
        headers.remove(0);

        let job = sync.get_job(1).unwrap();
        assert!(!sync.complete(job, &headers));
        assert_eq!(sync.height(), 0);
    }

    #[test]
    fn test_already_known_headers_accepted() {
        let sync = HeaderSync::new(Chain::Regtest).with_resync_interval(Duration::ZERO);
        let headers = chain_of(3);
        let job = sync.get_job(1).unwrap();
        assert!(sync.complete(job, &headers));

        let job = sync.get_job(2).unwrap();
        assert!(sync.complete(job, &headers[..2]));
        assert_eq!(sync.height(), 3);
    }

    #[test]
    fn test_short_answer_pauses_header_jobs() {
        let sync = HeaderSync::new(Chain::Regtest);
        let job = sync.get_job(1).unwrap();
        assert!(sync.complete(job, &[]));
        assert!(sync.get_job(1).is_none());

        let sync = HeaderSync::new(Chain::Regtest).with_resync_interval(Duration::ZERO);
        let job = sync.get_job(1).unwrap();
        sync.complete(job, &[]);
        assert!(sync.get_job(1).is_some());
    }

    #[test]
    fn test_serves_checkpoint_header_and_ranges() {
        let sync = HeaderSync::new(Chain::Regtest).with_resync_interval(Duration::ZERO);
        let headers = chain_of(5);
        let job = sync.get_job(1).unwrap();
        sync.complete(job, &headers);

        let genesis = Chain::Regtest.genesis_header().block_hash();
        assert_eq!(
            sync.headers_after(&[], &genesis, 2000),
            vec![Chain::Regtest.genesis_header()]
        );
        assert!(sync.headers_after(&[], &Hash256::digest(b"?"), 2000).is_empty());

        let after = sync.headers_after(&[headers[1].block_hash()], &Hash256::ZERO, 2000);
        assert_eq!(after, headers[2..].to_vec());

        let stopped = sync.headers_after(&[genesis], &headers[1].block_hash(), 2000);
        assert_eq!(stopped, headers[..2].to_vec());
    }

    #[test]
    fn test_locator_is_sparse_and_ends_at_genesis() {
        let sync = HeaderSync::new(Chain::Regtest).with_resync_interval(Duration::ZERO);
        let headers = chain_of(100);
        let job = sync.get_job(1).unwrap();
        sync.complete(job, &headers);

        let job = sync.get_job(1).unwrap();
        let locator = job.recent();
        assert_eq!(locator[0], headers[99].block_hash());
        assert_eq!(
            *locator.last().unwrap(),
            Chain::Regtest.genesis_header().block_hash()
        );
        assert!(locator.len() < 30);
    }

    #[test]
    fn test_batches_are_exclusive() {
        let downloads = BlockDownload::new(2);
        let headers = chain_of(3);
        downloads.enqueue(headers.iter().map(BlockHeader::block_hash));

        let a = downloads.get_work(1).unwrap();
        let b = downloads.get_work(2).unwrap();
        assert!(downloads.get_work(3).is_none());
        assert_eq!(a.get().len(), 2);
        assert_eq!(b.get().len(), 1);
        assert!(a.get().iter().all(|h| !b.contains(h)));
    }

    #[test]
    fn test_submit_progress_and_completion() {
        let downloads = BlockDownload::new(2);
        let headers = chain_of(2);
        downloads.enqueue(headers.iter().map(BlockHeader::block_hash));
        let batch = downloads.get_work(1).unwrap();

        let first = downloads.submit(&batch, &block_bytes(&headers[0]));
        assert_eq!(
            first,
            Submission {
                accepted: true,
                complete: false
            }
        );
        let again = downloads.submit(&batch, &block_bytes(&headers[0]));
        assert!(!again.accepted);

        let second = downloads.submit(&batch, &block_bytes(&headers[1]));
        assert!(second.complete);
        downloads.complete(batch);
        assert_eq!(downloads.in_flight(), 0);
        assert_eq!(downloads.received(), 2);
    }

    #[test]
    fn test_abandoned_batch_requeued_in_front() {
        let downloads = BlockDownload::new(2);
        let headers = chain_of(4);
        let hashes: Vec<Hash256> = headers.iter().map(BlockHeader::block_hash).collect();
        downloads.enqueue(hashes.clone());

        let batch = downloads.get_work(1).unwrap();
        downloads.submit(&batch, &block_bytes(&headers[0]));
        downloads.abandon(batch);

        let retry = downloads.get_work(2).unwrap();
        assert_eq!(retry.get(), &[hashes[1], hashes[2]]);
    }
}
