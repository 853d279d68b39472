//! Synchronization work handed to sessions
//!
//! Work comes from two oracles: the header-sync oracle hands out header
//! ranges, the block oracle hands out batches of blocks to download. A unit
//! of work is held by at most one session at a time and always goes back to
//! its oracle, either completed or abandoned.

use crate::crypto::Hash256;
use crate::network::message::BlockHeader;
use crate::network::peer::PeerId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_JOB: AtomicU64 = AtomicU64::new(1);

/// Identifier of one unit of work, unique for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl JobId {
    pub fn next() -> Self {
        JobId(NEXT_JOB.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Request for the headers following our best chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderJob {
    pub id: JobId,
    pub locator: Vec<Hash256>,
}

impl HeaderJob {
    /// Recent block hashes, newest first, used to build `getheaders`
    pub fn recent(&self) -> &[Hash256] {
        &self.locator
    }
}

/// Blocks to download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBatch {
    pub id: JobId,
    pub hashes: Vec<Hash256>,
}

impl BlockBatch {
    pub fn get(&self) -> &[Hash256] {
        &self.hashes
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.hashes.contains(hash)
    }
}

/// Result of submitting one block of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Submission {
    /// The block belonged to the batch and was new
    pub accepted: bool,
    /// Every block of the batch has now arrived
    pub complete: bool,
}

/// Source of header-range work
pub trait HeaderOracle: Send + Sync {
    fn get_job(&self, peer: PeerId) -> Option<HeaderJob>;

    /// Hand back a job with the headers the peer returned. Returns whether
    /// the headers extended our chain. The job is consumed either way.
    fn complete(&self, job: HeaderJob, headers: &[BlockHeader]) -> bool;

    /// Return a job unfinished so another session can claim it
    fn abandon(&self, job: HeaderJob);

    /// Height of our best header
    fn height(&self) -> u64 {
        0
    }

    /// Header with the given hash, if known
    fn header(&self, _hash: &Hash256) -> Option<BlockHeader> {
        None
    }

    /// Headers after the first locator hash we know, up to `stop` or `max`
    fn headers_after(&self, _locator: &[Hash256], _stop: &Hash256, _max: usize) -> Vec<BlockHeader> {
        Vec::new()
    }
}

/// Source of block-download work
pub trait BlockOracle: Send + Sync {
    fn get_work(&self, peer: PeerId) -> Option<BlockBatch>;

    fn submit(&self, batch: &BlockBatch, block: &[u8]) -> Submission;

    /// Mark a fully received batch as done
    fn complete(&self, batch: BlockBatch);

    /// Return an unfinished batch
    fn abandon(&self, batch: BlockBatch);
}

/// Oracle that never has work
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWork;

impl HeaderOracle for NoWork {
    fn get_job(&self, _peer: PeerId) -> Option<HeaderJob> {
        None
    }

    fn complete(&self, _job: HeaderJob, _headers: &[BlockHeader]) -> bool {
        false
    }

    fn abandon(&self, _job: HeaderJob) {}
}

impl BlockOracle for NoWork {
    fn get_work(&self, _peer: PeerId) -> Option<BlockBatch> {
        None
    }

    fn submit(&self, _batch: &BlockBatch, _block: &[u8]) -> Submission {
        Submission::default()
    }

    fn complete(&self, _batch: BlockBatch) {}

    fn abandon(&self, _batch: BlockBatch) {}
}

/// The work a session currently holds
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Job {
    #[default]
    None,
    Headers(HeaderJob),
    Blocks(BlockBatch),
}

impl Job {
    pub fn is_none(&self) -> bool {
        matches!(self, Job::None)
    }

    pub fn id(&self) -> Option<JobId> {
        match self {
            Job::None => None,
            Job::Headers(job) => Some(job.id),
            Job::Blocks(batch) => Some(batch.id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::None => "none",
            Job::Headers(_) => "headers",
            Job::Blocks(_) => "blocks",
        }
    }
}

/// Both oracles, queried in priority order
#[derive(Clone)]
pub struct JobSources {
    headers: Arc<dyn HeaderOracle>,
    blocks: Arc<dyn BlockOracle>,
}

impl JobSources {
    pub fn new(headers: Arc<dyn HeaderOracle>, blocks: Arc<dyn BlockOracle>) -> Self {
        Self { headers, blocks }
    }

    /// Sources without any work
    pub fn idle() -> Self {
        Self::new(Arc::new(NoWork), Arc::new(NoWork))
    }

    pub fn headers(&self) -> &dyn HeaderOracle {
        self.headers.as_ref()
    }

    pub fn blocks(&self) -> &dyn BlockOracle {
        self.blocks.as_ref()
    }

    /// Header work first; block work only when there is none
    pub fn request(&self, peer: PeerId) -> Job {
        if let Some(job) = self.headers.get_job(peer) {
            return Job::Headers(job);
        }
        match self.blocks.get_work(peer) {
            Some(batch) => Job::Blocks(batch),
            None => Job::None,
        }
    }

    /// Return unfinished work to its source
    pub fn release(&self, job: Job) {
        match job {
            Job::None => {}
            Job::Headers(job) => self.headers.abandon(job),
            Job::Blocks(batch) => self.blocks.abandon(batch),
        }
    }
}

impl fmt::Debug for JobSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSources").finish_non_exhaustive()
    }
}
