//! Cache-prefetch layer in front of a `HashGatedStore`.
//!
//! Peers downloading from us send stamped cache hints naming the blocks they are about to
//! request. The layer keeps exactly the hinted blocks in memory so piece reads for them never
//! touch the backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::geometry::BlockGeometry;
use crate::integrity::HashAlg;
use crate::store::{BlockStore, HashGatedStore, StorageBackend, StorageError, WriteOutcome};

/// Blocks a downloader expects to need soon. `stamp` increases by one per rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHint {
    pub stamp: u64,
    pub blocks: BTreeSet<u32>,
}

/// Who registered a hint. Reader hints come from peers reading through us and drive prefetch;
/// writer hints come from the local download side and only protect blocks from eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HintOwner {
    Reader(SocketAddr),
    Writer(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintOutcome {
    Accepted,
    /// Stamp not newer than the owner's current hint; ignored.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub prefetched: u64,
    pub cached_bytes: u64,
}

pub struct CachePrefetchLayer<S> {
    store: HashGatedStore<S>,
    hints: HashMap<HintOwner, CacheHint>,
    cached: BTreeMap<u32, Bytes>,
    stats: CacheStats,
}

impl<S: StorageBackend> CachePrefetchLayer<S> {
    pub fn new(store: HashGatedStore<S>) -> Self {
        Self {
            store,
            hints: HashMap::new(),
            cached: BTreeMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn store(&self) -> &HashGatedStore<S> {
        &self.store
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached_bytes: self.cached.values().map(|b| b.len() as u64).sum(),
            ..self.stats
        }
    }

    pub fn is_cached(&self, block: u32) -> bool {
        self.cached.contains_key(&block)
    }

    pub fn hint(&self, owner: &HintOwner) -> Option<&CacheHint> {
        self.hints.get(owner)
    }

    /// Register `hint` for `owner`, replacing its previous hint if the stamp is newer.
    pub fn set_hint(&mut self, owner: HintOwner, hint: CacheHint) -> Result<HintOutcome, StorageError> {
        if let Some(current) = self.hints.get(&owner) {
            if hint.stamp <= current.stamp {
                tracing::debug!(
                    ?owner,
                    stamp = hint.stamp,
                    current = current.stamp,
                    "stale cache hint ignored"
                );
                return Ok(HintOutcome::Stale);
            }
        }
        self.hints.insert(owner, hint);
        self.refresh()?;
        Ok(HintOutcome::Accepted)
    }

    /// Drop `owner`'s hint and every cached block no remaining hint covers.
    pub fn clear_hint(&mut self, owner: &HintOwner) {
        self.hints.remove(owner);
        let keep = self.hinted(|_| true);
        self.cached.retain(|block, _| keep.contains(block));
    }

    /// Drop every hint and the whole cache.
    pub fn clear_hints(&mut self) {
        self.hints.clear();
        self.cached.clear();
    }

    /// Load one present block ahead of any hint. It stays until the next hint change evicts it.
    pub fn prefetch(&mut self, block: u32) -> Result<bool, StorageError> {
        if self.cached.contains_key(&block) || !self.store.has_block(block) {
            return Ok(false);
        }
        let bytes = self.store.read_block(block)?;
        self.cached.insert(block, bytes);
        self.stats.prefetched += 1;
        Ok(true)
    }

    fn hinted(&self, select: impl Fn(&HintOwner) -> bool) -> BTreeSet<u32> {
        let nr_blocks = self.store.geometry().nr_blocks();
        self.hints
            .iter()
            .filter(|(owner, _)| select(owner))
            .flat_map(|(_, hint)| hint.blocks.iter().copied())
            .filter(|b| *b < nr_blocks)
            .collect()
    }

    fn is_reader_hinted(&self, block: u32) -> bool {
        self.hints
            .iter()
            .any(|(owner, hint)| matches!(owner, HintOwner::Reader(_)) && hint.blocks.contains(&block))
    }

    /// Evict blocks outside every hint, then load reader-hinted blocks the store has.
    fn refresh(&mut self) -> Result<(), StorageError> {
        let keep = self.hinted(|_| true);
        self.cached.retain(|block, _| keep.contains(block));
        let wanted = self.hinted(|owner| matches!(owner, HintOwner::Reader(_)));
        for block in wanted {
            self.prefetch(block)?;
        }
        Ok(())
    }
}

impl<S: StorageBackend> BlockStore for CachePrefetchLayer<S> {
    fn geometry(&self) -> &BlockGeometry {
        self.store.geometry()
    }

    fn hash_alg(&self) -> HashAlg {
        self.store.hash_alg()
    }

    fn has_block(&self, block: u32) -> bool {
        self.store.has_block(block)
    }

    fn has_hash(&self, block: u32) -> bool {
        self.store.has_hash(block)
    }

    fn is_complete(&self) -> bool {
        self.store.is_complete()
    }

    fn next_missing(&self, from: u32, count: usize, except: &BTreeSet<u32>) -> Vec<u32> {
        self.store.next_missing(from, count, except)
    }

    fn write_block(&mut self, block: u32, bytes: Bytes) -> Result<WriteOutcome, StorageError> {
        let outcome = self.store.write_block(block, bytes.clone())?;
        if matches!(outcome, WriteOutcome::Stored { .. }) && self.is_reader_hinted(block) {
            self.cached.insert(block, bytes);
        }
        Ok(outcome)
    }

    fn write_hash(&mut self, block: u32, hash: &[u8]) -> Result<(), StorageError> {
        self.store.write_hash(block, hash)
    }

    fn forget_hash(&mut self, block: u32) {
        self.store.forget_hash(block)
    }

    fn read_block(&mut self, block: u32) -> Result<Bytes, StorageError> {
        if let Some(bytes) = self.cached.get(&block) {
            self.stats.hits += 1;
            return Ok(bytes.clone());
        }
        self.stats.misses += 1;
        self.store.read_block(block)
    }

    fn read_piece(&mut self, block: u32, piece: u32) -> Result<Bytes, StorageError> {
        if let Some(bytes) = self.cached.get(&block) {
            let details = self
                .store
                .geometry()
                .block_details(block)
                .ok_or(StorageError::UnknownBlock(block))?;
            let size = details
                .piece_size(piece)
                .ok_or(StorageError::UnknownPiece { block, piece })?;
            let start = details.piece_offset(piece) as usize;
            self.stats.hits += 1;
            return Ok(bytes.slice(start..start + size as usize));
        }
        self.stats.misses += 1;
        self.store.read_piece(block, piece)
    }

    fn read_hash(&mut self, block: u32) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.read_hash(block)
    }
}
