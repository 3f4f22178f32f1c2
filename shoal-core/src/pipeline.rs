//! Download-side block pipeline.
//!
//! Blocks move through four stages, each bounded:
//!
//! ```text
//! store.next_missing -> next_blocks -> cache_blocks -> work_blocks -> pending
//!                        candidates    hinted to the   hash asked   assembling
//!                                      peer's cache
//! ```
//!
//! `cache_pos`, `hash_pos` and `work_pos` are high-water marks of the last three stages, so
//! `work_pos <= hash_pos <= cache_pos` always holds and none of them ever moves back. A block
//! that fails verification goes back to the head of `work_blocks` without touching the cursors.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;

use crate::assembly::BlockAssemblyBuffer;
use crate::cache::CacheHint;
use crate::config::TransferConfig;
use crate::store::{BlockStore, StorageError, WriteOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Block verified and durably stored.
    Completed { block: u32, hash: Vec<u8> },
    /// Assembled block failed its hash check and will be fetched again.
    Rejected { block: u32 },
    /// Block admitted to assembly; its pieces are now queued.
    BlockRequested { block: u32, piece_count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursors {
    pub work_pos: u32,
    pub hash_pos: u32,
    pub cache_pos: u32,
}

pub struct BlockPipelineManager {
    max_pending: usize,
    hash_batch: usize,
    cache_lookahead: usize,
    next_blocks: VecDeque<u32>,
    cache_blocks: VecDeque<u32>,
    work_blocks: VecDeque<u32>,
    pending: BTreeMap<u32, BlockAssemblyBuffer>,
    next_hashes: VecDeque<u32>,
    work_hashes: BTreeSet<u32>,
    next_pieces: VecDeque<(u32, u32)>,
    cursors: Cursors,
    hint: CacheHint,
    hint_fresh: bool,
    events: Vec<PipelineEvent>,
    closed: bool,
}

impl BlockPipelineManager {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            max_pending: config.max_pending_blocks.max(1),
            hash_batch: config.hash_batch.max(1),
            cache_lookahead: config.cache_lookahead.max(config.max_pending_blocks).max(1),
            next_blocks: VecDeque::new(),
            cache_blocks: VecDeque::new(),
            work_blocks: VecDeque::new(),
            pending: BTreeMap::new(),
            next_hashes: VecDeque::new(),
            work_hashes: BTreeSet::new(),
            next_pieces: VecDeque::new(),
            cursors: Cursors::default(),
            hint: CacheHint::default(),
            hint_fresh: false,
            events: Vec::new(),
            closed: false,
        }
    }

    /// Advance blocks through the stages. Returns whether any piece or hash work is queued.
    pub fn work_available(&mut self, store: &impl BlockStore) -> bool {
        if self.closed {
            return false;
        }
        self.refill(store);

        while let Some(block) = self.next_blocks.pop_front() {
            self.cache_blocks.push_back(block);
            self.cursors.cache_pos = self.cursors.cache_pos.max(block + 1);
        }

        while self.work_blocks.len() + self.pending.len() < self.max_pending + self.hash_batch {
            let Some(block) = self.cache_blocks.pop_front() else {
                break;
            };
            if !store.has_hash(block) {
                self.queue_hash(block);
            }
            self.work_blocks.push_back(block);
            self.cursors.hash_pos = self.cursors.hash_pos.max(block + 1);
        }

        if self.next_pieces.is_empty() && self.pending.len() < self.max_pending {
            if let Some(block) = self.work_blocks.pop_front() {
                self.admit(store, block);
            }
        }

        self.rebuild_hint();
        !self.next_pieces.is_empty() || !self.next_hashes.is_empty()
    }

    fn refill(&mut self, store: &impl BlockStore) {
        let outstanding = self.next_blocks.len()
            + self.cache_blocks.len()
            + self.work_blocks.len()
            + self.pending.len();
        let room = self.cache_lookahead.saturating_sub(outstanding);
        if room == 0 {
            return;
        }
        let claimed = self.claimed();
        let fresh = store.next_missing(self.cursors.cache_pos, room, &claimed);
        self.next_blocks.extend(fresh);
    }

    fn admit(&mut self, store: &impl BlockStore, block: u32) {
        let Some(details) = store.geometry().block_details(block) else {
            return;
        };
        let buffer = BlockAssemblyBuffer::new(details);
        self.next_pieces
            .extend(buffer.missing_pieces().into_iter().map(|piece| (block, piece)));
        self.pending.insert(block, buffer);
        self.cursors.work_pos = self.cursors.work_pos.max(block + 1);
        tracing::debug!(block, piece_count = details.nr_pieces, "block admitted to assembly");
        self.events.push(PipelineEvent::BlockRequested {
            block,
            piece_count: details.nr_pieces,
        });
    }

    fn queue_hash(&mut self, block: u32) {
        if !self.next_hashes.contains(&block) && !self.work_hashes.contains(&block) {
            self.next_hashes.push_back(block);
        }
    }

    fn claimed(&self) -> BTreeSet<u32> {
        self.next_blocks
            .iter()
            .chain(self.cache_blocks.iter())
            .chain(self.work_blocks.iter())
            .chain(self.pending.keys())
            .copied()
            .collect()
    }

    fn is_claimed(&self, block: u32) -> bool {
        self.pending.contains_key(&block)
            || self.work_blocks.contains(&block)
            || self.cache_blocks.contains(&block)
            || self.next_blocks.contains(&block)
    }

    /// Next piece to request. Stale entries (block gone, piece already here) are skipped.
    pub fn next_piece(&mut self) -> Option<(u32, u32)> {
        while let Some((block, piece)) = self.next_pieces.pop_front() {
            match self.pending.get(&block) {
                Some(buffer) if !buffer.has_piece(piece) => return Some((block, piece)),
                _ => continue,
            }
        }
        None
    }

    /// Up to `hash_batch` block hashes to request. They count as in flight until answered or
    /// reset.
    pub fn next_hashes(&mut self, store: &impl BlockStore) -> Vec<u32> {
        let mut batch = Vec::new();
        while batch.len() < self.hash_batch {
            let Some(block) = self.next_hashes.pop_front() else {
                break;
            };
            if store.has_hash(block) || !self.is_claimed(block) {
                continue;
            }
            self.work_hashes.insert(block);
            batch.push(block);
        }
        batch
    }

    pub fn write_piece(
        &mut self,
        store: &mut impl BlockStore,
        block: u32,
        piece: u32,
        bytes: Bytes,
    ) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        let Some(buffer) = self.pending.get_mut(&block) else {
            tracing::debug!(block, piece, "piece for block not assembling ignored");
            return Ok(());
        };
        if let Err(e) = buffer.write_piece(piece, bytes) {
            tracing::debug!(block, piece, error = %e, "malformed piece ignored");
            if piece < buffer.nr_pieces() {
                self.next_pieces.push_back((block, piece));
            }
            return Ok(());
        }
        if buffer.is_complete() {
            self.try_commit(store, block)?;
        }
        Ok(())
    }

    pub fn write_hash(
        &mut self,
        store: &mut impl BlockStore,
        block: u32,
        hash: &[u8],
    ) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        self.work_hashes.remove(&block);
        if block >= store.geometry().nr_blocks() || store.has_hash(block) {
            return Ok(());
        }
        if hash.len() != store.hash_alg().hash_size() {
            tracing::debug!(block, len = hash.len(), "malformed hash ignored");
            if self.is_claimed(block) {
                self.queue_hash(block);
            }
            return Ok(());
        }
        store.write_hash(block, hash)?;
        if self.pending.get(&block).is_some_and(|b| b.is_complete()) {
            self.try_commit(store, block)?;
        }
        Ok(())
    }

    /// The peer has no hash for these blocks yet; ask again later.
    pub fn hash_missing(&mut self, store: &impl BlockStore, blocks: &[u32]) {
        self.reset_hashes(store, blocks);
    }

    /// Re-queue a piece request that timed out.
    pub fn reset_piece(&mut self, block: u32, piece: u32) {
        if self.closed {
            return;
        }
        if self.pending.get(&block).is_some_and(|b| !b.has_piece(piece)) {
            self.next_pieces.push_back((block, piece));
        }
    }

    /// Re-queue hash requests that timed out or came back empty.
    pub fn reset_hashes(&mut self, store: &impl BlockStore, blocks: &[u32]) {
        if self.closed {
            return;
        }
        for &block in blocks {
            self.work_hashes.remove(&block);
            if self.is_claimed(block) && !store.has_hash(block) {
                self.queue_hash(block);
            }
        }
    }

    fn try_commit(&mut self, store: &mut impl BlockStore, block: u32) -> Result<(), StorageError> {
        if !store.has_hash(block) {
            self.queue_hash(block);
            return Ok(());
        }
        let Some(buffer) = self.pending.remove(&block) else {
            return Ok(());
        };
        match store.write_block(block, buffer.into_bytes())? {
            WriteOutcome::Stored { hash } => {
                tracing::debug!(block, "block verified and stored");
                self.events.push(PipelineEvent::Completed { block, hash });
            }
            WriteOutcome::HashMissing => {
                self.work_blocks.push_front(block);
                self.queue_hash(block);
            }
            WriteOutcome::HashMismatch { expected, actual } => {
                tracing::warn!(
                    block,
                    expected = %hex(&expected),
                    actual = %hex(&actual),
                    "block failed verification, fetching again"
                );
                store.forget_hash(block);
                self.work_blocks.push_front(block);
                self.queue_hash(block);
                self.events.push(PipelineEvent::Rejected { block });
            }
        }
        self.rebuild_hint();
        Ok(())
    }

    fn rebuild_hint(&mut self) {
        let blocks: BTreeSet<u32> = self
            .pending
            .keys()
            .chain(self.work_blocks.iter())
            .chain(self.cache_blocks.iter())
            .copied()
            .collect();
        if blocks != self.hint.blocks {
            self.hint = CacheHint {
                stamp: self.hint.stamp + 1,
                blocks,
            };
            self.hint_fresh = true;
        }
    }

    /// The current hint, once per rebuild.
    pub fn take_cache_hint(&mut self) -> Option<CacheHint> {
        if !self.hint_fresh || self.closed {
            return None;
        }
        self.hint_fresh = false;
        Some(self.hint.clone())
    }

    pub fn take_events(&mut self) -> Vec<PipelineEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn cursors(&self) -> Cursors {
        self.cursors
    }

    pub fn pending_size(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_blocks(&self) -> Vec<u32> {
        self.pending.keys().copied().collect()
    }

    pub fn work_blocks(&self) -> Vec<u32> {
        self.work_blocks.iter().copied().collect()
    }

    pub fn cache_blocks(&self) -> Vec<u32> {
        self.cache_blocks.iter().copied().collect()
    }

    pub fn next_blocks(&self) -> Vec<u32> {
        self.next_blocks.iter().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release every buffer and queue. Later calls are no-ops.
    pub fn close(&mut self) {
        self.closed = true;
        self.next_blocks.clear();
        self.cache_blocks.clear();
        self.work_blocks.clear();
        self.pending.clear();
        self.next_hashes.clear();
        self.work_hashes.clear();
        self.next_pieces.clear();
        self.events.clear();
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BlockGeometry;
    use crate::integrity::{hash_block, HashAlg};
    use crate::store::{HashGatedStore, MemoryBackend};
    use rand::RngCore;

    const PIECE: usize = 1024;
    const BLOCK: usize = 10 * PIECE;

    struct Seeder {
        file: Vec<u8>,
    }

    impl Seeder {
        fn random(nr_blocks: usize) -> Self {
            let mut file = vec![0u8; nr_blocks * BLOCK];
            rand::thread_rng().fill_bytes(&mut file);
            Self { file }
        }

        fn piece(&self, block: u32, piece: u32) -> Bytes {
            let start = block as usize * BLOCK + piece as usize * PIECE;
            Bytes::copy_from_slice(&self.file[start..start + PIECE])
        }

        fn hash(&self, block: u32) -> Vec<u8> {
            let start = block as usize * BLOCK;
            hash_block(HashAlg::Sha256, &self.file[start..start + BLOCK])
        }
    }

    fn leecher(len: usize) -> HashGatedStore<MemoryBackend> {
        let geometry = BlockGeometry::new(len as u64, PIECE as u32, 10).unwrap();
        HashGatedStore::new(geometry, HashAlg::Sha256, MemoryBackend::new(len as u64)).unwrap()
    }

    fn check_invariants(p: &BlockPipelineManager) {
        let c = p.cursors();
        assert!(c.work_pos <= c.hash_pos && c.hash_pos <= c.cache_pos);
        for block in p.pending_blocks() {
            assert!(!p.work_blocks().contains(&block));
            assert!(!p.cache_blocks().contains(&block));
            assert!(!p.next_blocks().contains(&block));
        }
    }

    /// Serve every request the pipeline makes until it runs dry. `corrupt` replaces the hash
    /// answer for matching blocks on their first request.
    fn drive(
        p: &mut BlockPipelineManager,
        store: &mut HashGatedStore<MemoryBackend>,
        seeder: &Seeder,
        mut corrupt: impl FnMut(u32) -> Option<Vec<u8>>,
    ) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        let mut last = p.cursors();
        for _ in 0..10_000 {
            if !p.work_available(&*store) {
                break;
            }
            check_invariants(p);
            let c = p.cursors();
            assert!(c.work_pos >= last.work_pos && c.hash_pos >= last.hash_pos);
            assert!(c.cache_pos >= last.cache_pos);
            last = c;

            for block in p.next_hashes(&*store) {
                let hash = corrupt(block).unwrap_or_else(|| seeder.hash(block));
                p.write_hash(store, block, &hash).unwrap();
            }
            while let Some((block, piece)) = p.next_piece() {
                p.write_piece(store, block, piece, seeder.piece(block, piece)).unwrap();
            }
            events.extend(p.take_events());
        }
        events
    }

    #[test]
    fn downloads_every_block() {
        let seeder = Seeder::random(5);
        let mut store = leecher(5 * BLOCK);
        let mut p = BlockPipelineManager::new(&TransferConfig::default());
        let events = drive(&mut p, &mut store, &seeder, |_| None);

        let completed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Completed { block, hash } => Some((*block, hash.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(completed.len(), 5);
        for (block, hash) in completed {
            assert_eq!(hash, seeder.hash(block));
        }
        assert!(store.is_complete());
        assert_eq!(store.backend().as_slice(), &seeder.file[..]);
        assert_eq!(p.cursors(), Cursors { work_pos: 5, hash_pos: 5, cache_pos: 5 });
    }

    #[test]
    fn bad_hash_rejects_and_refetches() {
        let seeder = Seeder::random(5);
        let mut store = leecher(5 * BLOCK);
        let mut p = BlockPipelineManager::new(&TransferConfig::default());
        let mut poisoned = false;
        let events = drive(&mut p, &mut store, &seeder, |block| {
            if block == 2 && !poisoned {
                poisoned = true;
                return Some(vec![0xAA; 32]);
            }
            None
        });

        let for_block_2: Vec<_> = events
            .iter()
            .filter(|e| match e {
                PipelineEvent::Completed { block, .. }
                | PipelineEvent::Rejected { block }
                | PipelineEvent::BlockRequested { block, .. } => *block == 2,
            })
            .cloned()
            .collect();
        assert_eq!(
            for_block_2,
            vec![
                PipelineEvent::BlockRequested { block: 2, piece_count: 10 },
                PipelineEvent::Rejected { block: 2 },
                PipelineEvent::BlockRequested { block: 2, piece_count: 10 },
                PipelineEvent::Completed { block: 2, hash: seeder.hash(2) },
            ]
        );
        assert!(store.is_complete());
        assert_eq!(store.backend().as_slice(), &seeder.file[..]);
    }

    #[test]
    fn rejected_block_goes_to_head_of_work() {
        let seeder = Seeder::random(3);
        let mut store = leecher(3 * BLOCK);
        let config = TransferConfig {
            max_pending_blocks: 1,
            ..TransferConfig::default()
        };
        let mut p = BlockPipelineManager::new(&config);
        assert!(p.work_available(&store));
        assert_eq!(p.pending_blocks(), vec![0]);
        assert_eq!(p.next_hashes(&store), vec![0, 1, 2]);
        p.write_hash(&mut store, 0, &[1u8; 32]).unwrap();
        while let Some((block, piece)) = p.next_piece() {
            p.write_piece(&mut store, block, piece, seeder.piece(block, piece)).unwrap();
        }
        let before = p.cursors();
        assert_eq!(p.take_events().last(), Some(&PipelineEvent::Rejected { block: 0 }));
        assert_eq!(p.pending_size(), 0);
        assert_eq!(p.work_blocks(), vec![0, 1, 2]);
        assert!(!store.has_hash(0));
        assert_eq!(p.cursors(), before);

        assert!(p.work_available(&store));
        assert_eq!(p.pending_blocks(), vec![0]);
        assert_eq!(p.next_hashes(&store), vec![0]);
        check_invariants(&p);
    }

    #[test]
    fn pieces_before_hash_wait_for_it() {
        let seeder = Seeder::random(1);
        let mut store = leecher(BLOCK);
        let mut p = BlockPipelineManager::new(&TransferConfig::default());
        assert!(p.work_available(&store));
        while let Some((block, piece)) = p.next_piece() {
            p.write_piece(&mut store, block, piece, seeder.piece(block, piece)).unwrap();
        }
        assert_eq!(p.pending_size(), 1);
        assert!(!store.has_block(0));
        p.write_hash(&mut store, 0, &seeder.hash(0)).unwrap();
        assert!(store.has_block(0));
        assert!(matches!(p.take_events().last(), Some(PipelineEvent::Completed { block: 0, .. })));
    }

    #[test]
    fn duplicate_piece_is_idempotent() {
        let seeder = Seeder::random(1);
        let mut store = leecher(BLOCK);
        let mut p = BlockPipelineManager::new(&TransferConfig::default());
        p.work_available(&store);
        p.write_hash(&mut store, 0, &seeder.hash(0)).unwrap();
        for piece in 0..10 {
            p.write_piece(&mut store, 0, piece, seeder.piece(0, piece)).unwrap();
            p.write_piece(&mut store, 0, piece.min(8), seeder.piece(0, piece.min(8))).unwrap();
        }
        let completed = p
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, PipelineEvent::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
        // Late duplicate after completion is ignored.
        p.write_piece(&mut store, 0, 3, seeder.piece(0, 3)).unwrap();
        assert!(p.take_events().is_empty());
    }

    #[test]
    fn reset_piece_requeues_only_missing() {
        let seeder = Seeder::random(1);
        let mut store = leecher(BLOCK);
        let mut p = BlockPipelineManager::new(&TransferConfig::default());
        p.work_available(&store);
        let first = p.next_piece().unwrap();
        let second = p.next_piece().unwrap();
        p.write_piece(&mut store, second.0, second.1, seeder.piece(second.0, second.1)).unwrap();
        while p.next_piece().is_some() {}
        p.reset_piece(first.0, first.1);
        p.reset_piece(second.0, second.1);
        p.reset_piece(7, 0);
        assert_eq!(p.next_piece(), Some(first));
        assert_eq!(p.next_piece(), None);
    }

    #[test]
    fn hint_stamp_strictly_increases() {
        let seeder = Seeder::random(4);
        let mut store = leecher(4 * BLOCK);
        let config = TransferConfig {
            cache_lookahead: 2,
            max_pending_blocks: 1,
            ..TransferConfig::default()
        };
        let mut p = BlockPipelineManager::new(&config);
        let mut stamps = Vec::new();
        for _ in 0..100 {
            if !p.work_available(&store) {
                break;
            }
            if let Some(hint) = p.take_cache_hint() {
                assert!(hint.blocks.len() <= 2);
                stamps.push(hint.stamp);
            }
            assert!(p.take_cache_hint().is_none());
            for block in p.next_hashes(&store) {
                p.write_hash(&mut store, block, &seeder.hash(block)).unwrap();
            }
            while let Some((block, piece)) = p.next_piece() {
                p.write_piece(&mut store, block, piece, seeder.piece(block, piece)).unwrap();
            }
        }
        assert!(store.is_complete());
        assert_eq!(stamps.first(), Some(&1));
        assert!(stamps.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn resumes_around_present_blocks() {
        let seeder = Seeder::random(3);
        let mut store = leecher(3 * BLOCK);
        store.write_hash(1, &seeder.hash(1)).unwrap();
        let start = BLOCK;
        store
            .write_block(1, Bytes::copy_from_slice(&seeder.file[start..start + BLOCK]))
            .unwrap();
        let mut p = BlockPipelineManager::new(&TransferConfig::default());
        let events = drive(&mut p, &mut store, &seeder, |_| None);
        let requested: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::BlockRequested { block, .. } => Some(*block),
                _ => None,
            })
            .collect();
        assert_eq!(requested, vec![0, 2]);
        assert!(store.is_complete());
    }

    #[test]
    fn close_makes_everything_a_noop() {
        let seeder = Seeder::random(1);
        let mut store = leecher(BLOCK);
        let mut p = BlockPipelineManager::new(&TransferConfig::default());
        p.work_available(&store);
        p.close();
        assert!(!p.work_available(&store));
        p.write_hash(&mut store, 0, &seeder.hash(0)).unwrap();
        p.write_piece(&mut store, 0, 0, seeder.piece(0, 0)).unwrap();
        assert!(!store.has_hash(0));
        assert_eq!(p.pending_size(), 0);
        assert!(p.take_events().is_empty());
        assert!(p.take_cache_hint().is_none());
    }
}
