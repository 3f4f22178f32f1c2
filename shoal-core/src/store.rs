//! Hash-gated block storage.
//!
//! A block only reaches the durable backend after its bytes hash to the block's known hash.
//! Hashes live in their own region, so knowing a block's hash and having the block are separate
//! facts.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::geometry::{BlockGeometry, ByteRange};
use crate::integrity::{hash_block, verify_block, HashAlg};
use crate::tracker::ComponentTracker;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("range {offset}+{len} outside backend of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("backend holds {actual} bytes, file needs {expected}")]
    BackendTooSmall { expected: u64, actual: u64 },
    #[error("block {0} out of range")]
    UnknownBlock(u32),
    #[error("piece {piece} of block {block} out of range")]
    UnknownPiece { block: u32, piece: u32 },
    #[error("block {0} not stored")]
    BlockMissing(u32),
    #[error("block {block} is {actual} bytes, expected {expected}")]
    BadBlockLength {
        block: u32,
        expected: u64,
        actual: usize,
    },
    #[error("hash for block {block} is {actual} bytes, expected {expected}")]
    BadHashLength {
        block: u32,
        expected: usize,
        actual: usize,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable byte region.
pub trait StorageBackend {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, range: ByteRange) -> Result<Bytes, StorageError>;

    fn write(&mut self, range: ByteRange, data: &[u8]) -> Result<(), StorageError>;
}

/// In-memory backend, for tests and for the hash region.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Vec<u8>,
}

impl MemoryBackend {
    pub fn new(len: u64) -> Self {
        Self {
            data: vec![0; len as usize],
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn check(&self, range: ByteRange) -> Result<(usize, usize), StorageError> {
        if range.end() > self.data.len() as u64 {
            return Err(StorageError::OutOfBounds {
                offset: range.offset,
                len: range.len,
                size: self.data.len() as u64,
            });
        }
        Ok((range.offset as usize, range.end() as usize))
    }
}

impl StorageBackend for MemoryBackend {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self, range: ByteRange) -> Result<Bytes, StorageError> {
        let (start, end) = self.check(range)?;
        Ok(Bytes::copy_from_slice(&self.data[start..end]))
    }

    fn write(&mut self, range: ByteRange, data: &[u8]) -> Result<(), StorageError> {
        let (start, end) = self.check(range)?;
        if data.len() != end - start {
            return Err(StorageError::OutOfBounds {
                offset: range.offset,
                len: data.len() as u64,
                size: range.len,
            });
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// Result of offering an assembled block to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Verified and written.
    Stored { hash: Vec<u8> },
    /// No hash known for the block yet; nothing written.
    HashMissing,
    /// Bytes do not match the known hash; nothing written.
    HashMismatch { expected: Vec<u8>, actual: Vec<u8> },
}

/// Block-level access shared by the plain store and the cache layer in front of it.
pub trait BlockStore {
    fn geometry(&self) -> &BlockGeometry;
    fn hash_alg(&self) -> HashAlg;
    fn has_block(&self, block: u32) -> bool;
    fn has_hash(&self, block: u32) -> bool;
    fn is_complete(&self) -> bool;
    fn next_missing(&self, from: u32, count: usize, except: &BTreeSet<u32>) -> Vec<u32>;
    fn write_block(&mut self, block: u32, bytes: Bytes) -> Result<WriteOutcome, StorageError>;
    fn write_hash(&mut self, block: u32, hash: &[u8]) -> Result<(), StorageError>;
    fn forget_hash(&mut self, block: u32);
    fn read_block(&mut self, block: u32) -> Result<Bytes, StorageError>;
    fn read_piece(&mut self, block: u32, piece: u32) -> Result<Bytes, StorageError>;
    /// Known hash of `block`. Computed and persisted on demand when only the block is present.
    fn read_hash(&mut self, block: u32) -> Result<Option<Vec<u8>>, StorageError>;
}

pub struct HashGatedStore<S> {
    geometry: BlockGeometry,
    alg: HashAlg,
    data: S,
    hashes: MemoryBackend,
    blocks: ComponentTracker,
    known_hashes: ComponentTracker,
}

impl<S: StorageBackend> HashGatedStore<S> {
    /// Store for a file being downloaded: every block missing, no hash known.
    pub fn new(geometry: BlockGeometry, alg: HashAlg, data: S) -> Result<Self, StorageError> {
        if data.len() < geometry.file_len() {
            return Err(StorageError::BackendTooSmall {
                expected: geometry.file_len(),
                actual: data.len(),
            });
        }
        let nr_blocks = geometry.nr_blocks();
        Ok(Self {
            geometry,
            alg,
            data,
            hashes: MemoryBackend::new(nr_blocks as u64 * alg.hash_size() as u64),
            blocks: ComponentTracker::new(nr_blocks),
            known_hashes: ComponentTracker::new(nr_blocks),
        })
    }

    /// Store over a complete local copy. Hashes are computed lazily on first read.
    pub fn seeded(geometry: BlockGeometry, alg: HashAlg, data: S) -> Result<Self, StorageError> {
        let mut store = Self::new(geometry, alg, data)?;
        store.blocks = ComponentTracker::full(geometry.nr_blocks());
        Ok(store)
    }

    pub fn backend(&self) -> &S {
        &self.data
    }

    pub fn present_blocks(&self) -> u32 {
        self.blocks.present()
    }

    fn hash_range(&self, block: u32) -> ByteRange {
        let size = self.alg.hash_size() as u64;
        ByteRange::new(block as u64 * size, size)
    }

    fn block_range(&self, block: u32) -> Result<ByteRange, StorageError> {
        self.geometry
            .block_range(block)
            .ok_or(StorageError::UnknownBlock(block))
    }
}

impl<S: StorageBackend> BlockStore for HashGatedStore<S> {
    fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    fn hash_alg(&self) -> HashAlg {
        self.alg
    }

    fn has_block(&self, block: u32) -> bool {
        self.blocks.has_component(block)
    }

    fn has_hash(&self, block: u32) -> bool {
        self.known_hashes.has_component(block)
    }

    fn is_complete(&self) -> bool {
        self.blocks.is_complete()
    }

    fn next_missing(&self, from: u32, count: usize, except: &BTreeSet<u32>) -> Vec<u32> {
        self.blocks.next_component_missing(from, count, except)
    }

    fn write_block(&mut self, block: u32, bytes: Bytes) -> Result<WriteOutcome, StorageError> {
        let range = self.block_range(block)?;
        if bytes.len() as u64 != range.len {
            return Err(StorageError::BadBlockLength {
                block,
                expected: range.len,
                actual: bytes.len(),
            });
        }
        if !self.has_hash(block) {
            return Ok(WriteOutcome::HashMissing);
        }
        let expected = self.hashes.read(self.hash_range(block))?.to_vec();
        if !verify_block(self.alg, &bytes, &expected) {
            let actual = hash_block(self.alg, &bytes);
            return Ok(WriteOutcome::HashMismatch { expected, actual });
        }
        self.data.write(range, &bytes)?;
        self.blocks.add_component(block);
        Ok(WriteOutcome::Stored { hash: expected })
    }

    fn write_hash(&mut self, block: u32, hash: &[u8]) -> Result<(), StorageError> {
        if block >= self.geometry.nr_blocks() {
            return Err(StorageError::UnknownBlock(block));
        }
        if hash.len() != self.alg.hash_size() {
            return Err(StorageError::BadHashLength {
                block,
                expected: self.alg.hash_size(),
                actual: hash.len(),
            });
        }
        self.hashes.write(self.hash_range(block), hash)?;
        self.known_hashes.add_component(block);
        Ok(())
    }

    fn forget_hash(&mut self, block: u32) {
        self.known_hashes.remove_component(block);
    }

    fn read_block(&mut self, block: u32) -> Result<Bytes, StorageError> {
        let range = self.block_range(block)?;
        if !self.has_block(block) {
            return Err(StorageError::BlockMissing(block));
        }
        self.data.read(range)
    }

    fn read_piece(&mut self, block: u32, piece: u32) -> Result<Bytes, StorageError> {
        let range = self
            .geometry
            .piece_range(block, piece)
            .ok_or(StorageError::UnknownPiece { block, piece })?;
        if !self.has_block(block) {
            return Err(StorageError::BlockMissing(block));
        }
        self.data.read(range)
    }

    fn read_hash(&mut self, block: u32) -> Result<Option<Vec<u8>>, StorageError> {
        if block >= self.geometry.nr_blocks() {
            return Err(StorageError::UnknownBlock(block));
        }
        if self.has_hash(block) {
            return Ok(Some(self.hashes.read(self.hash_range(block))?.to_vec()));
        }
        if !self.has_block(block) {
            return Ok(None);
        }
        let bytes = self.read_block(block)?;
        let hash = hash_block(self.alg, &bytes);
        self.write_hash(block, &hash)?;
        Ok(Some(hash))
    }
}
