//! Block geometry: split a file into fixed-size blocks of fixed-size pieces.
//!
//! Every block but the last has the same geometry; the last block's size, piece count and
//! last-piece size are derived once from the file length.

use serde::{Deserialize, Serialize};

use crate::config::TransferConfig;

/// Byte range inside a storage region: offset plus length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Shape of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDetails {
    pub block_size: u64,
    pub nr_pieces: u32,
    pub default_piece_size: u32,
    pub last_piece_size: u32,
}

impl BlockDetails {
    pub fn piece_size(&self, piece: u32) -> Option<u32> {
        if piece >= self.nr_pieces {
            None
        } else if piece == self.nr_pieces - 1 {
            Some(self.last_piece_size)
        } else {
            Some(self.default_piece_size)
        }
    }

    /// Offset of `piece` inside the block.
    pub fn piece_offset(&self, piece: u32) -> u64 {
        piece as u64 * self.default_piece_size as u64
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("piece size must be non-zero")]
    ZeroPieceSize,
    #[error("pieces per block must be non-zero")]
    ZeroPiecesPerBlock,
    #[error("file of {file_len} bytes needs more than u32::MAX blocks of {block_size} bytes")]
    TooManyBlocks { file_len: u64, block_size: u64 },
}

/// Per-file block geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    file_len: u64,
    nr_blocks: u32,
    default_block: BlockDetails,
    last_block: BlockDetails,
}

impl BlockGeometry {
    pub fn new(file_len: u64, piece_size: u32, pieces_per_block: u32) -> Result<Self, GeometryError> {
        if piece_size == 0 {
            return Err(GeometryError::ZeroPieceSize);
        }
        if pieces_per_block == 0 {
            return Err(GeometryError::ZeroPiecesPerBlock);
        }
        let block_size = piece_size as u64 * pieces_per_block as u64;
        let default_block = BlockDetails {
            block_size,
            nr_pieces: pieces_per_block,
            default_piece_size: piece_size,
            last_piece_size: piece_size,
        };
        let nr_blocks = u32::try_from(file_len.div_ceil(block_size)).map_err(|_| {
            GeometryError::TooManyBlocks {
                file_len,
                block_size,
            }
        })?;
        let last_block = if nr_blocks == 0 {
            default_block
        } else {
            let last_size = file_len - (nr_blocks as u64 - 1) * block_size;
            let nr_pieces = last_size.div_ceil(piece_size as u64) as u32;
            BlockDetails {
                block_size: last_size,
                nr_pieces,
                default_piece_size: piece_size,
                last_piece_size: (last_size - (nr_pieces as u64 - 1) * piece_size as u64) as u32,
            }
        };
        Ok(Self {
            file_len,
            nr_blocks,
            default_block,
            last_block,
        })
    }

    pub fn from_config(file_len: u64, config: &TransferConfig) -> Result<Self, GeometryError> {
        Self::new(file_len, config.piece_size, config.pieces_per_block)
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn nr_blocks(&self) -> u32 {
        self.nr_blocks
    }

    pub fn block_size(&self) -> u64 {
        self.default_block.block_size
    }

    pub fn piece_size(&self) -> u32 {
        self.default_block.default_piece_size
    }

    pub fn block_details(&self, block: u32) -> Option<BlockDetails> {
        if block >= self.nr_blocks {
            None
        } else if block == self.nr_blocks - 1 {
            Some(self.last_block)
        } else {
            Some(self.default_block)
        }
    }

    /// File range covered by `block`.
    pub fn block_range(&self, block: u32) -> Option<ByteRange> {
        let details = self.block_details(block)?;
        Some(ByteRange::new(
            block as u64 * self.default_block.block_size,
            details.block_size,
        ))
    }

    /// File range covered by `piece` of `block`.
    pub fn piece_range(&self, block: u32, piece: u32) -> Option<ByteRange> {
        let block_range = self.block_range(block)?;
        let details = self.block_details(block)?;
        let size = details.piece_size(piece)?;
        Some(ByteRange::new(
            block_range.offset + details.piece_offset(piece),
            size as u64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_multiple_has_uniform_last_block() {
        let g = BlockGeometry::new(5 * 10 * 1024, 1024, 10).unwrap();
        assert_eq!(g.nr_blocks(), 5);
        assert_eq!(g.block_details(4), g.block_details(0));
        assert_eq!(g.block_range(4), Some(ByteRange::new(4 * 10240, 10240)));
    }

    #[test]
    fn irregular_last_block() {
        // 2 full blocks + 2500 bytes: last block has 3 pieces, last piece 452 bytes.
        let g = BlockGeometry::new(2 * 10240 + 2500, 1024, 10).unwrap();
        assert_eq!(g.nr_blocks(), 3);
        let last = g.block_details(2).unwrap();
        assert_eq!(last.block_size, 2500);
        assert_eq!(last.nr_pieces, 3);
        assert_eq!(last.last_piece_size, 452);
        assert_eq!(g.piece_range(2, 2), Some(ByteRange::new(20480 + 2048, 452)));
        assert_eq!(g.piece_range(2, 3), None);
    }

    #[test]
    fn zero_length_file() {
        let g = BlockGeometry::new(0, 1024, 10).unwrap();
        assert_eq!(g.nr_blocks(), 0);
        assert_eq!(g.block_details(0), None);
    }

    #[test]
    fn tiny_file_single_piece() {
        let g = BlockGeometry::new(10, 1024, 10).unwrap();
        assert_eq!(g.nr_blocks(), 1);
        let d = g.block_details(0).unwrap();
        assert_eq!((d.nr_pieces, d.last_piece_size), (1, 10));
    }

    #[test]
    fn rejects_zero_sizes() {
        assert_eq!(BlockGeometry::new(10, 0, 10), Err(GeometryError::ZeroPieceSize));
        assert_eq!(BlockGeometry::new(10, 1024, 0), Err(GeometryError::ZeroPiecesPerBlock));
    }

    #[test]
    fn max_indices_are_out_of_range() {
        let g = BlockGeometry::new(2 * 10240, 1024, 10).unwrap();
        assert_eq!(g.block_details(u32::MAX), None);
        assert_eq!(g.piece_range(u32::MAX, 0), None);
        assert_eq!(g.piece_range(0, u32::MAX), None);
        assert_eq!(g.block_details(0).unwrap().piece_size(u32::MAX), None);
    }

    #[test]
    fn rejects_block_count_beyond_u32() {
        assert_eq!(
            BlockGeometry::new(u64::MAX, 1, 1),
            Err(GeometryError::TooManyBlocks {
                file_len: u64::MAX,
                block_size: 1
            })
        );
        // u32::MAX blocks still fit.
        assert_eq!(BlockGeometry::new(u32::MAX as u64, 1, 1).unwrap().nr_blocks(), u32::MAX);
    }
}
