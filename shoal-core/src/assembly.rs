//! Per-block piece accumulator.

use bytes::{Bytes, BytesMut};

use crate::geometry::BlockDetails;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PieceError {
    #[error("piece {piece} out of range (block has {nr_pieces} pieces)")]
    OutOfRange { piece: u32, nr_pieces: u32 },
    #[error("piece {piece} is {actual} bytes, expected {expected}")]
    BadLength {
        piece: u32,
        expected: u32,
        actual: usize,
    },
}

/// Collects the pieces of one block in any order.
#[derive(Debug)]
pub struct BlockAssemblyBuffer {
    details: BlockDetails,
    pieces: Vec<Option<Bytes>>,
    received: u32,
}

impl BlockAssemblyBuffer {
    pub fn new(details: BlockDetails) -> Self {
        Self {
            details,
            pieces: vec![None; details.nr_pieces as usize],
            received: 0,
        }
    }

    /// Store one piece. Writing the same index again replaces the bytes without double counting.
    pub fn write_piece(&mut self, piece: u32, bytes: Bytes) -> Result<(), PieceError> {
        let expected = self.details.piece_size(piece).ok_or(PieceError::OutOfRange {
            piece,
            nr_pieces: self.details.nr_pieces,
        })?;
        if bytes.len() != expected as usize {
            return Err(PieceError::BadLength {
                piece,
                expected,
                actual: bytes.len(),
            });
        }
        let slot = &mut self.pieces[piece as usize];
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(bytes);
        Ok(())
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        matches!(self.pieces.get(piece as usize), Some(Some(_)))
    }

    pub fn missing_pieces(&self) -> Vec<u32> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn nr_pieces(&self) -> u32 {
        self.details.nr_pieces
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.details.nr_pieces
    }

    /// Concatenate the pieces in order. Missing pieces are skipped, so only call once complete.
    pub fn into_bytes(self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.details.block_size as usize);
        for piece in self.pieces.into_iter().flatten() {
            out.extend_from_slice(&piece);
        }
        out.freeze()
    }
}
