//! Piece and block bookkeeping types.
//!
//! A [`Piece`] is a fixed-size contiguous chunk of the payload covered by a
//! single SHA-1 digest in the metainfo; a [`Block`] is the unit of wire
//! request, 16 KiB except possibly the last block of the last piece.

use sha1::{Digest, Sha1};

use crate::{block_count, block_len, PieceIndex, Sha1Hash, REQUEST_SIZE};

/// Identifies a block within a piece: which piece, what byte offset, and how
/// long it is. This is the payload of `Request`/`Cancel` wire messages and
/// the key by which pending requests and received data are tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: PieceIndex,
    /// Byte offset within the piece; always a multiple of `REQUEST_SIZE`.
    pub offset: u32,
    pub len: u32,
}

impl BlockInfo {
    pub fn new(piece_index: PieceIndex, offset: u32, len: u32) -> Self {
        Self {
            piece_index,
            offset,
            len,
        }
    }
}

/// The three states a block can be in over the course of a download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    Missing,
    Pending,
    Retrieved,
}

/// A single block-sized slot within a piece's write buffer.
#[derive(Clone, Debug)]
pub struct Block {
    pub info: BlockInfo,
    pub status: BlockStatus,
    /// Empty until `status` is `Retrieved`, at which point it holds exactly
    /// `info.len` bytes.
    pub data: Vec<u8>,
}

impl Block {
    fn missing(piece_index: PieceIndex, offset: u32, len: u32) -> Self {
        Self {
            info: BlockInfo::new(piece_index, offset, len),
            status: BlockStatus::Missing,
            data: Vec::new(),
        }
    }
}

/// An in-progress or completed piece: its expected hash and the ordered set
/// of blocks covering it.
#[derive(Clone, Debug)]
pub struct Piece {
    pub index: PieceIndex,
    pub hash: Sha1Hash,
    /// Ordered to cover `[0, piece_len)` contiguously; `blocks[i].info.offset
    /// == i * REQUEST_SIZE`.
    pub blocks: Vec<Block>,
}

impl Piece {
    pub fn new(index: PieceIndex, piece_len: u32, hash: Sha1Hash) -> Self {
        let blocks = (0..block_count(piece_len))
            .map(|i| {
                let offset = i as u32 * REQUEST_SIZE;
                Block::missing(index, offset, block_len(piece_len, i))
            })
            .collect();
        Self {
            index,
            hash,
            blocks,
        }
    }

    /// A piece is complete once every block has been retrieved.
    pub fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.status == BlockStatus::Retrieved)
    }

    /// The concatenation of all blocks' data in offset order. Only
    /// meaningful once [`Self::is_complete`].
    pub fn data(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            self.blocks.iter().map(|b| b.info.len as usize).sum(),
        );
        for block in &self.blocks {
            buf.extend_from_slice(&block.data);
        }
        buf
    }

    /// Hashes the concatenated block data and compares it against the
    /// expected hash. Only meaningful once [`Self::is_complete`].
    ///
    /// This does SHA-1 work proportional to the piece size and should be run
    /// off the executor thread.
    pub fn is_hash_matching(&self) -> bool {
        debug_assert!(self.is_complete());
        let mut hasher = Sha1::new();
        for block in &self.blocks {
            hasher.update(&block.data);
        }
        let digest = hasher.finalize();
        digest.as_slice() == self.hash
    }

    /// Moves every block back to `Missing`, discarding any retrieved data.
    /// Called after a hash mismatch so the piece can be re-requested.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.status = BlockStatus::Missing;
            block.data = Vec::new();
        }
    }

    /// Marks the block at `offset` as pending a request.
    pub fn mark_pending(&mut self, offset: u32) {
        if let Some(block) = self.block_at_mut(offset) {
            block.status = BlockStatus::Pending;
        }
    }

    /// Stores `data` for the block at `offset` and marks it retrieved.
    pub fn receive(&mut self, offset: u32, data: Vec<u8>) {
        if let Some(block) = self.block_at_mut(offset) {
            block.data = data;
            block.status = BlockStatus::Retrieved;
        }
    }

    /// The first block still missing, if any.
    pub fn first_missing(&self) -> Option<&Block> {
        self.blocks
            .iter()
            .find(|b| b.status == BlockStatus::Missing)
    }

    fn block_at_mut(&mut self, offset: u32) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.info.offset == offset)
    }
}
