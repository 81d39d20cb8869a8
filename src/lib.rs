//! A leech-only BitTorrent download core: tracker announces, peer wire
//! protocol, piece bookkeeping and disk persistence, tied together by a
//! download coordinator.
//!
//! Seeding, DHT, PEX and uTP are explicitly out of scope: this core drives a
//! swarm of outbound TCP peer connections against a single torrent's files
//! until every piece has been retrieved and hash-verified.

pub mod bencode;
pub mod conf;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod piece_manager;
pub mod torrent;
pub mod tracker;

use bitvec::prelude::{BitVec, Msb0};

/// The type of a piece's index.
pub type PieceIndex = usize;

/// An arbitrary 20 byte peer identifier.
///
/// Guidelines for choosing a peer ID: <http://bittorrent.org/beps/bep_0020.html>.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector ordered from most significant to least
/// significant bits, i.e. the first highest bit represents the first piece,
/// the second highest bit the second piece, and so on (e.g. `0b1100_0001`
/// means the peer has pieces 0, 1 and 7).
pub type Bitfield = BitVec<Msb0, u8>;

/// The unit of wire request: all blocks are this size except for possibly
/// the last block of the last piece.
pub const REQUEST_SIZE: u32 = 0x4000;

/// Returns the length of the block at `index` within a piece of length
/// `piece_len`.
///
/// # Panics
///
/// Panics if the index multiplied by [`REQUEST_SIZE`] would exceed the
/// piece length.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * REQUEST_SIZE;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, REQUEST_SIZE)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    (piece_len as usize + (REQUEST_SIZE as usize - 1)) / REQUEST_SIZE as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * REQUEST_SIZE;
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * REQUEST_SIZE + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), REQUEST_SIZE);
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 1), REQUEST_SIZE);

        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), REQUEST_SIZE);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 1), REQUEST_SIZE);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panic() {
        block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN_MULTIPLE_PIECE_LEN), 2);
        assert_eq!(block_count(UNEVEN_PIECE_LEN), 3);
    }

    // S3: piece_length=32768, total_size=98304 -> 3 pieces x 2 blocks of
    // 16384 each.
    #[test]
    fn test_block_layout_even() {
        let piece_len = 32768;
        assert_eq!(block_count(piece_len), 2);
        assert_eq!(block_len(piece_len, 0), REQUEST_SIZE);
        assert_eq!(block_len(piece_len, 1), REQUEST_SIZE);
    }

    // S4: piece_length=32768, total_size=40000 -> piece 0: 2 blocks of
    // 16384; piece 1 (the last, 40000 - 32768 = 7232 bytes): 1 block of
    // 7232.
    #[test]
    fn test_block_layout_last_piece_trim() {
        let last_piece_len = 40000 - 32768;
        assert_eq!(block_count(last_piece_len), 1);
        assert_eq!(block_len(last_piece_len, 0), last_piece_len);
    }
}
