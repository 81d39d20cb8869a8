//! The torrent descriptor: an immutable value extracted from a decoded
//! metainfo file.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::{
    bencode::{self, Value},
    error::MetainfoError,
    PieceIndex, Sha1Hash,
};

/// Length of a single piece SHA-1 entry in the `pieces` byte string.
const HASH_LEN: usize = 20;

/// An immutable value describing a single-file torrent, extracted from its
/// bencoded metainfo.
///
/// Constructed once at startup and read-only for the rest of the download.
#[derive(Clone, Debug)]
pub struct Torrent {
    pub announce_url: String,
    pub piece_length: u32,
    pub total_size: u64,
    /// SHA-1 of the bencoded `info` dictionary taken verbatim from the
    /// torrent file — *not* a canonical re-encoding of it, since some
    /// producers emit non-canonical bencode.
    pub info_hash: Sha1Hash,
    pub piece_hashes: Vec<Sha1Hash>,
    pub output_path: PathBuf,
}

impl Torrent {
    /// Parses a `.torrent` file's bytes and places the reconstructed
    /// payload at `output_path`.
    ///
    /// # Errors
    ///
    /// Returns [`MetainfoError`] if the file does not bdecode, is missing a
    /// required field, describes a multi-file torrent (out of scope for
    /// this core), or violates the piece/size invariant.
    pub fn from_bytes(
        data: &[u8],
        output_path: impl Into<PathBuf>,
    ) -> Result<Self, MetainfoError> {
        let root = bencode::decode(data)?;

        let announce = root
            .get(b"announce")
            .and_then(Value::as_bytes)
            .ok_or(MetainfoError::MissingField("announce"))?;
        let announce_url = String::from_utf8_lossy(announce).into_owned();

        let info_span = bencode::span_of_dict_value(data, b"info")?
            .ok_or(MetainfoError::MissingField("info"))?;
        let info_bytes = &data[info_span];
        let info_hash = sha1_of(info_bytes);

        let info = root
            .get(b"info")
            .ok_or(MetainfoError::MissingField("info"))?;

        if info.get(b"files").is_some() {
            return Err(MetainfoError::MultiFileUnsupported);
        }

        let piece_length = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .ok_or(MetainfoError::MissingField("info.piece length"))?;
        let piece_length = u32::try_from(piece_length)
            .map_err(|_| MetainfoError::InvalidFieldType("info.piece length"))?;

        let total_size = info
            .get(b"length")
            .and_then(Value::as_int)
            .ok_or(MetainfoError::MissingField("info.length"))?;
        let total_size = u64::try_from(total_size)
            .map_err(|_| MetainfoError::InvalidFieldType("info.length"))?;

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or(MetainfoError::MissingField("info.pieces"))?;
        if pieces.len() % HASH_LEN != 0 {
            return Err(MetainfoError::MalformedPieces(pieces.len()));
        }
        let piece_hashes: Vec<Sha1Hash> = pieces
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let torrent = Self {
            announce_url,
            piece_length,
            total_size,
            info_hash,
            piece_hashes,
            output_path: output_path.into(),
        };
        torrent.check_size_invariant()?;
        Ok(torrent)
    }

    /// Reads and parses a `.torrent` file from disk.
    pub fn from_file(
        torrent_path: impl AsRef<Path>,
        output_path: impl Into<PathBuf>,
    ) -> Result<Self, MetainfoError> {
        let data = std::fs::read(torrent_path)
            .map_err(|_| MetainfoError::MissingField("<file>"))?;
        Self::from_bytes(&data, output_path)
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// The length of the piece at `index`, accounting for the final piece
    /// possibly being shorter than [`Self::piece_length`].
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        if index == self.piece_count() - 1 {
            let full_pieces = (self.piece_count() - 1) as u64
                * self.piece_length as u64;
            (self.total_size - full_pieces) as u32
        } else {
            self.piece_length
        }
    }

    /// Validates the invariant from the data model:
    /// `(n-1) * piece_length < total_size <= n * piece_length`.
    fn check_size_invariant(&self) -> Result<(), MetainfoError> {
        let n = self.piece_count();
        if n == 0 {
            return Err(MetainfoError::InvalidSizeInvariant);
        }
        let piece_length = self.piece_length as u64;
        let lower = (n as u64 - 1) * piece_length;
        let upper = n as u64 * piece_length;
        if self.total_size > lower && self.total_size <= upper {
            Ok(())
        } else {
            Err(MetainfoError::InvalidSizeInvariant)
        }
    }
}

fn sha1_of(data: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(data);
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&digest);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn build_single_file_torrent(
        piece_length: i64,
        total_size: i64,
        pieces: &[u8],
    ) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), Value::Int(piece_length));
        info.insert(b"length".to_vec(), Value::Int(total_size));
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces.to_vec()));
        info.insert(b"name".to_vec(), Value::from("test.bin"));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            Value::from("http://tracker.example/announce"),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));
        bencode::encode(&Value::Dict(root))
    }

    #[test]
    fn test_parses_basic_fields() {
        let pieces = vec![7u8; 40]; // 2 fake piece hashes
        let data = build_single_file_torrent(32768, 40000, &pieces);
        let torrent = Torrent::from_bytes(&data, "/tmp/out").unwrap();
        assert_eq!(torrent.announce_url, "http://tracker.example/announce");
        assert_eq!(torrent.piece_length, 32768);
        assert_eq!(torrent.total_size, 40000);
        assert_eq!(torrent.piece_count(), 2);
    }

    // S4: piece_length=32768, total_size=40000 -> last piece is 7232 bytes.
    #[test]
    fn test_last_piece_len_trim() {
        let pieces = vec![7u8; 40];
        let data = build_single_file_torrent(32768, 40000, &pieces);
        let torrent = Torrent::from_bytes(&data, "/tmp/out").unwrap();
        assert_eq!(torrent.piece_len(0), 32768);
        assert_eq!(torrent.piece_len(1), 40000 - 32768);
    }

    #[test]
    fn test_info_hash_is_computed_from_raw_bytes_not_reencoded() {
        // Hand-build a non-canonical info dict: a key order that a
        // canonical BTreeMap-based re-encode would *not* reproduce, to
        // prove info_hash is taken from the verbatim slice.
        let info_bytes = b"d6:lengthi10e12:piece lengthi10e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        let mut data = b"d8:announce4:http4:info".to_vec();
        data.extend_from_slice(info_bytes);
        data.push(b'e');

        let torrent = Torrent::from_bytes(&data, "/tmp/out").unwrap();
        assert_eq!(torrent.info_hash, sha1_of(info_bytes));
    }

    #[test]
    fn test_malformed_pieces_length_rejected() {
        let data = build_single_file_torrent(10, 10, &[1, 2, 3]);
        assert!(matches!(
            Torrent::from_bytes(&data, "/tmp/out"),
            Err(MetainfoError::MalformedPieces(3))
        ));
    }

    #[test]
    fn test_multi_file_torrent_is_unsupported() {
        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), Value::Int(10));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 20]));
        info.insert(
            b"files".to_vec(),
            Value::List(vec![]),
        );
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), Value::from("http://t"));
        root.insert(b"info".to_vec(), Value::Dict(info));
        let data = bencode::encode(&Value::Dict(root));

        assert!(matches!(
            Torrent::from_bytes(&data, "/tmp/out"),
            Err(MetainfoError::MultiFileUnsupported)
        ));
    }
}
