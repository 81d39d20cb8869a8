//! The piece manager: the actor that owns piece/block bookkeeping, the
//! per-peer bitfield map, the pending-request table, and exclusive access to
//! the output file.
//!
//! Mutation only ever happens inside [`PieceManager::run`], which processes
//! one command at a time to completion — this is what gives
//! `add_peer`/`update_peer`/`remove_peer`/`next_request`/`block_received`
//! the atomicity the concurrency model requires, without a lock, the same
//! way the teacher's `Disk` actor (`disk/io.rs`) serializes writes across
//! torrents behind a single command channel.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::error::StorageError;
use crate::metainfo::Torrent;
use crate::piece::{BlockInfo, Piece};
use crate::{Bitfield, PeerId, PieceIndex};

/// A request believed to be outstanding at some peer, tracked so it can be
/// reissued if it times out.
struct PendingBlock {
    piece_index: PieceIndex,
    offset: u32,
    added_at: Instant,
}

/// The commands `PieceManagerHandle` can send to the actor task.
pub enum Command {
    AddPeer {
        peer_id: PeerId,
        bitfield: Bitfield,
    },
    UpdatePeer {
        peer_id: PeerId,
        piece_index: PieceIndex,
    },
    RemovePeer {
        peer_id: PeerId,
    },
    NextRequest {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<BlockInfo>>,
    },
    BlockReceived {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
        reply: oneshot::Sender<()>,
    },
    /// Returns `(have_pieces, num_pieces)`, the coarse per-piece progress
    /// counter the coordinator uses to decide completion and to report
    /// `downloaded`/`left` on the next announce.
    Progress {
        reply: oneshot::Sender<(usize, usize)>,
    },
    Shutdown,
}

/// The cloneable handle every peer session holds to talk to the piece
/// manager actor. Mirrors the teacher's `DiskHandle`.
#[derive(Clone)]
pub struct PieceManagerHandle {
    cmd_chan: mpsc::UnboundedSender<Command>,
}

impl PieceManagerHandle {
    pub fn add_peer(&self, peer_id: PeerId, bitfield: Bitfield) {
        let _ = self.cmd_chan.send(Command::AddPeer { peer_id, bitfield });
    }

    pub fn update_peer(&self, peer_id: PeerId, piece_index: PieceIndex) {
        let _ = self.cmd_chan.send(Command::UpdatePeer {
            peer_id,
            piece_index,
        });
    }

    pub fn remove_peer(&self, peer_id: PeerId) {
        let _ = self.cmd_chan.send(Command::RemovePeer { peer_id });
    }

    pub async fn next_request(&self, peer_id: PeerId) -> Option<BlockInfo> {
        let (reply, reply_port) = oneshot::channel();
        self.cmd_chan
            .send(Command::NextRequest { peer_id, reply })
            .ok()?;
        reply_port.await.ok().flatten()
    }

    pub async fn block_received(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) {
        let (reply, reply_port) = oneshot::channel();
        if self
            .cmd_chan
            .send(Command::BlockReceived {
                piece_index,
                offset,
                data,
                reply,
            })
            .is_ok()
        {
            let _ = reply_port.await;
        }
    }

    /// Returns `(have_pieces, num_pieces)`. Returns `(0, 0)` if the actor has
    /// already shut down.
    pub async fn progress(&self) -> (usize, usize) {
        let (reply, reply_port) = oneshot::channel();
        if self.cmd_chan.send(Command::Progress { reply }).is_ok() {
            reply_port.await.unwrap_or((0, 0))
        } else {
            (0, 0)
        }
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_chan.send(Command::Shutdown);
    }
}

/// The piece manager actor. Owns all mutable download state and the output
/// file descriptor exclusively; there is exactly one of these per download.
pub struct PieceManager {
    piece_length: u32,
    total_size: u64,
    piece_hashes: Vec<crate::Sha1Hash>,
    missing_pieces: Vec<PieceIndex>,
    /// Scanned in insertion order by `next_request` step 3, so this must
    /// stay a `Vec`, not a `HashSet`.
    ongoing_pieces: Vec<Piece>,
    have_pieces: Vec<bool>,
    peers: HashMap<PeerId, Bitfield>,
    pending_blocks: Vec<PendingBlock>,
    max_pending: Duration,
    output_file: std::fs::File,
    cmd_port: mpsc::UnboundedReceiver<Command>,
}

impl PieceManager {
    /// Opens (creating if absent) the output file and returns the actor
    /// along with the handle to be cloned into every peer session.
    pub fn new(
        torrent: &Torrent,
        max_pending: Duration,
    ) -> Result<(Self, PieceManagerHandle), StorageError> {
        let output_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&torrent.output_path)
            .map_err(StorageError::Open)?;

        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let num_pieces = torrent.piece_count();
        let manager = Self {
            piece_length: torrent.piece_length,
            total_size: torrent.total_size,
            piece_hashes: torrent.piece_hashes.clone(),
            missing_pieces: (0..num_pieces).collect(),
            ongoing_pieces: Vec::new(),
            have_pieces: vec![false; num_pieces],
            peers: HashMap::new(),
            pending_blocks: Vec::new(),
            max_pending,
            output_file,
            cmd_port,
        };
        Ok((manager, PieceManagerHandle { cmd_chan }))
    }

    fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    fn piece_len(&self, index: PieceIndex) -> u32 {
        if index == self.num_pieces() - 1 {
            let full_pieces =
                (self.num_pieces() - 1) as u64 * self.piece_length as u64;
            (self.total_size - full_pieces) as u32
        } else {
            self.piece_length
        }
    }

    pub fn have_count(&self) -> usize {
        self.have_pieces.iter().filter(|&&b| b).count()
    }

    pub fn is_complete(&self) -> bool {
        self.have_count() == self.num_pieces()
    }

    /// Runs the actor's command loop to completion (until `Shutdown` or the
    /// channel closes).
    pub async fn run(&mut self) -> Result<(), StorageError> {
        log::info!("Starting piece manager event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::AddPeer { peer_id, bitfield } => {
                    self.peers.insert(peer_id, bitfield);
                }
                Command::UpdatePeer {
                    peer_id,
                    piece_index,
                } => {
                    if let Some(bitfield) = self.peers.get_mut(&peer_id) {
                        if piece_index < bitfield.len() {
                            bitfield.set(piece_index, true);
                        }
                    }
                }
                Command::RemovePeer { peer_id } => {
                    self.peers.remove(&peer_id);
                }
                Command::NextRequest { peer_id, reply } => {
                    let block = self.next_request(&peer_id);
                    let _ = reply.send(block);
                }
                Command::BlockReceived {
                    piece_index,
                    offset,
                    data,
                    reply,
                } => {
                    self.block_received(piece_index, offset, data).await?;
                    let _ = reply.send(());
                }
                Command::Progress { reply } => {
                    let _ = reply.send((self.have_count(), self.num_pieces()));
                }
                Command::Shutdown => {
                    log::info!("Shutting down piece manager event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Implements spec §4.4's five-step scheduling order.
    fn next_request(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        // Step 1: unknown peer.
        let bitfield = self.peers.get(peer_id)?.clone();

        // Step 2: re-issue a timed-out pending block the peer can serve.
        if let Some(block) = self.try_reissue(&bitfield) {
            return Some(block);
        }

        // Step 3: continue an ongoing piece the peer has.
        if let Some(block) = self.try_continue_ongoing(&bitfield) {
            return Some(block);
        }

        // Step 4: start a new piece (rarest-first) and retry step 3 once.
        if self.try_start_new_piece(&bitfield) {
            if let Some(block) = self.try_continue_ongoing(&bitfield) {
                return Some(block);
            }
        }

        // Step 5.
        None
    }

    fn try_reissue(&mut self, bitfield: &Bitfield) -> Option<BlockInfo> {
        let now = Instant::now();
        let max_pending = self.max_pending;
        let expired_pos = self.pending_blocks.iter().position(|pending| {
            now.duration_since(pending.added_at) > max_pending
                && has_piece(bitfield, pending.piece_index)
        })?;

        let pending = &mut self.pending_blocks[expired_pos];
        pending.added_at = now;
        let piece_index = pending.piece_index;
        let offset = pending.offset;

        let len = self
            .ongoing_pieces
            .iter()
            .find(|p| p.index == piece_index)
            .and_then(|p| {
                p.blocks.iter().find(|b| b.info.offset == offset)
            })
            .map(|b| b.info.len)?;
        Some(BlockInfo::new(piece_index, offset, len))
    }

    fn try_continue_ongoing(
        &mut self,
        bitfield: &Bitfield,
    ) -> Option<BlockInfo> {
        for piece in self.ongoing_pieces.iter_mut() {
            if !has_piece(bitfield, piece.index) {
                continue;
            }
            if let Some(info) = piece.first_missing().map(|b| b.info) {
                piece.mark_pending(info.offset);
                self.pending_blocks.push(PendingBlock {
                    piece_index: info.piece_index,
                    offset: info.offset,
                    added_at: Instant::now(),
                });
                return Some(info);
            }
        }
        None
    }

    fn try_start_new_piece(&mut self, bitfield: &Bitfield) -> bool {
        let best = self
            .missing_pieces
            .iter()
            .copied()
            .filter(|&index| has_piece(bitfield, index))
            .min_by_key(|&index| self.owner_count(index));
        let Some(best) = best else {
            return false;
        };

        self.missing_pieces.retain(|&index| index != best);
        let piece =
            Piece::new(best, self.piece_len(best), self.piece_hashes[best]);
        self.ongoing_pieces.push(piece);
        true
    }

    fn owner_count(&self, index: PieceIndex) -> usize {
        self.peers
            .values()
            .filter(|bitfield| has_piece(bitfield, index))
            .count()
    }

    /// Implements spec §4.5.
    async fn block_received(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.pending_blocks
            .retain(|p| !(p.piece_index == piece_index && p.offset == offset));

        let Some(piece_pos) = self
            .ongoing_pieces
            .iter()
            .position(|p| p.index == piece_index)
        else {
            log::debug!(
                "Ignoring stale block for piece {} not in ongoing_pieces",
                piece_index
            );
            return Ok(());
        };

        self.ongoing_pieces[piece_pos].receive(offset, data);

        if !self.ongoing_pieces[piece_pos].is_complete() {
            return Ok(());
        }

        let piece = self.ongoing_pieces.remove(piece_pos);
        let piece_length = self.piece_length as u64;

        let (piece, is_valid) = task::spawn_blocking(move || {
            let is_valid = piece.is_hash_matching();
            (piece, is_valid)
        })
        .await
        .expect("piece hash task panicked");

        if is_valid {
            let offset = piece.index as u64 * piece_length;
            let data = piece.data();
            write_at(&mut self.output_file, offset, &data)?;
            self.have_pieces[piece.index] = true;
            log::info!(
                "Piece {} verified and written ({}/{})",
                piece.index,
                self.have_count(),
                self.num_pieces()
            );
        } else {
            log::warn!(
                "Piece {} failed hash check (expected {}), resetting",
                piece.index,
                hex::encode(piece.hash)
            );
            let mut piece = piece;
            piece.reset();
            self.ongoing_pieces.push(piece);
        }

        Ok(())
    }
}

fn has_piece(bitfield: &Bitfield, index: PieceIndex) -> bool {
    index < bitfield.len() && bitfield[index]
}

fn write_at(
    file: &mut std::fs::File,
    offset: u64,
    data: &[u8],
) -> Result<(), StorageError> {
    file.seek(SeekFrom::Start(offset)).map_err(StorageError::Seek)?;
    file.write_all(data).map_err(StorageError::Write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::{BitVec, Msb0};

    fn full_bitfield(num_pieces: usize) -> Bitfield {
        BitVec::<Msb0, u8>::repeat(true, num_pieces)
    }

    fn manager_with_pieces(
        num_pieces: usize,
        piece_length: u32,
    ) -> (PieceManager, tempfile_path::TempPath) {
        let tmp = tempfile_path::TempPath::new();
        let torrent = Torrent {
            announce_url: "http://t".into(),
            piece_length,
            total_size: piece_length as u64 * num_pieces as u64,
            info_hash: [0u8; 20],
            piece_hashes: vec![[0u8; 20]; num_pieces],
            output_path: tmp.path().to_path_buf(),
        };
        let (manager, _handle) =
            PieceManager::new(&torrent, Duration::from_secs(60)).unwrap();
        (manager, tmp)
    }

    // Minimal scoped temp-file helper so these tests don't depend on an
    // external tempfile crate just for a throwaway output path.
    mod tempfile_path {
        use std::path::{Path, PathBuf};

        pub struct TempPath(PathBuf);

        impl TempPath {
            pub fn new() -> Self {
                let mut path = std::env::temp_dir();
                let unique = format!(
                    "bitleech-test-{:?}-{}",
                    std::thread::current().id(),
                    std::process::id()
                );
                path.push(unique);
                Self(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }
    }

    #[test]
    fn test_next_request_unknown_peer_returns_none() {
        let (mut manager, _tmp) = manager_with_pieces(2, REQUEST_SIZE_FOR_TEST);
        assert!(manager.next_request(&[1u8; 20]).is_none());
    }

    #[test]
    fn test_next_request_picks_rarest_first() {
        let (mut manager, _tmp) = manager_with_pieces(2, REQUEST_SIZE_FOR_TEST);
        let peer_a = [1u8; 20];
        let peer_b = [2u8; 20];

        // peer_a has both pieces, peer_b only has piece 1: piece 1 is
        // rarer (1 owner) and should be picked first when peer_a asks.
        manager.peers.insert(peer_a, full_bitfield(2));
        let mut only_piece_1 = BitVec::<Msb0, u8>::repeat(false, 2);
        only_piece_1.set(1, true);
        manager.peers.insert(peer_b, only_piece_1);

        let block = manager.next_request(&peer_a).unwrap();
        assert_eq!(block.piece_index, 1);
    }

    #[test]
    fn test_next_request_continues_ongoing_before_starting_new() {
        let (mut manager, _tmp) = manager_with_pieces(2, 2 * REQUEST_SIZE_FOR_TEST);
        let peer = [1u8; 20];
        manager.peers.insert(peer, full_bitfield(2));

        let first = manager.next_request(&peer).unwrap();
        assert_eq!(first.piece_index, 0);
        assert_eq!(first.offset, 0);

        // second block should still be piece 0 (continuing ongoing) rather
        // than starting piece 1.
        let second = manager.next_request(&peer).unwrap();
        assert_eq!(second.piece_index, 0);
        assert_eq!(second.offset, REQUEST_SIZE_FOR_TEST);
    }

    #[test]
    fn test_reissue_after_timeout() {
        let (mut manager, _tmp) = manager_with_pieces(1, REQUEST_SIZE_FOR_TEST);
        let peer = [1u8; 20];
        manager.peers.insert(peer, full_bitfield(1));

        let first = manager.next_request(&peer).unwrap();
        assert_eq!(first.offset, 0);

        // force the pending entry to look old
        manager.pending_blocks[0].added_at =
            Instant::now() - Duration::from_secs(61);
        manager.max_pending = Duration::from_secs(60);

        let reissued = manager.try_reissue(&full_bitfield(1)).unwrap();
        assert_eq!(reissued.piece_index, 0);
        assert_eq!(reissued.offset, 0);
    }

    const REQUEST_SIZE_FOR_TEST: u32 = crate::REQUEST_SIZE;
}
