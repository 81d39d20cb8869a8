//! The download coordinator: ties the tracker client, the peer worker pool
//! and the piece manager together for a single torrent download.
//!
//! Grounded on the original Python `utils/client.py::TorrentClient.start`
//! (tick structure: completeness check, abort check, announce-due check,
//! idle sleep; queue replacement on a successful announce) re-expressed as
//! a pool of `tokio::spawn`ed peer session tasks pulling off a shared
//! address queue, the same worker-pool shape as the teacher's `Disk`
//! actor feeding block-write work to `spawn_blocking`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::conf::Conf;
use crate::error::{Error, Result};
use crate::metainfo::Torrent;
use crate::peer::{self, PeerSession};
use crate::piece_manager::PieceManager;
use crate::tracker::{Announce, Event, Tracker};
use crate::PeerId;

/// The shared work queue workers pull peer addresses from.
///
/// Unlike a plain `mpsc` channel, a successful announce must *replace* the
/// queue's contents outright rather than append to them — the original's
/// `_update_queue` drains then refills its `asyncio.Queue` for the same
/// reason. A `Mutex<VecDeque>` plus a `Notify` gives workers a blocking
/// `take()` without polling.
struct PeerQueue {
    addrs: Mutex<VecDeque<SocketAddr>>,
    notify: Notify,
}

impl PeerQueue {
    fn new() -> Self {
        Self {
            addrs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Discards whatever is queued and replaces it with `peers`.
    fn replace(&self, peers: Vec<SocketAddr>) {
        let mut addrs = self.addrs.lock().unwrap();
        addrs.clear();
        addrs.extend(peers);
        drop(addrs);
        self.notify.notify_waiters();
    }

    fn is_empty(&self) -> bool {
        self.addrs.lock().unwrap().is_empty()
    }

    /// Blocks until an address is available, then returns one.
    ///
    /// The `Notified` future must be registered as a waiter *before* the
    /// queue is checked, not after: `notify_waiters` (used by `replace`)
    /// only wakes futures already polled once, and stores no permit for one
    /// created but not yet polled. Without `enable()`, a `replace()` landing
    /// between the `pop_front()` check and the `.await` below would be
    /// missed, leaving this worker blocked until the *next* `replace()`
    /// call instead of the one that just happened.
    async fn take(&self) -> SocketAddr {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(addr) = self.addrs.lock().unwrap().pop_front() {
                return addr;
            }
            notified.await;
        }
    }
}

/// Downloads `torrent` according to `conf`, blocking until every piece has
/// been retrieved and hash-verified.
///
/// This is the single entry point a CLI wrapper needs: construct a
/// [`Torrent`] from a `.torrent` file, then call this.
pub async fn download(
    torrent: Torrent,
    conf: Conf,
    local_peer_id: PeerId,
) -> Result<()> {
    let info_hash = torrent.info_hash;
    let total_size = torrent.total_size;
    let piece_length = torrent.piece_length as u64;

    log::info!(
        "Starting download for info_hash {}, {} pieces, {} bytes",
        hex::encode(info_hash),
        torrent.piece_count(),
        total_size
    );

    let (mut piece_manager, piece_manager_handle) =
        PieceManager::new(&torrent, conf.torrent.max_pending_block_time)
            .map_err(Error::Storage)?;
    let piece_manager_task: JoinHandle<_> =
        tokio::spawn(async move { piece_manager.run().await });

    let queue = Arc::new(PeerQueue::new());
    let tracker = Tracker::new(torrent.announce_url.clone());

    // One shutdown-command slot per worker, holding the `Sender` half of
    // whichever session that worker is currently driving (`None` between
    // connections). `stop()` per spec §4.6/§5 sends `Command::Shutdown`
    // through these so a running session can flush/close its writer and
    // release its piece-manager registration on its own, before the task
    // is hard-aborted as a backstop for workers blocked on `queue.take()`.
    let worker_senders: Vec<Arc<Mutex<Option<peer::Sender>>>> =
        (0..conf.torrent.max_peer_connections)
            .map(|_| Arc::new(Mutex::new(None)))
            .collect();

    let worker_handles: Vec<JoinHandle<()>> = worker_senders
        .iter()
        .map(|slot| {
            let queue = queue.clone();
            let piece_manager_handle = piece_manager_handle.clone();
            let slot = slot.clone();
            let read_chunk_size = conf.torrent.read_chunk_size;
            tokio::spawn(async move {
                loop {
                    let addr = queue.take().await;
                    let (mut session, cmd_chan) = PeerSession::outbound(
                        addr,
                        info_hash,
                        local_peer_id,
                        piece_manager_handle.clone(),
                        read_chunk_size,
                    );
                    *slot.lock().unwrap() = Some(cmd_chan);
                    if let Err(e) = session.start().await {
                        log::debug!("Peer session with {} ended: {}", addr, e);
                    }
                    *slot.lock().unwrap() = None;
                }
            })
        })
        .collect();

    let mut last_announce: Option<Instant> = None;
    let mut last_response: Option<crate::tracker::Response> = None;

    loop {
        let (have, total) = piece_manager_handle.progress().await;
        if total > 0 && have == total {
            log::info!("Torrent fully downloaded");
            announce_completion(
                &tracker,
                info_hash,
                local_peer_id,
                conf.torrent.listen_port,
                total_size,
            )
            .await;
            break;
        }

        let interval =
            last_response.as_ref().map(|r| r.interval).unwrap_or(conf.torrent.announce_interval);
        let announce_due = match last_announce {
            None => true,
            Some(at) => at.elapsed() >= interval,
        };

        if announce_due {
            let downloaded = have as u64 * piece_length;
            let left = total_size.saturating_sub(downloaded);
            let announce = Announce {
                info_hash,
                peer_id: local_peer_id,
                port: conf.torrent.listen_port,
                uploaded: 0,
                downloaded,
                left,
                event: if last_announce.is_none() {
                    Some(Event::Started)
                } else {
                    None
                },
            };
            match tracker.announce(&announce).await {
                Ok(response) => {
                    log::info!(
                        "Tracker returned {} peers, next announce in {:?}",
                        response.peers.len(),
                        response.interval
                    );
                    queue.replace(response.peers.clone());
                    last_response = Some(response);
                    last_announce = Some(Instant::now());
                }
                Err(e) => {
                    log::warn!("Tracker announce failed, retrying next tick: {}", e);
                }
            }
        } else if queue.is_empty() {
            if let Some(response) = &last_response {
                queue.replace(response.peers.clone());
            }
            tokio::time::sleep(conf.torrent.idle_tick_interval).await;
        } else {
            tokio::time::sleep(conf.torrent.idle_tick_interval).await;
        }
    }

    for slot in &worker_senders {
        if let Some(cmd_chan) = slot.lock().unwrap().as_ref() {
            let _ = cmd_chan.send(peer::Command::Shutdown);
        }
    }
    // Gives a session that just received Shutdown a chance to run its own
    // cleanup path before the hard abort below, which is still needed as a
    // backstop for workers currently blocked on `queue.take()`.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for handle in worker_handles {
        handle.abort();
    }
    piece_manager_handle.shutdown();
    let _ = piece_manager_task.await;

    Ok(())
}

async fn announce_completion(
    tracker: &Tracker,
    info_hash: crate::Sha1Hash,
    peer_id: PeerId,
    port: u16,
    total_size: u64,
) {
    let announce = Announce {
        info_hash,
        peer_id,
        port,
        uploaded: 0,
        downloaded: total_size,
        left: 0,
        event: Some(Event::Completed),
    };
    if let Err(e) = tracker.announce(&announce).await {
        log::debug!("Completion announce failed (non-fatal): {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peer_queue_replace_discards_stale_entries() {
        let queue = PeerQueue::new();
        queue.replace(vec![
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        ]);
        queue.replace(vec!["127.0.0.1:3".parse().unwrap()]);

        let addr = queue.take().await;
        assert_eq!(addr, "127.0.0.1:3".parse().unwrap());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_peer_queue_take_blocks_until_replace() {
        let queue = std::sync::Arc::new(PeerQueue::new());
        assert!(queue.is_empty());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };

        // give the waiter a chance to register interest before we push.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.replace(vec!["127.0.0.1:9".parse().unwrap()]);

        let addr = waiter.await.unwrap();
        assert_eq!(addr, "127.0.0.1:9".parse().unwrap());
    }
}
