//! This module defines types used to configure the download core and its
//! parts.

use std::time::Duration;

use crate::PeerId;

/// The default bitleech client id prefix, Azureus-style: `-PC0001-` followed
/// by 12 ASCII digits.
pub const DEFAULT_CLIENT_ID_PREFIX: &[u8; 8] = b"-PC0001-";

/// The global configuration for the download core.
#[derive(Clone, Debug)]
pub struct Conf {
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults.
    pub fn new() -> Self {
        Self {
            torrent: TorrentConf::new(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a torrent download.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The max number of connected peers the torrent should have.
    ///
    /// At most this many TCP sockets are open at once.
    pub max_peer_connections: usize,

    /// Default interval between announces, used when the tracker response
    /// doesn't specify one.
    pub announce_interval: Duration,

    /// A pending block request is considered lost and eligible for re-issue
    /// after this duration with no reply.
    pub max_pending_block_time: Duration,

    /// Size of the chunks read off the peer socket as they arrive. The
    /// per-peer receive buffer grows until a complete frame is parsed, then
    /// shrinks by the consumed prefix.
    pub read_chunk_size: usize,

    /// How long the coordinator sleeps between ticks when there is nothing
    /// else to do (no announce due, peer queue non-empty).
    pub idle_tick_interval: Duration,

    /// The port advertised to the tracker. Leech-only: nothing actually
    /// listens on it, but trackers expect a nonzero value.
    pub listen_port: u16,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults.
    pub fn new() -> Self {
        Self {
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_peer_connections: 40,
            announce_interval: Duration::from_secs(30 * 60),
            max_pending_block_time: Duration::from_secs(60),
            read_chunk_size: 10_240,
            idle_tick_interval: Duration::from_secs(5),
            listen_port: 6889,
        }
    }
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a fresh Azureus-style peer id: `-PC0001-` followed by 12 ASCII
/// digits drawn at random.
pub fn generate_peer_id() -> PeerId {
    use rand::Rng;

    let mut id = [0u8; 20];
    id[..8].copy_from_slice(DEFAULT_CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for slot in id[8..].iter_mut() {
        *slot = b'0' + rng.gen_range(0..10);
    }
    id
}
