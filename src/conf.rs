//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user. Generates a fresh, randomly suffixed client id (see
    /// [`EngineConf::new`]).
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::new(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The port on which the seeder listener accepts inbound connections
    /// once a torrent's download is complete.
    pub seed_port: u16,
}

impl EngineConf {
    /// Returns the default engine configuration: a randomly suffixed client
    /// id and the conventional BitTorrent seed port.
    pub fn new() -> Self {
        Self {
            client_id: generate_peer_id(),
            // the widely used, if not formally reserved, cratetorrent-style
            // default seeding port
            seed_port: 6886,
        }
    }
}

impl Default for EngineConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a peer id of the conventional Azureus-style shape: a two
/// letter client identifier and version, followed by random digits.
fn generate_peer_id() -> PeerId {
    use rand::Rng;
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-tk0001-");
    let mut rng = rand::thread_rng();
    for byte in id[8..].iter_mut() {
        *byte = rng.gen_range(b'0'..=b'9');
    }
    id
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents
/// by default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's file is placed upon download and
    /// from which it is seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we
    /// default to announcing every hour.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// The timeout for a single outbound peer connection attempt.
    pub connect_timeout: Duration,

    /// The number of additional times a `ConnectionRefused` outbound attempt
    /// is retried before the peer is dropped.
    pub max_connect_attempts: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a
            // waste of network round trip and it allows us to buffer up a
            // bit more than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,
            connect_timeout: Duration::from_secs(5),
            // 4 retries in addition to the first attempt, 5 total
            max_connect_attempts: 4,
        }
    }
}
