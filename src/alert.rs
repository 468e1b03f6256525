//! The channel by which peer sessions, the tracker refresh task, and the
//! disk task report events back to the [`crate::torrent::Torrent`] coordinator
//! without unwinding a `Result` across a task boundary.
//!
//! This mirrors the teacher's own `Alert`/`TorrentAlert` mpsc pattern: rather
//! than propagating an error from a spawned task, the task sends an `Alert`
//! and returns normally. This is what keeps `TrackerUnreachable` and
//! `PeerIOError` non-fatal, exactly as required by the error taxonomy.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::{PieceIndex, TorrentId};

/// Sending half of the alert channel, held by every task that may need to
/// report an event to the torrent coordinator.
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
/// Receiving half of the alert channel, held exclusively by the torrent
/// coordinator's event loop.
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

/// Creates a new alert channel.
pub(crate) fn channel() -> (AlertSender, AlertReceiver) {
    mpsc::unbounded_channel()
}

/// Events reported asynchronously to the torrent coordinator.
#[derive(Debug)]
pub(crate) enum Alert {
    /// A piece has been downloaded, hashed, and found valid.
    PieceVerified { torrent_id: TorrentId, index: PieceIndex },
    /// All pieces have been verified. This is a signal, not an error: it
    /// triggers a `completed` tracker announce and the seed transition.
    DownloadComplete { torrent_id: TorrentId },
    /// A peer session ended, either due to an IO error, a failed handshake,
    /// or a graceful close. The coordinator removes the peer from its pool;
    /// if the peer had a piece in flight, the peer session itself is
    /// responsible for releasing it back to the scheduler before sending
    /// this alert.
    PeerDisconnected { addr: SocketAddr },
    /// The tracker could not be reached this interval. Non-fatal: the
    /// refresh task will retry on the next interval.
    TrackerUnreachable { reason: String },
}
