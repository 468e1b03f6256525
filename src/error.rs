//! The crate-wide error type and the error taxonomy it encodes.
//!
//! Errors are split along the same fault lines as the rest of the engine:
//! a `MalformedMetainfo` or `FileIo` error is fatal and aborts the torrent,
//! while per-peer and per-tracker failures are reported as [`crate::alert::Alert`]s
//! and never unwind past the task boundary that produced them.

use std::{fmt, io};

use crate::{metainfo, tracker::TrackerError};

/// The crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that may abort a torrent outright.
///
/// Per-peer and per-tracker failures are not represented here: they are
/// reported as alerts (see [`crate::alert::Alert`]) and handled by dropping the
/// offending peer or retrying the tracker on the next interval, as per the
/// error taxonomy.
#[derive(Debug)]
pub enum Error {
    /// The metainfo file could not be parsed, or failed its internal
    /// consistency checks (piece hash length not a multiple of 20, missing
    /// required keys, etc). Fatal: abort before any network IO.
    MalformedMetainfo(metainfo::Error),
    /// The tracker could not be reached on any configured announce URL, even
    /// after retries. Non-fatal during steady-state operation (the torrent
    /// simply retries on the next interval), but fatal if it occurs before
    /// a single peer endpoint has ever been obtained.
    TrackerUnreachable(TrackerError),
    /// The peer's handshake carried an info hash that didn't match ours, or
    /// the handshake frame was otherwise malformed.
    PeerHandshakeFailed,
    /// An IO error occurred on a peer connection.
    PeerIo(io::Error),
    /// An IO error occurred while reading or writing the backing file.
    FileIo(io::Error),
    /// The requested piece or file index is out of bounds for this torrent.
    InvalidPieceIndex,
    /// No peers are left to complete the download.
    NoPeersLeft,
    /// A command-line argument failed to parse into the type it's used as.
    InvalidArgument(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedMetainfo(e) => write!(f, "malformed metainfo: {}", e),
            Error::TrackerUnreachable(e) => write!(f, "tracker unreachable: {}", e),
            Error::PeerHandshakeFailed => write!(f, "peer handshake failed"),
            Error::PeerIo(e) => write!(f, "peer IO error: {}", e),
            Error::FileIo(e) => write!(f, "file IO error: {}", e),
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::NoPeersLeft => write!(f, "no peers left to complete download"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::MalformedMetainfo(e) => Some(e),
            Error::TrackerUnreachable(e) => Some(e),
            Error::PeerIo(e) => Some(e),
            Error::FileIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<metainfo::Error> for Error {
    fn from(e: metainfo::Error) -> Self {
        Error::MalformedMetainfo(e)
    }
}

impl From<TrackerError> for Error {
    fn from(e: TrackerError) -> Self {
        Error::TrackerUnreachable(e)
    }
}
