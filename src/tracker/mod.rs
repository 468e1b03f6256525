//! Tracker communication: one [`Client`] that dispatches to either the HTTP
//! or UDP transport based on the announce URL's scheme (spec.md §4.2).

mod http;
mod udp;

use std::{fmt, net::SocketAddr, time::Duration};

use url::Url;

use crate::{PeerId, Sha1Hash};

pub(crate) type Result<T> = std::result::Result<T, TrackerError>;

/// Errors that may occur while contacting a tracker, over either transport.
#[derive(Debug)]
pub enum TrackerError {
    Bencode(serde_bencode::Error),
    Http(reqwest::Error),
    Udp(std::io::Error),
    /// All UDP connect/announce retries were exhausted.
    UdpTimedOut,
    /// The URL's scheme is neither `http(s)://` nor `udp://`.
    UnsupportedScheme(String),
    /// A reply did not match the transaction we sent, or carried an
    /// unexpected action code.
    ProtocolMismatch,
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::Bencode(e) => write!(f, "bencode error: {}", e),
            TrackerError::Http(e) => write!(f, "HTTP error: {}", e),
            TrackerError::Udp(e) => write!(f, "UDP tracker I/O error: {}", e),
            TrackerError::UdpTimedOut => write!(f, "UDP tracker did not respond"),
            TrackerError::UnsupportedScheme(s) => write!(f, "unsupported tracker scheme: {}", s),
            TrackerError::ProtocolMismatch => write!(f, "tracker reply did not match our request"),
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrackerError::Bencode(e) => Some(e),
            TrackerError::Http(e) => Some(e),
            TrackerError::Udp(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_bencode::Error> for TrackerError {
    fn from(e: serde_bencode::Error) -> Self {
        TrackerError::Bencode(e)
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        TrackerError::Http(e)
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(e: std::io::Error) -> Self {
        TrackerError::Udp(e)
    }
}

/// The announce event, sent on the first, last, and (implicitly) every
/// periodic re-announce in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Started,
    Completed,
    Stopped,
}

/// The fields that go into every announce, common to both transports.
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
}

/// The tracker's reply, normalized across both transports.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Response {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
    pub leecher_count: Option<usize>,
    pub seeder_count: Option<usize>,
}

/// A tracker client bound to a single announce URL.
pub(crate) enum Client {
    Http(http::Tracker),
    Udp(udp::Tracker),
}

impl Client {
    /// Builds a client for `url`, picking the transport by scheme.
    ///
    /// `http://`/`https://` dispatch to the bencode-over-HTTP tracker
    /// protocol; `udp://` to the binary BEP 15 protocol. Any other scheme is
    /// rejected up front rather than failing lazily on the first announce.
    pub fn new(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|_| {
            TrackerError::UnsupportedScheme(url.to_string())
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(Client::Http(http::Tracker::new(parsed))),
            "udp" => Ok(Client::Udp(udp::Tracker::new(parsed)?)),
            other => Err(TrackerError::UnsupportedScheme(other.to_string())),
        }
    }

    pub async fn announce(&mut self, params: Announce) -> Result<Response> {
        match self {
            Client::Http(t) => t.announce(params).await,
            Client::Udp(t) => t.announce(params).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_by_scheme() {
        assert!(matches!(Client::new("http://tracker.example/announce"), Ok(Client::Http(_))));
        assert!(matches!(Client::new("udp://tracker.example:6969"), Ok(Client::Udp(_))));
        assert!(matches!(
            Client::new("ftp://tracker.example"),
            Err(TrackerError::UnsupportedScheme(_))
        ));
    }
}
