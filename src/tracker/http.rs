//! The HTTP(S) tracker transport: a GET request with query parameters,
//! replied to with a bencoded dictionary (spec.md §4.2).
//!
//! Grounded on `examples/other_examples/0e004466_..._tracker-mod.rs.rs`, a
//! fork of this same teacher's own (otherwise missing from the retrieval
//! pack) tracker module: its `deserialize_peers` visitor and percent-encoding
//! `AsciiSet` are reused near-verbatim.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Url};
use serde::{de, Deserialize};

use super::{Announce, Event, Response, Result, TrackerError};

/// Percent-encode all non-alphanumeric bytes except `-._~`, matching the
/// conventional `info_hash`/`peer_id` encoding used by every tracker.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The bencoded shape of a tracker's HTTP announce reply.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "complete")]
    seeder_count: Option<usize>,
    #[serde(rename = "incomplete")]
    leecher_count: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_peers")]
    peers: Vec<SocketAddr>,
}

/// An HTTP tracker client bound to a single announce URL.
pub(crate) struct Tracker {
    client: Client,
    url: Url,
}

impl Tracker {
    pub fn new(url: Url) -> Self {
        Self { client: Client::new(), url }
    }

    pub async fn announce(&mut self, params: Announce) -> Result<Response> {
        let mut url = self.url.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair(
                "info_hash",
                &percent_encoding::percent_encode(&params.info_hash, URL_ENCODE_RESERVED)
                    .to_string(),
            );
            q.append_pair(
                "peer_id",
                &percent_encoding::percent_encode(&params.peer_id, URL_ENCODE_RESERVED)
                    .to_string(),
            );
            q.append_pair("port", &params.port.to_string());
            q.append_pair("uploaded", &params.uploaded.to_string());
            q.append_pair("downloaded", &params.downloaded.to_string());
            q.append_pair("left", &params.left.to_string());
            q.append_pair("compact", "1");
            if let Some(event) = params.event {
                let event_str = match event {
                    Event::Started => "started",
                    Event::Completed => "completed",
                    Event::Stopped => "stopped",
                };
                q.append_pair("event", event_str);
            }
        }

        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let raw: RawResponse = serde_bencode::from_bytes(&bytes)?;
        if let Some(reason) = raw.failure_reason {
            return Err(TrackerError::ProtocolMismatch.tap_log(&reason));
        }

        Ok(Response {
            interval: Duration::from_secs(raw.interval.unwrap_or(60 * 60)),
            peers: raw.peers,
            leecher_count: raw.leecher_count,
            seeder_count: raw.seeder_count,
        })
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http tracker {}", self.url)
    }
}

/// Deserializes either the compact peer string (6 bytes per peer: 4-byte
/// IPv4 + 2-byte port, both network order) or the dictionary form (a list
/// of `{ip, port}` maps), per spec.md §4.2.
fn deserialize_peers<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
            fmt.write_str("a compact peer string or a list of {ip, port} dicts")
        }

        fn visit_bytes<E>(self, mut b: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY: usize = 6;
            if b.len() % ENTRY != 0 {
                return Err(de::Error::custom("compact peers length must be a multiple of 6"));
            }
            let mut peers = Vec::with_capacity(b.len() / ENTRY);
            while !b.is_empty() {
                let ip = Ipv4Addr::from(b.get_u32());
                let port = b.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
            Ok(peers)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct Raw {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(Raw { ip, port }) = seq.next_element()? {
                match ip.parse() {
                    Ok(addr) => peers.push(SocketAddr::new(addr, port)),
                    Err(_) => log::warn!("tracker returned peer with invalid ip {:?}, skipping", ip),
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Small helper so a failure-reason string from the tracker ends up logged
/// before the error is handed back up, without adding a variant that would
/// need to own the string.
impl TrackerError {
    fn tap_log(self, reason: &str) -> Self {
        log::warn!("tracker announce failed: {}", reason);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    #[test]
    fn builds_client_for_http_url() {
        let url = Url::parse("http://tracker.example/announce").unwrap();
        let tracker = Tracker::new(url.clone());
        assert_eq!(format!("{}", tracker), format!("http tracker {}", url));
    }

    /// Spins up a loopback HTTP/1.0 server that replies with a bencoded,
    /// compact-peers announce response, exercising the real GET request and
    /// `deserialize_peers` end to end.
    #[tokio::test]
    async fn announces_and_parses_compact_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;

            let mut peer_bytes = Vec::new();
            peer_bytes.extend_from_slice(&Ipv4Addr::new(127, 0, 0, 1).octets());
            peer_bytes.extend_from_slice(&6881u16.to_be_bytes());

            let mut body = Vec::new();
            body.extend_from_slice(b"d8:intervali1800e5:peers");
            body.extend_from_slice(peer_bytes.len().to_string().as_bytes());
            body.push(b':');
            body.extend_from_slice(&peer_bytes);
            body.extend_from_slice(b"e");

            let response = format!(
                "HTTP/1.0 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
        });

        let url = Url::parse(&format!("http://{}/announce", addr)).unwrap();
        let mut tracker = Tracker::new(url);
        let response = tracker
            .announce(Announce {
                info_hash: [1u8; 20],
                peer_id: [2u8; 20],
                port: 6882,
                uploaded: 0,
                downloaded: 0,
                left: 1000,
                event: Some(Event::Started),
            })
            .await
            .unwrap();

        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(
            response.peers,
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881)]
        );

        server.await.unwrap();
    }
}
