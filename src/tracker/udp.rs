//! The UDP tracker transport (BEP 15): a two-step Connect/Announce exchange
//! over raw fixed-width big-endian binary frames, not bencode (spec.md §4.2).
//!
//! Grounded on the struct vocabulary of
//! `examples/jsondevers-bobby-bit/src/tracker/udp.rs`
//! (`ConnectRequest`/`ConnectResponse`/`AnnounceRequest`/`AnnounceResponse`,
//! `UDP_TRACKER_PROTOCOL_ID`), but the wire codec itself is hand-rolled with
//! `bytes::{Buf, BufMut}` over raw fields: `examples/original_source/tracker.py`'s
//! `struct.pack(">QII...")` confirms this is fixed binary, not a bencoded
//! struct the way that reference crate (mis)encodes it.

use std::{net::SocketAddr, time::Duration};

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use url::Url;

use super::{Announce, Event, Response, Result, TrackerError};

/// BEP 15's magic connect-request protocol id.
const PROTOCOL_ID: u64 = 0x0000_0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// Number of times a Connect or Announce request is resent (with the same
/// transaction id) before the tracker is considered unreachable.
const MAX_ATTEMPTS: u32 = 4;

/// A UDP tracker client bound to a single announce URL. Unlike the HTTP
/// transport, every announce first (re)establishes a connection id, since
/// the socket is datagram-oriented and carries no session state of its own.
pub(crate) struct Tracker {
    addr: SocketAddr,
}

impl Tracker {
    pub fn new(url: Url) -> Result<Self> {
        let host = url.host_str().ok_or(TrackerError::ProtocolMismatch)?;
        let port = url.port().ok_or(TrackerError::ProtocolMismatch)?;
        let addr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| TrackerError::ProtocolMismatch)?;
        Ok(Self { addr })
    }

    pub async fn announce(&mut self, params: Announce) -> Result<Response> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.addr).await?;

        let connection_id = self.connect(&socket).await?;
        self.do_announce(&socket, connection_id, params).await
    }

    /// Step 1 of BEP 15: exchange a random transaction id for a connection
    /// id, retrying on transaction mismatch or timeout.
    async fn connect(&self, socket: &UdpSocket) -> Result<u64> {
        for n in 0..=MAX_ATTEMPTS {
            let transaction_id: u32 = rand::thread_rng().gen();

            let mut req = BytesMut::with_capacity(16);
            req.put_u64(PROTOCOL_ID);
            req.put_u32(ACTION_CONNECT);
            req.put_u32(transaction_id);
            socket.send(&req).await?;

            let mut buf = [0u8; 16];
            let reply = match tokio::time::timeout(
                attempt_timeout(n),
                socket.recv(&mut buf),
            )
            .await
            {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => continue,
            };

            if reply < 16 {
                continue;
            }
            let mut body = &buf[..reply];
            let action = body.get_u32();
            let got_transaction_id = body.get_u32();
            let connection_id = body.get_u64();

            if action != ACTION_CONNECT || got_transaction_id != transaction_id {
                continue;
            }
            return Ok(connection_id);
        }
        Err(TrackerError::UdpTimedOut)
    }

    /// Step 2 of BEP 15: the actual announce, carrying the connection id
    /// obtained above.
    async fn do_announce(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        params: Announce,
    ) -> Result<Response> {
        for n in 0..=MAX_ATTEMPTS {
            let transaction_id: u32 = rand::thread_rng().gen();

            let mut req = BytesMut::with_capacity(98);
            req.put_u64(connection_id);
            req.put_u32(ACTION_ANNOUNCE);
            req.put_u32(transaction_id);
            req.put_slice(&params.info_hash);
            req.put_slice(&params.peer_id);
            req.put_u64(params.downloaded);
            req.put_u64(params.left);
            req.put_u64(params.uploaded);
            req.put_u32(event_code(params.event));
            req.put_u32(0); // ip address: 0 = let the tracker use the packet's source
            req.put_u32(0); // key: unused
            req.put_i32(-1); // num_want: -1 asks for the tracker's default
            req.put_u16(params.port);
            socket.send(&req).await?;

            let mut buf = [0u8; 8 + 6 * 200];
            let reply = match tokio::time::timeout(
                attempt_timeout(n),
                socket.recv(&mut buf),
            )
            .await
            {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => continue,
            };

            if reply < 20 {
                continue;
            }
            let mut body = &buf[..reply];
            let action = body.get_u32();
            let got_transaction_id = body.get_u32();
            if action != ACTION_ANNOUNCE || got_transaction_id != transaction_id {
                continue;
            }

            let interval = body.get_u32();
            let leechers = body.get_u32();
            let seeders = body.get_u32();

            let mut peers = Vec::with_capacity(body.remaining() / 6);
            while body.remaining() >= 6 {
                let ip = std::net::Ipv4Addr::from(body.get_u32());
                let port = body.get_u16();
                peers.push(SocketAddr::new(std::net::IpAddr::V4(ip), port));
            }

            return Ok(Response {
                interval: Duration::from_secs(interval as u64),
                peers,
                leecher_count: Some(leechers as usize),
                seeder_count: Some(seeders as usize),
            });
        }
        Err(TrackerError::UdpTimedOut)
    }
}

/// BEP 15's per-attempt timeout: `8 * 2^n` seconds, doubling on each retry.
fn attempt_timeout(attempt: u32) -> Duration {
    Duration::from_secs(8 * 2u64.pow(attempt))
}

fn event_code(event: Option<Event>) -> u32 {
    match event {
        None => 0,
        Some(Event::Completed) => 1,
        Some(Event::Started) => 2,
        Some(Event::Stopped) => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_announce_url() {
        let url = Url::parse("udp://tracker.example:6969/announce").unwrap();
        let tracker = Tracker::new(url).unwrap();
        assert_eq!(tracker.addr.port(), 6969);
    }

    #[test]
    fn rejects_udp_url_without_port() {
        let url = Url::parse("udp://tracker.example/announce").unwrap();
        assert!(Tracker::new(url).is_err());
    }

    #[test]
    fn attempt_timeout_doubles_per_bep15() {
        assert_eq!(attempt_timeout(0), Duration::from_secs(8));
        assert_eq!(attempt_timeout(1), Duration::from_secs(16));
        assert_eq!(attempt_timeout(2), Duration::from_secs(32));
        assert_eq!(attempt_timeout(MAX_ATTEMPTS), Duration::from_secs(8 * 16));
    }

    #[test]
    fn event_codes_match_bep15() {
        assert_eq!(event_code(None), 0);
        assert_eq!(event_code(Some(Event::Completed)), 1);
        assert_eq!(event_code(Some(Event::Started)), 2);
        assert_eq!(event_code(Some(Event::Stopped)), 3);
    }
}
