//! Per-peer connection state machine: handshake, framed message loop,
//! request pipeline, and hash-driven piece completion (spec.md §4.5).

pub(crate) mod codec;

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    select,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex,
    },
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

use crate::{
    alert::{Alert, AlertSender},
    disk::FileStore,
    error::Result,
    piece_picker::PiecePicker,
    BlockInfo, Error, PeerId, PieceIndex, Sha1Hash, TorrentId, BLOCK_LEN,
};

/// Shared, read-mostly information about the torrent this session belongs
/// to, handed to every peer session -- a narrow handle rather than a
/// pointer back to the coordinator, per spec.md §9's "cyclic object graph"
/// design note.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub piece_picker: Arc<Mutex<PiecePicker>>,
    pub file_store: Arc<FileStore>,
    pub alert_chan: AlertSender,
    /// Bounded timeout for a single outbound connect attempt (conf.torrent.connect_timeout).
    pub connect_timeout: std::time::Duration,
    /// Additional `ConnectionRefused` retries before giving up on a peer
    /// (conf.torrent.max_connect_attempts).
    pub max_connect_attempts: usize,
}

/// The channel on which the torrent coordinator can send a command to a
/// running peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Commands a peer session may receive from the coordinator.
pub(crate) enum Command {
    Shutdown,
}

/// At any given time, a peer connection is in one of these states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Handshaking,
    AvailabilityExchange,
    Connected,
}

/// Session bookkeeping: choke/interest flags and the piece currently being
/// requested from this peer (at most one, per spec.md §3 "Peer record").
struct Status {
    state: State,
    am_choked: bool,
    am_interested: bool,
    peer_choked: bool,
    peer_interested: bool,
    /// The piece this session is currently downloading, if any.
    current_piece: Option<PieceIndex>,
    /// Our single outstanding request, if any (spec.md §3: "at most one").
    outgoing_request: Option<BlockInfo>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::Connecting,
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
            current_piece: None,
            outgoing_request: None,
        }
    }
}

/// A single outbound peer connection and its session state.
pub(crate) struct PeerSession {
    torrent: Arc<TorrentContext>,
    addr: SocketAddr,
    status: Status,
    /// Pieces we know this peer has.
    peer_has: crate::Bitfield,
    cmd_port: Receiver,
    retry_count: usize,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(torrent: Arc<TorrentContext>, addr: SocketAddr) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                addr,
                status: Status::default(),
                // resized once the piece count is known, right after the
                // handshake completes
                peer_has: crate::Bitfield::new(),
                cmd_port,
                retry_count: 0,
            },
            cmd_chan,
        )
    }

    /// Connects to the peer, performs the handshake, and runs the message
    /// loop until the connection closes or an unrecoverable error occurs.
    ///
    /// On any exit path this releases the peer's in-flight piece (if any)
    /// and sends a `PeerDisconnected` alert -- per-peer errors never
    /// propagate past this function.
    pub async fn start(mut self) {
        let result = self.run_to_completion().await;
        if let Err(e) = &result {
            log::warn!("Peer {} session ended: {}", self.addr, e);
        }
        if let Some(index) = self.status.current_piece.take() {
            self.torrent.piece_picker.lock().await.release(index);
        }
        let _ = self.torrent.alert_chan.send(Alert::PeerDisconnected { addr: self.addr });
    }

    async fn run_to_completion(&mut self) -> Result<()> {
        let socket = self.connect_with_retry().await?;
        let socket = self.handshake(socket).await?;
        self.run(socket).await
    }

    /// Connects with a bounded timeout, retrying `ConnectionRefused` up to
    /// `max_connect_attempts` additional times before giving up, per
    /// spec.md §4.5 "Connect/retry".
    async fn connect_with_retry(&mut self) -> Result<TcpStream> {
        loop {
            self.status.state = State::Connecting;
            log::info!("Connecting to peer {}", self.addr);
            let attempt =
                time::timeout(self.torrent.connect_timeout, TcpStream::connect(self.addr)).await;
            match attempt {
                Ok(Ok(socket)) => {
                    log::info!("Connected to peer {}", self.addr);
                    return Ok(socket);
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    self.retry_count += 1;
                    if self.retry_count > self.torrent.max_connect_attempts {
                        return Err(Error::PeerIo(e));
                    }
                    log::debug!(
                        "Peer {} refused connection, retry {}/{}",
                        self.addr,
                        self.retry_count,
                        self.torrent.max_connect_attempts
                    );
                }
                Ok(Err(e)) => return Err(Error::PeerIo(e)),
                Err(_elapsed) => {
                    return Err(Error::PeerIo(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    )))
                }
            }
        }
    }

    /// Exchanges the fixed 68-byte handshake frame and switches the codec
    /// over to the framed message protocol.
    async fn handshake(
        &mut self,
        socket: TcpStream,
    ) -> Result<Framed<TcpStream, PeerCodec>> {
        self.status.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);

        let handshake = Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        log::info!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await.map_err(Error::PeerIo)?;

        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake = socket
            .next()
            .await
            .ok_or(Error::PeerHandshakeFailed)?
            .map_err(Error::PeerIo)?;

        if peer_handshake.info_hash != self.torrent.info_hash {
            log::warn!("Peer {} handshake carried a mismatched info hash", self.addr);
            return Err(Error::PeerHandshakeFailed);
        }

        // switch to the message codec, carrying over any bytes the peer
        // already sent past the handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;

        self.status.state = State::AvailabilityExchange;
        let piece_count = self.torrent.piece_picker.lock().await.piece_count();
        self.peer_has = (0..piece_count).map(|_| false).collect();

        Ok(Framed::from_parts(new_parts))
    }

    /// The main session loop: message/command select, run until shutdown or
    /// an unrecoverable error.
    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, mut stream) = socket.split();

        loop {
            select! {
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            let msg = msg.map_err(Error::PeerIo)?;
                            self.handle_message(&mut sink, msg).await?;
                        }
                        None => {
                            log::info!("Peer {} closed the connection", self.addr);
                            return Ok(());
                        }
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down peer {} session", self.addr);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        sink: &mut (impl SinkExt<Message, Error = std::io::Error> + Unpin),
        msg: Message,
    ) -> Result<()> {
        if self.status.state == State::AvailabilityExchange {
            return self.handle_availability_exchange(sink, msg).await;
        }

        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                log::info!("Peer {} choked us", self.addr);
                self.status.am_choked = true;
                // we won't get served; nothing outstanding makes sense
                // to keep tracked
                self.status.outgoing_request = None;
                // signal readiness to be unchoked again, per spec.md §4.5
                self.status.am_interested = true;
                sink.send(Message::Interested).await.map_err(Error::PeerIo)?;
            }
            Message::Unchoke => {
                if self.status.am_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.am_choked = false;
                    self.send_request(sink).await?;
                }
            }
            Message::Interested => {
                self.status.peer_interested = true;
            }
            Message::NotInterested => {
                self.status.peer_interested = false;
            }
            Message::Have { piece_index } => {
                // payload is fully read by the codec by the time we get
                // here, so logging it is always safe -- see DESIGN.md's
                // "have read-before-log" resolution
                log::debug!("Peer {} has piece {}", self.addr, piece_index);
                if piece_index < self.peer_has.len() {
                    self.peer_has.set(piece_index, true);
                }
                self.torrent.piece_picker.lock().await.record_have(piece_index)?;
                if self.status.outgoing_request.is_none() {
                    self.send_request(sink).await?;
                }
            }
            Message::Bitfield(_) => {
                log::warn!(
                    "Peer {} sent bitfield outside availability exchange",
                    self.addr
                );
            }
            Message::Block { piece_index, offset, data } => {
                self.handle_block(sink, piece_index, offset, data).await?;
            }
            // requests and cancels are no-ops on the leech-only data path;
            // the seeder listener (src/seeder.rs) handles the upload side
            Message::Request(_) | Message::Cancel(_) => {}
        }

        Ok(())
    }

    async fn handle_availability_exchange(
        &mut self,
        sink: &mut (impl SinkExt<Message, Error = std::io::Error> + Unpin),
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(mut bitfield) => {
                // the wire bitfield may be padded to a byte boundary; trim
                // to the actual piece count so trailing bits are never
                // consulted
                let piece_count = self.peer_has.len();
                bitfield.resize(piece_count, false);
                self.status.am_interested = self
                    .torrent
                    .piece_picker
                    .lock()
                    .await
                    .register_availability(&bitfield)?;
                self.peer_has = bitfield;

                self.status.state = State::Connected;
                log::info!("Peer {} session state: {:?}", self.addr, self.status.state);
                if self.status.am_interested {
                    sink.send(Message::Interested).await.map_err(Error::PeerIo)?;
                }
                Ok(())
            }
            other => {
                // the peer skipped the bitfield entirely (e.g. it has
                // nothing yet); move straight to the connected state and
                // dispatch the message normally
                self.status.state = State::Connected;
                log::info!("Peer {} session state: {:?}", self.addr, self.status.state);
                self.handle_message(sink, other).await
            }
        }
    }

    /// Handles an incoming block: accepts it only if it matches this
    /// session's current piece and expected offset, otherwise drops it
    /// silently (request-reordering safety, spec.md §4.5).
    async fn handle_block(
        &mut self,
        sink: &mut (impl SinkExt<Message, Error = std::io::Error> + Unpin),
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let accepted = match self.status.current_piece {
            Some(current) if current == piece_index => {
                let expected_offset =
                    self.torrent.piece_picker.lock().await.progress(piece_index);
                expected_offset == Some(offset)
            }
            _ => false,
        };

        if accepted {
            self.torrent
                .piece_picker
                .lock()
                .await
                .record_block(piece_index, &data)?;
            self.torrent
                .file_store
                .write_block(piece_index, offset, data)
                .await?;
            self.status.outgoing_request = None;
        } else {
            log::debug!(
                "Peer {} sent block at unexpected offset for piece {}, dropping",
                self.addr,
                piece_index
            );
        }

        // whether accepted or dropped, try to make progress: either the
        // next block of the same piece, or a re-request of the same offset
        self.send_request(sink).await
    }

    /// Drives the single-request pipeline forward.
    ///
    /// 1. If we have no current piece, ask the scheduler for one. If none
    ///    is available and the download is complete, signal completion.
    /// 2. If the current piece is fully downloaded locally, finalize it
    ///    (hash compare) and loop back to 1.
    /// 3. Otherwise, request the next block.
    async fn send_request(
        &mut self,
        sink: &mut (impl SinkExt<Message, Error = std::io::Error> + Unpin),
    ) -> Result<()> {
        if self.status.am_choked {
            return Ok(());
        }

        loop {
            if self.status.current_piece.is_none() {
                let mut picker = self.torrent.piece_picker.lock().await;
                match picker.next(&self.peer_has) {
                    Some(piece) => {
                        self.status.current_piece = Some(piece.index);
                    }
                    None => {
                        if picker.is_complete() {
                            let _ = self.torrent.alert_chan.send(
                                Alert::DownloadComplete { torrent_id: self.torrent.id },
                            );
                        }
                        return Ok(());
                    }
                }
            }

            let index = self.status.current_piece.expect("just set above");
            let (piece_len, progress) = {
                let picker = self.torrent.piece_picker.lock().await;
                let piece_len = self
                    .torrent
                    .file_store
                    .piece_len(index)
                    .unwrap_or(0);
                (piece_len, picker.progress(index).unwrap_or(0))
            };

            let remaining = piece_len.saturating_sub(progress);
            if remaining == 0 {
                let matched = self.torrent.piece_picker.lock().await.finalize(index)?;
                self.status.current_piece = None;
                if matched {
                    let _ = self.torrent.alert_chan.send(Alert::PieceVerified {
                        torrent_id: self.torrent.id,
                        index,
                    });
                } else {
                    log::warn!("Piece {} from peer {} failed verification", index, self.addr);
                }
                // either way, loop back and try to pick up more work
                continue;
            }

            let block = BlockInfo {
                piece_index: index,
                offset: progress,
                len: remaining.min(BLOCK_LEN),
            };
            self.status.outgoing_request = Some(block);
            sink.send(Message::Request(block)).await.map_err(Error::PeerIo)?;
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::codec::*;

    #[test]
    fn message_ids_match_wire_table() {
        assert_eq!(MessageId::Choke as u8, 0);
        assert_eq!(MessageId::Unchoke as u8, 1);
        assert_eq!(MessageId::Interested as u8, 2);
        assert_eq!(MessageId::NotInterested as u8, 3);
        assert_eq!(MessageId::Have as u8, 4);
        assert_eq!(MessageId::Bitfield as u8, 5);
        assert_eq!(MessageId::Request as u8, 6);
        assert_eq!(MessageId::Block as u8, 7);
        assert_eq!(MessageId::Cancel as u8, 8);
    }
}
