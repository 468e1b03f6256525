//! The BitTorrent wire protocol: the 68-byte handshake frame and the
//! length-prefixed message frame that follows it (spec.md §4.5).
//!
//! Two codecs are used in sequence over the same socket, exactly as the
//! teacher's peer session swaps them after the handshake completes: first
//! [`HandshakeCodec`], then [`PeerCodec`].

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The fixed BitTorrent v1 protocol identification string.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The 68-byte handshake frame: `19` + `"BitTorrent protocol"` + 8 reserved
/// zero bytes + 20-byte info hash + 20-byte peer id.
#[derive(Clone, Debug)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self { prot, reserved: [0; 8], info_hash, peer_id }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.reserve(68);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.len() < 1 {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        if prot_len != 19 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid protocol string length in handshake",
            ));
        }
        let frame_len = 1 + 19 + 8 + 20 + 20;
        if buf.len() < frame_len {
            return Ok(None);
        }

        let mut buf = buf.split_to(frame_len);
        buf.advance(1);

        let mut prot = [0u8; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported protocol string in handshake",
            ));
        }

        let mut reserved = [0u8; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { prot, reserved, info_hash, peer_id }))
    }
}

/// The message ids used on the wire, following the length prefix (spec.md
/// §4.5's message table).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

/// A decoded peer wire message, or the zero-length keep-alive.
#[derive(Clone, Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(crate::Bitfield),
    Request(BlockInfo),
    Block { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Block { .. } => Some(MessageId::Block),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block { piece_index, offset, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            if len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if buf.len() < 4 + len {
                // reserve capacity up front but wait for the rest to arrive
                buf.reserve(4 + len - buf.len());
                return Ok(None);
            }

            // the whole frame (length prefix + body) has arrived
            let mut frame = buf.split_to(4 + len);
            frame.advance(4);
            let id = frame.get_u8();

            let msg = match id {
                x if x == MessageId::Choke as u8 => Message::Choke,
                x if x == MessageId::Unchoke as u8 => Message::Unchoke,
                x if x == MessageId::Interested as u8 => Message::Interested,
                x if x == MessageId::NotInterested as u8 => Message::NotInterested,
                x if x == MessageId::Have as u8 => {
                    if frame.len() < 4 {
                        return Err(invalid_payload("have"));
                    }
                    let piece_index = frame.get_u32() as PieceIndex;
                    Message::Have { piece_index }
                }
                x if x == MessageId::Bitfield as u8 => {
                    let bytes = frame.to_vec();
                    Message::Bitfield(crate::Bitfield::from_vec(bytes))
                }
                x if x == MessageId::Request as u8 => {
                    if frame.len() < 12 {
                        return Err(invalid_payload("request"));
                    }
                    Message::Request(BlockInfo {
                        piece_index: frame.get_u32() as PieceIndex,
                        offset: frame.get_u32(),
                        len: frame.get_u32(),
                    })
                }
                x if x == MessageId::Block as u8 => {
                    if frame.len() < 8 {
                        return Err(invalid_payload("piece"));
                    }
                    let piece_index = frame.get_u32() as PieceIndex;
                    let offset = frame.get_u32();
                    let data = frame.to_vec();
                    Message::Block { piece_index, offset, data }
                }
                x if x == MessageId::Cancel as u8 => {
                    if frame.len() < 12 {
                        return Err(invalid_payload("cancel"));
                    }
                    Message::Cancel(BlockInfo {
                        piece_index: frame.get_u32() as PieceIndex,
                        offset: frame.get_u32(),
                        len: frame.get_u32(),
                    })
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unknown message id {}", other),
                    ));
                }
            };

            return Ok(Some(msg));
        }
    }
}

fn invalid_payload(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("truncated {} payload", msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_handshake() {
        let handshake = Handshake::new([7u8; 20], [9u8; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, handshake.info_hash);
        assert_eq!(decoded.peer_id, handshake.peer_id);
    }

    #[test]
    fn handshake_decode_waits_for_full_frame() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = buf.split_to(30);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn round_trips_have() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Have { piece_index: 42 }, &mut buf).unwrap();
        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Have { piece_index } => assert_eq!(piece_index, 42),
            _ => panic!("wrong message"),
        }
    }

    #[test]
    fn decode_waits_for_full_message_body() {
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(
                Message::Block { piece_index: 0, offset: 0, data: vec![1, 2, 3, 4] },
                &mut buf,
            )
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);
        assert!(matches!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::KeepAlive
        ));
    }

    #[test]
    fn decodes_request_and_cancel() {
        let block = BlockInfo { piece_index: 3, offset: 16384, len: 16384 };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Request(b) => assert_eq!(b, block),
            _ => panic!("wrong message"),
        }
    }
}
