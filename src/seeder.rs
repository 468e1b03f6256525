//! The seeder listener (spec.md §4.7): once a torrent's download completes,
//! accepts inbound connections and serves blocks back to other peers.
//!
//! Grounded on `examples/original_source/seeder.py`'s accept-loop-then-serve
//! shape (handshake echo, bitfield, unchoke, then loop on `request`) and the
//! teacher's per-connection `tokio::spawn` pattern seen in `disk/io.rs` and
//! `peer/mod.rs`. Reuses this crate's own [`crate::peer::codec`] wire format
//! since both directions of the protocol share the same framing.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::Result,
    peer::{
        codec::{Handshake, HandshakeCodec, Message, PeerCodec},
        TorrentContext,
    },
    Error,
};

/// Binds a listener on `port` and serves inbound peer connections forever,
/// returning only on an unrecoverable error binding or accepting on the
/// listening socket itself.
pub(crate) async fn listen(ctx: Arc<TorrentContext>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(Error::FileIo)?;
    log::info!("Seeder listening on port {}", port);

    loop {
        let (socket, addr) = listener.accept().await.map_err(Error::PeerIo)?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            log::info!("Accepted inbound connection from {}", addr);
            if let Err(e) = serve(ctx, socket).await {
                log::debug!("Seeder connection to {} ended: {}", addr, e);
            }
        });
    }
}

/// Validates the inbound handshake, echoes it back, sends our bitfield and
/// an unconditional unchoke (spec.md §4.7's "always-unchoke seeding" is the
/// only choking policy this non-goal-trimmed core implements), then serves
/// `request`s until the peer disconnects.
async fn serve(ctx: Arc<TorrentContext>, socket: TcpStream) -> Result<()> {
    let mut socket = Framed::new(socket, HandshakeCodec);

    let peer_handshake = socket
        .next()
        .await
        .ok_or(Error::PeerHandshakeFailed)?
        .map_err(Error::PeerIo)?;
    if peer_handshake.info_hash != ctx.info_hash {
        return Err(Error::PeerHandshakeFailed);
    }

    let reply = Handshake::new(ctx.info_hash, ctx.client_id);
    socket.send(reply).await.map_err(Error::PeerIo)?;

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(new_parts);

    let bitfield = ctx.piece_picker.lock().await.bitfield();
    socket
        .send(Message::Bitfield(bitfield))
        .await
        .map_err(Error::PeerIo)?;
    socket.send(Message::Unchoke).await.map_err(Error::PeerIo)?;

    while let Some(msg) = socket.next().await {
        let msg = msg.map_err(Error::PeerIo)?;
        match msg {
            Message::Request(block) => {
                let data = ctx
                    .file_store
                    .read_block(block.piece_index, block.offset, block.len)
                    .await?;
                socket
                    .send(Message::Block {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    })
                    .await
                    .map_err(Error::PeerIo)?;
            }
            Message::KeepAlive
            | Message::Interested
            | Message::NotInterested
            | Message::Cancel(_) => {
                // acknowledged but a no-op on the seed-only upload path
                // (spec.md §4.5's table)
            }
            other => {
                log::debug!("Ignoring unexpected message from leech: {:?}", other);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alert, disk::FileStore, piece_picker::PiecePicker, storage_info::StorageInfo, FileInfo,
    };
    use sha1::{Digest, Sha1};
    use tokio::{net::TcpStream as ClientStream, sync::Mutex};

    async fn ctx_with_one_verified_piece(data: &[u8]) -> (Arc<TorrentContext>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "torrentkit-seeder-test-{}",
            std::process::id()
        ));
        let storage = StorageInfo {
            piece_count: 1,
            piece_len: data.len() as u32,
            last_piece_len: data.len() as u32,
            download_len: data.len() as u64,
            file: FileInfo { path: dir.clone(), len: data.len() as u64 },
        };

        let digest = Sha1::digest(data);
        let mut expected = [0u8; 20];
        expected.copy_from_slice(&digest);

        let mut picker = PiecePicker::new(&expected, vec![data.len() as u32]);
        let file_store = FileStore::new(storage).unwrap();

        let has_it: crate::Bitfield = (0..1).map(|_| true).collect();
        let piece = picker.next(&has_it).unwrap();
        picker.record_block(piece.index, data).unwrap();
        file_store.write_block(0, 0, data.to_vec()).await.unwrap();
        assert!(picker.finalize(piece.index).unwrap());

        let (alert_chan, _alert_port) = alert::channel();
        let ctx = Arc::new(TorrentContext {
            id: 1,
            info_hash: [3u8; 20],
            client_id: [4u8; 20],
            piece_picker: Arc::new(Mutex::new(picker)),
            file_store: Arc::new(file_store),
            alert_chan,
            connect_timeout: std::time::Duration::from_secs(5),
            max_connect_attempts: 4,
        });
        (ctx, dir)
    }

    #[tokio::test]
    async fn serves_a_request_with_exact_bytes() {
        let data = b"0123456789abcdef".to_vec();
        let (ctx, path) = ctx_with_one_verified_piece(&data).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let ctx2 = Arc::clone(&ctx);
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            serve(ctx2, socket).await.ok();
        });

        let mut client = Framed::new(
            ClientStream::connect(addr).await.unwrap(),
            HandshakeCodec,
        );
        client
            .send(Handshake::new(ctx.info_hash, [9u8; 20]))
            .await
            .unwrap();
        let _reply = client.next().await.unwrap().unwrap();

        let old_parts = client.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        let mut client = Framed::from_parts(new_parts);

        // bitfield then unchoke
        let _bitfield = client.next().await.unwrap().unwrap();
        let _unchoke = client.next().await.unwrap().unwrap();

        client
            .send(Message::Request(crate::BlockInfo {
                piece_index: 0,
                offset: 0,
                len: data.len() as u32,
            }))
            .await
            .unwrap();

        match client.next().await.unwrap().unwrap() {
            Message::Block { piece_index, offset, data: got } => {
                assert_eq!(piece_index, 0);
                assert_eq!(offset, 0);
                assert_eq!(got, data);
            }
            other => panic!("expected a block message, got {:?}", other),
        }

        drop(client);
        std::fs::remove_file(path).ok();
    }
}
