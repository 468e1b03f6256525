//! The file store: a single file of known total length, written and read by
//! positional IO at `(piece_index, offset)` coordinates.
//!
//! Unlike the teacher's disk task, which buffers a whole piece in memory
//! and hashes it once complete, this store commits each block to disk as
//! soon as it arrives -- the running hash that decides whether a piece is
//! valid lives in [`crate::piece_picker`], with the piece, not here (see
//! DESIGN.md).

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::Path,
    sync::Arc,
};

use nix::sys::uio::{pread, pwrite};
use tokio::{sync::Mutex, task};

use crate::{error::Result, storage_info::StorageInfo, Error, PieceIndex};

/// The entity responsible for reading and writing a torrent's single backing
/// file.
///
/// Writes are serialized by `write_lock`; reads take no lock, as positional
/// reads don't race with each other and, per the scheduler invariant, never
/// race with a write to the same piece (writes to a piece cease once it's
/// verified, and only verified pieces are read for seeding).
pub(crate) struct FileStore {
    file: Arc<File>,
    write_lock: Mutex<()>,
    storage: StorageInfo,
}

impl FileStore {
    /// Opens (creating if necessary) the backing file and preallocates it
    /// to the torrent's exact total length, `L`.
    pub fn new(storage: StorageInfo) -> Result<Self> {
        if let Some(parent) = storage.file.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(Error::FileIo)?;
            }
        }

        let file = open_and_preallocate(&storage.file.path, storage.file.len)
            .map_err(Error::FileIo)?;

        Ok(Self {
            file: Arc::new(file),
            write_lock: Mutex::new(()),
            storage,
        })
    }

    /// Writes `data` at the given piece-relative offset, positioned at
    /// `piece_index * P + offset` in the file. Runs the actual syscall on
    /// the blocking thread pool since positional IO on a regular file can
    /// block.
    pub async fn write_block(
        &self,
        piece_index: usize,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let torrent_offset = self.storage.piece_offset(piece_index) + offset as u64;
        let file = Arc::clone(&self.file);

        // hold the write lock for the duration of the blocking write so
        // that writes to the file never interleave at the syscall level
        let _guard = self.write_lock.lock().await;
        task::spawn_blocking(move || {
            write_at(&file, torrent_offset, &data)
        })
        .await
        .expect("disk write task panicked")
        .map_err(Error::FileIo)
    }

    /// Reads `len` bytes at the given piece-relative offset. Used by the
    /// seeder listener to serve `request` messages.
    pub async fn read_block(
        &self,
        piece_index: usize,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>> {
        let torrent_offset = self.storage.piece_offset(piece_index) + offset as u64;
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || read_at(&file, torrent_offset, len as usize))
            .await
            .expect("disk read task panicked")
            .map_err(Error::FileIo)
    }

    /// The length of the piece at `index`, as computed from the torrent's
    /// metainfo.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        self.storage.piece_len(index)
    }
}

fn open_and_preallocate(path: &Path, len: u64) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    let current_len = file.metadata()?.len();
    if current_len < len {
        file.set_len(len)?;
    }
    Ok(file)
}

fn write_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        let n = pwrite(file.as_raw_fd(), &data[written..], offset as i64 + written as i64)
            .map_err(|_| io::Error::last_os_error())?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "pwrite wrote 0 bytes",
            ));
        }
        written += n;
    }
    Ok(())
}

fn read_at(file: &File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut read = 0;
    while read < len {
        let n = pread(file.as_raw_fd(), &mut buf[read..], offset as i64 + read as i64)
            .map_err(|_| io::Error::last_os_error())?;
        if n == 0 {
            break;
        }
        read += n;
    }
    buf.truncate(read);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileInfo;

    fn tmp_storage(name: &str, len: u64) -> StorageInfo {
        let dir = std::env::temp_dir().join(format!(
            "torrentkit-test-{}-{}",
            name,
            std::process::id()
        ));
        StorageInfo {
            piece_count: 1,
            piece_len: len as u32,
            last_piece_len: len as u32,
            download_len: len,
            file: FileInfo { path: dir, len },
        }
    }

    #[tokio::test]
    async fn writes_and_reads_back_blocks() {
        let storage = tmp_storage("rw", 32);
        let path = storage.file.path.clone();
        let store = FileStore::new(storage).unwrap();

        store.write_block(0, 0, vec![1u8; 16]).await.unwrap();
        store.write_block(0, 16, vec![2u8; 16]).await.unwrap();

        let a = store.read_block(0, 0, 16).await.unwrap();
        let b = store.read_block(0, 16, 16).await.unwrap();
        assert_eq!(a, vec![1u8; 16]);
        assert_eq!(b, vec![2u8; 16]);

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn preallocates_exact_length() {
        let storage = tmp_storage("prealloc", 100);
        let path = storage.file.path.clone();
        let _store = FileStore::new(storage).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 100);
        std::fs::remove_file(path).ok();
    }
}
