//! Storage metadata derived once from a [`crate::metainfo::Metainfo`]:
//! piece count and lengths, and the single target file's path and length.
//!
//! Multi-file torrents are an explicit non-goal (spec.md §1), so unlike the
//! teacher's `StorageInfo` this carries exactly one [`FileInfo`] rather than
//! an `FsStructure::File | Archive` enum.

use std::path::PathBuf;

use crate::{error::Result, metainfo::Metainfo, Error, PieceIndex};

/// Information about the torrent's single target file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's path, relative to the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes. Equal to the torrent's total length `L`
    /// since there is exactly one file.
    pub len: u64,
}

/// Information about a torrent's storage details: the piece count and
/// length, download length, and target file.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent, `N`.
    pub piece_count: usize,
    /// The nominal length of a piece, `P`.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// nominal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The total length of the torrent, `L`.
    pub download_len: u64,
    /// The target file.
    pub file: FileInfo,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.info.length.unwrap_or(0);
        let piece_len = metainfo.info.piece_length as u32;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        let file = FileInfo {
            path: download_dir.join(metainfo.file_name()),
            len: download_len,
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            file,
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if self.piece_count == 0 {
            return Err(Error::InvalidPieceIndex);
        }
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the byte offset in the file of the start of the piece at the
    /// given index.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_info(
        piece_count: usize,
        piece_len: u32,
        last_piece_len: u32,
        download_len: u64,
    ) -> StorageInfo {
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            file: FileInfo {
                path: PathBuf::from("/bogus"),
                len: download_len,
            },
        }
    }

    #[test]
    fn test_piece_len() {
        // 3 full pieces of 4 bytes, one smaller piece of 2 bytes
        let info = storage_info(4, 4, 2, 3 * 4 + 2);
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(1).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 4);
        assert_eq!(info.piece_len(3).unwrap(), 2);
        assert!(info.piece_len(4).is_err());
    }

    #[test]
    fn test_piece_offset() {
        let info = storage_info(3, 16384, 7232, 2 * 16384 + 7232);
        assert_eq!(info.piece_offset(0), 0);
        assert_eq!(info.piece_offset(1), 16384);
        assert_eq!(info.piece_offset(2), 2 * 16384);
    }

    #[test]
    fn single_piece_torrent() {
        // L == P: single piece
        let info = storage_info(1, 16384, 16384, 16384);
        assert_eq!(info.piece_len(0).unwrap(), 16384);
    }
}
