//! Bencoded metainfo (`.torrent` file) decoding.
//!
//! Only single-file torrents are supported; see [`crate::storage_info`] for
//! the invariant this imposes downstream.

use std::{fmt, path::PathBuf};

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::Sha1Hash;

/// A decoded, immutable `.torrent` file.
///
/// Constructed once via [`Metainfo::from_bytes`] and never mutated
/// afterwards; every downstream component (storage info, piece picker,
/// tracker client) derives its state from this value.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
    pub info: Info,
}

impl Metainfo {
    /// Parses a metainfo file from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let metainfo: Self =
            serde_bencode::from_bytes(buf).map_err(Error::Bencode)?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    /// Checks the structural invariants spec'd for a valid metainfo:
    /// single-file only, and a piece hash concatenation that's an exact
    /// multiple of 20 bytes.
    fn validate(&self) -> Result<(), Error> {
        if self.info.files.is_some() {
            return Err(Error::MultiFileNotSupported);
        }
        if self.info.length.is_none() {
            return Err(Error::MissingKey("info.length"));
        }
        if self.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidPiecesLength(self.info.pieces.len()));
        }
        if self.info.pieces.is_empty() {
            return Err(Error::MissingKey("info.pieces"));
        }
        Ok(())
    }

    /// Computes the 20 byte SHA-1 info digest, i.e. the hash over the
    /// canonical bencoding of the `info` sub-dictionary.
    ///
    /// Re-encoding (rather than hashing a slice of the original input) is
    /// what makes this robust to whitespace/key-order differences a
    /// non-canonical encoder might have introduced.
    pub fn info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info).map_err(Error::Bencode)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The number of pieces in the torrent, `N = ceil(L / P)`.
    pub fn piece_count(&self) -> usize {
        let len = self.info.length.unwrap_or(0) as u64;
        let piece_len = self.info.piece_length;
        ((len + piece_len - 1) / piece_len) as usize
    }

    /// Returns the concatenated piece digests, 20 bytes each.
    pub fn piece_hashes(&self) -> &[u8] {
        &self.info.pieces
    }

    /// The single file's target path, relative to the download directory.
    pub fn file_name(&self) -> PathBuf {
        PathBuf::from(&self.info.name)
    }

    /// The announce URLs to try, in order: the primary `announce` URL
    /// first, followed by any `announce-list` tiers flattened in the order
    /// they appear (BEP 12). Only the primary URL is actively used for now;
    /// see SPEC_FULL.md §4.1.
    pub fn announce_urls(&self) -> Vec<&str> {
        let mut urls = vec![self.announce.as_str()];
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if url != &self.announce {
                        urls.push(url);
                    }
                }
            }
        }
        urls
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    md5sum: Option<ByteBuf>,
}

/// An entry of a multi-file torrent's `files` list. Parsed only so that
/// [`Metainfo::validate`] can detect and reject multi-file torrents with a
/// clear error rather than silently misinterpreting a single-file torrent's
/// fields.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

/// Errors that may occur while parsing or validating a metainfo file.
#[derive(Debug)]
pub enum Error {
    Bencode(serde_bencode::Error),
    MultiFileNotSupported,
    MissingKey(&'static str),
    InvalidPiecesLength(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bencode(e) => write!(f, "invalid bencoding: {}", e),
            Error::MultiFileNotSupported => {
                write!(f, "multi-file torrents are not supported")
            }
            Error::MissingKey(key) => write!(f, "missing required key: {}", key),
            Error::InvalidPiecesLength(len) => write!(
                f,
                "info.pieces length {} is not a multiple of 20",
                len
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bencode(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_single_file_torrent(
        name: &str,
        piece_length: u64,
        pieces: &[u8],
        length: u64,
    ) -> Vec<u8> {
        // hand-build a minimal bencoded dictionary; avoids a dependency on
        // an encoder for the purposes of this test fixture
        let mut info = Vec::new();
        info.extend_from_slice(b"d");
        info.extend_from_slice(b"6:lengthi");
        info.extend_from_slice(length.to_string().as_bytes());
        info.extend_from_slice(b"e");
        info.extend_from_slice(b"4:name");
        info.extend_from_slice(name.len().to_string().as_bytes());
        info.extend_from_slice(b":");
        info.extend_from_slice(name.as_bytes());
        info.extend_from_slice(b"12:piece lengthi");
        info.extend_from_slice(piece_length.to_string().as_bytes());
        info.extend_from_slice(b"e");
        info.extend_from_slice(b"6:pieces");
        info.extend_from_slice(pieces.len().to_string().as_bytes());
        info.extend_from_slice(b":");
        info.extend_from_slice(pieces);
        info.extend_from_slice(b"e");

        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce3:fooe4:info");
        buf.extend_from_slice(&info);
        buf.extend_from_slice(b"e");
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let pieces = [1u8; 40]; // two fake 20-byte digests
        let buf = encode_single_file_torrent("a.txt", 16384, &pieces, 20000);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.announce, "foo");
        assert_eq!(metainfo.info.name, "a.txt");
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.file_name(), PathBuf::from("a.txt"));
    }

    #[test]
    fn rejects_pieces_not_multiple_of_20() {
        let pieces = [1u8; 21];
        let buf = encode_single_file_torrent("a.txt", 16384, &pieces, 20000);
        let err = Metainfo::from_bytes(&buf).unwrap_err();
        assert!(matches!(err, Error::InvalidPiecesLength(21)));
    }

    #[test]
    fn info_hash_is_deterministic() {
        let pieces = [7u8; 20];
        let buf = encode_single_file_torrent("f", 16384, &pieces, 10);
        let a = Metainfo::from_bytes(&buf).unwrap().info_hash().unwrap();
        let b = Metainfo::from_bytes(&buf).unwrap().info_hash().unwrap();
        assert_eq!(a, b);
    }
}
