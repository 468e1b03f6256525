//! The piece scheduler: owns the canonical needed/in-flight/verified/pending
//! sets and the running per-piece hash state, and selects the next piece to
//! request given a peer's availability set (rarest-first).
//!
//! All operations here are meant to be called with the picker's lock held by
//! the caller (see [`crate::torrent`]); none of them suspend, matching spec.md
//! §5's "scheduler's critical sections are short and held without
//! suspension inside".

use std::collections::VecDeque;

use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};

use crate::{error::Result, Error, PieceIndex, Sha1Hash};

/// The state a piece is in from the scheduler's point of view.
#[derive(Debug)]
enum PieceState {
    /// Never assigned, or assigned and released without completion.
    Needed,
    /// Assigned to some peer, not yet verified. Carries the running digest
    /// and write progress, which is reset whenever the piece is released --
    /// the digest lives with the piece, never with the peer, so a failing
    /// peer's partial hash can never leak into the next owner.
    InFlight(Progress),
    /// Hashed and confirmed to match the expected digest; its bytes are
    /// durably in the file store.
    Verified,
}

/// The per-piece mutable download progress: bytes written so far and the
/// running SHA-1 context over them.
#[derive(Debug)]
pub(crate) struct Progress {
    pub next_offset: u32,
    hasher: Sha1,
}

impl Progress {
    fn new() -> Self {
        Self { next_offset: 0, hasher: Sha1::new() }
    }

    /// Feeds a contiguous chunk of piece bytes into the running digest and
    /// advances the write cursor. The caller is responsible for verifying
    /// that `offset == next_offset` before calling this.
    fn advance(&mut self, data: &[u8]) {
        self.hasher.input(data);
        self.next_offset += data.len() as u32;
    }

    /// Finalizes the running digest without consuming `self`, so it can be
    /// compared against the expected digest before deciding whether to keep
    /// or discard the progress.
    fn digest(&self) -> Sha1Hash {
        let result = self.hasher.clone().result();
        let mut digest = [0; 20];
        digest.copy_from_slice(&result);
        digest
    }
}

/// A piece handed out by [`PiecePicker::next`]: everything a peer session
/// needs to drive its download to completion.
#[derive(Debug)]
pub(crate) struct Piece {
    pub index: PieceIndex,
    pub len: u32,
    pub expected_digest: Sha1Hash,
}

/// The piece scheduler.
pub(crate) struct PiecePicker {
    /// One entry per piece, in index order.
    pieces: Vec<PieceState>,
    /// The expected digest of each piece, 20 bytes, indexed in parallel with
    /// `pieces`.
    expected_digests: Vec<Sha1Hash>,
    /// The length of each piece, indexed in parallel with `pieces`.
    piece_lens: Vec<u32>,
    /// Piece indices not yet assigned or released without completion, in
    /// shuffled order so that the initial rarest-first pass doesn't create a
    /// swarm-wide hotspot on piece 0.
    needed: Vec<PieceIndex>,
    /// Pieces whose owning peer disconnected mid-download; always drained
    /// before `needed` is consulted. A queue (not a stack) so that "pop the
    /// head" (spec.md §4.4 step 1) is FIFO, not last-released-first.
    pending: VecDeque<PieceIndex>,
    /// Per-piece count of peers known to hold it, indexed directly by piece
    /// index (not a list of `[piece, counter]` pairs -- see DESIGN.md's
    /// "Open Question" entries for why that distinction matters).
    availability: Vec<u32>,
    /// The number of verified pieces.
    verified_count: usize,
}

impl PiecePicker {
    /// Builds a new picker from the concatenated piece digests and the
    /// lengths of each piece (computed once from [`crate::storage_info::StorageInfo`]).
    pub fn new(expected_digests_concat: &[u8], piece_lens: Vec<u32>) -> Self {
        let piece_count = piece_lens.len();
        debug_assert_eq!(expected_digests_concat.len(), piece_count * 20);

        let mut expected_digests = Vec::with_capacity(piece_count);
        for chunk in expected_digests_concat.chunks_exact(20) {
            let mut digest = [0; 20];
            digest.copy_from_slice(chunk);
            expected_digests.push(digest);
        }

        let mut needed: Vec<PieceIndex> = (0..piece_count).collect();
        needed.shuffle(&mut rand::thread_rng());

        Self {
            pieces: (0..piece_count).map(|_| PieceState::Needed).collect(),
            expected_digests,
            piece_lens,
            needed,
            pending: VecDeque::new(),
            availability: vec![0; piece_count],
            verified_count: 0,
        }
    }

    /// The number of pieces, `N`.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Returns true once every piece has been verified.
    pub fn is_complete(&self) -> bool {
        self.verified_count == self.pieces.len()
    }

    /// Records that a peer advertised having the piece at `index`, bumping
    /// its availability counter. Bounds-checked against `N`.
    pub fn record_have(&mut self, index: PieceIndex) -> Result<()> {
        if index >= self.availability.len() {
            return Err(Error::InvalidPieceIndex);
        }
        self.availability[index] += 1;
        Ok(())
    }

    /// Registers an entire bitfield's worth of availability (e.g. after
    /// receiving a peer's `bitfield` message). Returns whether we are
    /// interested in this peer, i.e. whether it has at least one piece we
    /// still need.
    pub fn register_availability(
        &mut self,
        bitfield: &crate::Bitfield,
    ) -> Result<bool> {
        let mut interested = false;
        for index in 0..bitfield.len() {
            if !bitfield.get(index).unwrap_or(false) {
                continue;
            }
            if index >= self.pieces.len() {
                // trailing padding bits beyond N must be ignored
                continue;
            }
            self.availability[index] += 1;
            if matches!(self.pieces[index], PieceState::Needed) {
                interested = true;
            }
        }
        Ok(interested)
    }

    /// Picks the next piece to request, among those in `availability_set`
    /// (the indices a given peer is known to have).
    ///
    /// 1. If `pending` is non-empty, pop its head. If this peer doesn't
    ///    have that piece, put it back at the head for whoever calls next
    ///    and fall through to step 2 instead of giving up -- a peer
    ///    lacking the one pending piece may still have useful work sitting
    ///    in `needed`.
    /// 2. Among `needed` pieces the peer has, pick the one with the lowest
    ///    advertised availability (rarest-first). Ties are broken
    ///    arbitrarily (first-found).
    pub fn next(&mut self, peer_has: &crate::Bitfield) -> Option<Piece> {
        let index = match self.pending.pop_front() {
            Some(index) if peer_has.get(index).unwrap_or(false) => index,
            Some(index) => {
                self.pending.push_front(index);
                self.pick_from_needed(peer_has)?
            }
            None => self.pick_from_needed(peer_has)?,
        };

        self.needed.retain(|&i| i != index);
        self.pieces[index] = PieceState::InFlight(Progress::new());
        Some(Piece {
            index,
            len: self.piece_lens[index],
            expected_digest: self.expected_digests[index],
        })
    }

    /// Scans `needed` for the rarest piece this peer has, per step 2 above.
    fn pick_from_needed(&self, peer_has: &crate::Bitfield) -> Option<PieceIndex> {
        self.needed
            .iter()
            .filter(|&&index| peer_has.get(index).unwrap_or(false))
            .min_by_key(|&&index| self.availability[index])
            .copied()
    }

    /// Advances the running digest of an in-flight piece by `data`, which
    /// must start exactly at the piece's `next_offset` (the caller -- the
    /// peer session -- is responsible for the offset check and for
    /// discarding mismatched blocks before calling this).
    pub fn record_block(&mut self, index: PieceIndex, data: &[u8]) -> Result<u32> {
        match self.pieces.get_mut(index) {
            Some(PieceState::InFlight(progress)) => {
                progress.advance(data);
                Ok(progress.next_offset)
            }
            _ => Err(Error::InvalidPieceIndex),
        }
    }

    /// Returns the piece's current write progress (bytes written so far),
    /// used by a peer session to decide whether the piece is fully
    /// downloaded and ready to be finalized.
    pub fn progress(&self, index: PieceIndex) -> Option<u32> {
        match self.pieces.get(index) {
            Some(PieceState::InFlight(progress)) => Some(progress.next_offset),
            _ => None,
        }
    }

    /// Finalizes an in-flight piece whose last block has just been written:
    /// compares the running digest against the expected one.
    ///
    /// On match, moves the piece to `verified` and returns `true`; the
    /// caller is then expected to signal `DownloadComplete` if this was the
    /// last piece. On mismatch, releases the piece back to `pending` with a
    /// freshly reset digest state and returns `false`.
    pub fn finalize(&mut self, index: PieceIndex) -> Result<bool> {
        let matches = match self.pieces.get(index) {
            Some(PieceState::InFlight(progress)) => {
                progress.digest() == self.expected_digests[index]
            }
            _ => return Err(Error::InvalidPieceIndex),
        };

        if matches {
            self.pieces[index] = PieceState::Verified;
            self.verified_count += 1;
        } else {
            log::warn!("Piece {} failed hash verification", index);
            self.pieces[index] = PieceState::Needed;
            self.pending.push_back(index);
        }
        Ok(matches)
    }

    /// Releases an in-flight piece back to `pending` because its owning
    /// peer disconnected mid-download. Resets `next_offset` to 0 and the
    /// digest context to empty -- the piece's hash state never survives a
    /// change of owner.
    pub fn release(&mut self, index: PieceIndex) {
        if let Some(PieceState::InFlight(_)) = self.pieces.get(index) {
            self.pieces[index] = PieceState::Needed;
            self.pending.push_back(index);
        }
    }

    /// Returns a bitfield over `[0, N)`, set iff the piece at that index is
    /// verified. Used by the seeder listener and by the coordinator's
    /// `completed` announce bookkeeping.
    pub fn bitfield(&self) -> crate::Bitfield {
        self.pieces
            .iter()
            .map(|p| matches!(p, PieceState::Verified))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digests(n: usize) -> Vec<u8> {
        (0..n).flat_map(|i| vec![i as u8; 20]).collect()
    }

    fn full_bitfield(n: usize) -> crate::Bitfield {
        (0..n).map(|_| true).collect()
    }

    #[test]
    fn picks_rarest_first() {
        let mut picker = PiecePicker::new(&digests(3), vec![10, 10, 10]);
        picker.record_have(0).unwrap();
        picker.record_have(0).unwrap();
        picker.record_have(1).unwrap();
        // piece 2 has availability 0, rarest
        let piece = picker.next(&full_bitfield(3)).unwrap();
        assert_eq!(piece.index, 2);
    }

    #[test]
    fn restricts_to_peer_availability_set() {
        let mut picker = PiecePicker::new(&digests(2), vec![10, 10]);
        let mut has_only_1 = crate::Bitfield::new();
        has_only_1.push(false);
        has_only_1.push(true);
        let piece = picker.next(&has_only_1).unwrap();
        assert_eq!(piece.index, 1);
    }

    #[test]
    fn release_resets_progress_and_pending() {
        let mut picker = PiecePicker::new(&digests(1), vec![32]);
        let all = full_bitfield(1);
        let piece = picker.next(&all).unwrap();
        picker.record_block(piece.index, &[0u8; 16]).unwrap();
        assert_eq!(picker.progress(piece.index), Some(16));

        picker.release(piece.index);
        assert_eq!(picker.progress(piece.index), None);
        assert!(picker.pending.contains(&piece.index));

        // picking it up again must start from a clean progress state
        let piece = picker.next(&all).unwrap();
        assert_eq!(picker.progress(piece.index), Some(0));
    }

    #[test]
    fn pending_rejection_falls_through_to_needed() {
        // one piece sits in `pending` (its prior owner disconnected); the
        // other two are untouched in `needed`. A peer that doesn't have the
        // pending piece but does have one of the needed ones must still be
        // handed that needed piece, not `None`.
        let mut picker = PiecePicker::new(&digests(3), vec![10, 10, 10]);
        let all = full_bitfield(3);
        let released = picker.next(&all).unwrap().index;
        picker.release(released);
        assert!(picker.pending.contains(&released));

        // any index other than `released` is still sitting untouched in
        // `needed`, regardless of the picker's internal shuffle order
        let wanted = (released + 1) % 3;
        let mut has_only_wanted = crate::Bitfield::new();
        for i in 0..3 {
            has_only_wanted.push(i == wanted);
        }

        let piece = picker.next(&has_only_wanted).unwrap();
        assert_eq!(piece.index, wanted);
        // the pending piece this peer couldn't serve stays queued for
        // whoever calls next with it available
        assert!(picker.pending.contains(&released));
    }

    #[test]
    fn finalize_mismatch_returns_to_pending() {
        let mut picker = PiecePicker::new(&digests(1), vec![4]);
        let all = full_bitfield(1);
        let piece = picker.next(&all).unwrap();
        picker.record_block(piece.index, b"data").unwrap();
        let ok = picker.finalize(piece.index).unwrap();
        assert!(!ok);
        assert!(picker.pending.contains(&piece.index));
        assert!(!picker.is_complete());
    }

    #[test]
    fn finalize_match_marks_verified() {
        let data = b"exact sixteen by";
        assert_eq!(data.len(), 16);
        let digest = Sha1::digest(data);
        let mut expected = [0u8; 20];
        expected.copy_from_slice(&digest);

        let mut picker = PiecePicker::new(&expected, vec![16]);
        let all = full_bitfield(1);
        let piece = picker.next(&all).unwrap();
        picker.record_block(piece.index, data).unwrap();
        let ok = picker.finalize(piece.index).unwrap();
        assert!(ok);
        assert!(picker.is_complete());
        assert!(picker.bitfield()[0]);
    }

    #[test]
    fn record_have_out_of_bounds_is_rejected() {
        let mut picker = PiecePicker::new(&digests(1), vec![16]);
        assert!(picker.record_have(1).is_err());
    }
}
