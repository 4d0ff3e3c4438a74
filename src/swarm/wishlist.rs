//! Next-block selection for a single peer.
//!
//! The wishlist ranks wanted pieces and emits block spans to request from
//! one peer. It sees the swarm through [`CandidateView`], a narrow
//! peer-specific lens, so the same walk serves normal and endgame mode.

use crate::torrent::{BlockIndex, BlockSpan, PieceIndex, Priority};

/// A peer-scoped view of what is requestable.
pub trait CandidateView {
    /// We don't have this block and this peer has no pending request
    /// for it.
    fn can_request_block(&self, block: BlockIndex) -> bool;

    /// We want the piece and the peer advertises it.
    fn can_request_piece(&self, piece: PieceIndex) -> bool;

    fn is_endgame(&self) -> bool;

    /// Pending requests for this block across all peers.
    fn active_request_count(&self, block: BlockIndex) -> usize;

    /// Blocks of the piece the client still lacks.
    fn missing_blocks(&self, piece: PieceIndex) -> u64;

    fn block_span(&self, piece: PieceIndex) -> BlockSpan;

    fn piece_priority(&self, piece: PieceIndex) -> Priority;

    fn piece_count(&self) -> u32;
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    piece: PieceIndex,
    priority: u8,
    missing: u64,
}

impl Candidate {
    // Higher priority first, then nearly-done pieces, then stable index
    // order.
    fn key(&self) -> (u8, u64, PieceIndex) {
        (self.priority, self.missing, self.piece)
    }
}

/// Picks up to `numwant` blocks to request from one peer, grouped into
/// contiguous spans.
pub fn next_blocks<V: CandidateView>(view: &V, numwant: usize) -> Vec<BlockSpan> {
    if numwant == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<Candidate> = (0..view.piece_count())
        .filter(|&p| view.can_request_piece(p))
        .map(|piece| Candidate {
            piece,
            priority: view.piece_priority(piece).rank(),
            missing: view.missing_blocks(piece),
        })
        .filter(|c| c.missing > 0)
        .collect();
    candidates.sort_by_key(Candidate::key);

    let endgame = view.is_endgame();
    let mut spans: Vec<BlockSpan> = Vec::new();
    let mut picked = 0usize;

    'pieces: for candidate in &candidates {
        let span = view.block_span(candidate.piece);
        for block in span.begin..span.end {
            if !view.can_request_block(block) {
                continue;
            }
            // Outside endgame each block goes to at most one peer.
            if !endgame && view.active_request_count(block) > 0 {
                continue;
            }

            match spans.last_mut() {
                Some(last) if last.end == block => last.end = block + 1,
                _ => spans.push(BlockSpan {
                    begin: block,
                    end: block + 1,
                }),
            }

            picked += 1;
            if picked >= numwant {
                break 'pieces;
            }
        }
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    struct FakeView {
        piece_count: u32,
        blocks_per_piece: u64,
        have_blocks: HashSet<BlockIndex>,
        peer_has: HashSet<PieceIndex>,
        wanted: HashSet<PieceIndex>,
        active: HashMap<BlockIndex, usize>,
        peer_pending: HashSet<BlockIndex>,
        priorities: HashMap<PieceIndex, Priority>,
        endgame: bool,
    }

    impl FakeView {
        fn new(piece_count: u32, blocks_per_piece: u64) -> Self {
            Self {
                piece_count,
                blocks_per_piece,
                have_blocks: HashSet::new(),
                peer_has: (0..piece_count).collect(),
                wanted: (0..piece_count).collect(),
                active: HashMap::new(),
                peer_pending: HashSet::new(),
                priorities: HashMap::new(),
                endgame: false,
            }
        }
    }

    impl CandidateView for FakeView {
        fn can_request_block(&self, block: BlockIndex) -> bool {
            !self.have_blocks.contains(&block) && !self.peer_pending.contains(&block)
        }

        fn can_request_piece(&self, piece: PieceIndex) -> bool {
            self.wanted.contains(&piece) && self.peer_has.contains(&piece)
        }

        fn is_endgame(&self) -> bool {
            self.endgame
        }

        fn active_request_count(&self, block: BlockIndex) -> usize {
            self.active.get(&block).copied().unwrap_or(0)
        }

        fn missing_blocks(&self, piece: PieceIndex) -> u64 {
            let span = self.block_span(piece);
            (span.begin..span.end)
                .filter(|b| !self.have_blocks.contains(b))
                .count() as u64
        }

        fn block_span(&self, piece: PieceIndex) -> BlockSpan {
            let begin = piece as u64 * self.blocks_per_piece;
            BlockSpan {
                begin,
                end: begin + self.blocks_per_piece,
            }
        }

        fn piece_priority(&self, piece: PieceIndex) -> Priority {
            self.priorities.get(&piece).copied().unwrap_or_default()
        }

        fn piece_count(&self) -> u32 {
            self.piece_count
        }
    }

    #[test]
    fn respects_numwant_and_coalesces_spans() {
        let view = FakeView::new(4, 4);
        let spans = next_blocks(&view, 6);
        let total: u64 = spans.iter().map(BlockSpan::len).sum();
        assert_eq!(total, 6);
        // First piece's four blocks come back as one span.
        assert_eq!(spans[0], BlockSpan { begin: 0, end: 4 });
    }

    #[test]
    fn high_priority_pieces_come_first() {
        let mut view = FakeView::new(4, 2);
        view.priorities.insert(3, Priority::High);
        let spans = next_blocks(&view, 2);
        assert_eq!(spans, vec![BlockSpan { begin: 6, end: 8 }]);
    }

    #[test]
    fn near_complete_pieces_break_priority_ties() {
        let mut view = FakeView::new(3, 4);
        // Piece 1 has only one block missing.
        view.have_blocks.extend([4, 5, 6]);
        let spans = next_blocks(&view, 1);
        assert_eq!(spans, vec![BlockSpan { begin: 7, end: 8 }]);
    }

    #[test]
    fn skips_blocks_requested_elsewhere_outside_endgame() {
        let mut view = FakeView::new(1, 4);
        view.active.insert(0, 1);
        view.active.insert(1, 1);
        let spans = next_blocks(&view, 4);
        assert_eq!(spans, vec![BlockSpan { begin: 2, end: 4 }]);
    }

    #[test]
    fn endgame_allows_cross_peer_duplicates() {
        let mut view = FakeView::new(1, 4);
        view.active.insert(0, 1);
        view.endgame = true;
        let spans = next_blocks(&view, 4);
        assert_eq!(spans, vec![BlockSpan { begin: 0, end: 4 }]);
    }

    #[test]
    fn never_rerequests_from_same_peer() {
        let mut view = FakeView::new(1, 4);
        view.endgame = true;
        view.peer_pending.insert(0);
        let spans = next_blocks(&view, 4);
        assert_eq!(spans, vec![BlockSpan { begin: 1, end: 4 }]);
    }

    #[test]
    fn unwanted_pieces_are_skipped() {
        let mut view = FakeView::new(2, 2);
        view.wanted.remove(&0);
        let spans = next_blocks(&view, 4);
        assert_eq!(spans, vec![BlockSpan { begin: 2, end: 4 }]);
    }
}
