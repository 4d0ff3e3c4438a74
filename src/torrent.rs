//! Torrent collaborator contract.
//!
//! The swarm core never parses metainfo or touches the disk; everything it
//! needs to know about a torrent comes through [`TorrentView`]. The owning
//! client implements the trait over its own torrent state and hands the
//! handle to [`crate::swarm::PeerManager`] when the torrent is added.

use std::fmt;

/// Session-unique torrent handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TorrentId(pub u64);

/// A 20-byte SHA-1 torrent identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A 20-byte peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Piece or torrent priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Rank used in ordering keys; smaller is more urgent.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Transfer direction, seen from this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to peer (upload).
    Up,
    /// Peer to client (download).
    Down,
}

pub type PieceIndex = u32;

/// Global block index: `piece * blocks_per_piece + block_in_piece`.
pub type BlockIndex = u64;

/// Half-open span of global block indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub begin: BlockIndex,
    pub end: BlockIndex,
}

impl BlockSpan {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    pub fn contains(&self, block: BlockIndex) -> bool {
        self.begin <= block && block < self.end
    }
}

/// Piece/block geometry for a torrent of known size.
///
/// Implementors of [`TorrentView`] can delegate their geometry queries
/// here instead of re-deriving the block math.
#[derive(Debug, Clone, Copy)]
pub struct BlockLayout {
    total_size: u64,
    piece_size: u32,
    block_size: u32,
}

impl BlockLayout {
    pub fn new(total_size: u64, piece_size: u32) -> Self {
        Self {
            total_size,
            piece_size,
            block_size: crate::constants::BLOCK_SIZE,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn piece_count(&self) -> u32 {
        if self.total_size == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.piece_size as u64) as u32
    }

    pub fn block_count(&self) -> u64 {
        if self.total_size == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.block_size as u64)
    }

    pub fn piece_len(&self, piece: PieceIndex) -> u32 {
        let begin = piece as u64 * self.piece_size as u64;
        let remaining = self.total_size.saturating_sub(begin);
        remaining.min(self.piece_size as u64) as u32
    }

    pub fn blocks_per_piece(&self) -> u64 {
        (self.piece_size / self.block_size).max(1) as u64
    }

    /// Span of global block indices covering `piece`.
    pub fn block_span(&self, piece: PieceIndex) -> BlockSpan {
        let begin = piece as u64 * self.blocks_per_piece();
        let len = self.piece_len(piece).div_ceil(self.block_size) as u64;
        BlockSpan {
            begin,
            end: (begin + len).min(self.block_count()),
        }
    }

    pub fn piece_of_block(&self, block: BlockIndex) -> PieceIndex {
        (block / self.blocks_per_piece()) as PieceIndex
    }

    pub fn block_len(&self, block: BlockIndex) -> u32 {
        let begin = block * self.block_size as u64;
        let remaining = self.total_size.saturating_sub(begin);
        remaining.min(self.block_size as u64) as u32
    }
}

/// What the swarm core is allowed to ask about a torrent.
///
/// Completion state (`has_piece`, `has_block`, `bytes_left`) reflects the
/// verified on-disk state owned by the disk/hashing collaborator; the
/// swarm only reads it. All methods are called on the event thread.
pub trait TorrentView: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    fn layout(&self) -> BlockLayout;

    /// Bytes still missing from the verified payload.
    fn bytes_left(&self) -> u64;

    fn has_piece(&self, piece: PieceIndex) -> bool;

    fn has_block(&self, block: BlockIndex) -> bool;

    /// False for pieces in unwanted files.
    fn piece_is_wanted(&self, piece: PieceIndex) -> bool;

    fn piece_priority(&self, _piece: PieceIndex) -> Priority {
        Priority::Normal
    }

    fn is_running(&self) -> bool;

    fn is_seed(&self) -> bool {
        self.bytes_left() == 0
    }

    fn is_private(&self) -> bool {
        false
    }

    fn allows_pex(&self) -> bool {
        !self.is_private()
    }

    /// Whether piece data may flow in `dir` right now (paused and
    /// queued torrents disallow both directions).
    fn is_transfer_allowed(&self, dir: Direction) -> bool {
        let _ = dir;
        self.is_running()
    }

    fn max_connected_peers(&self) -> usize;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// True shortly after the torrent was (re)started; recently started
    /// torrents get better peer candidates.
    fn recently_started(&self) -> bool {
        false
    }

    fn webseed_urls(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_block_spans_cover_all_blocks() {
        // 3 pieces of 32 KiB plus a 10-byte tail piece.
        let layout = BlockLayout::new(3 * 32768 + 10, 32768);
        assert_eq!(layout.piece_count(), 4);
        assert_eq!(layout.blocks_per_piece(), 2);
        assert_eq!(layout.block_count(), 7);

        assert_eq!(layout.block_span(0), BlockSpan { begin: 0, end: 2 });
        assert_eq!(layout.block_span(2), BlockSpan { begin: 4, end: 6 });
        // The tail piece has a single short block.
        assert_eq!(layout.block_span(3), BlockSpan { begin: 6, end: 7 });
        assert_eq!(layout.block_len(6), 10);
        assert_eq!(layout.block_len(0), 16384);

        for b in 0..layout.block_count() {
            let piece = layout.piece_of_block(b);
            assert!(layout.block_span(piece).contains(b));
        }
    }

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }
}
