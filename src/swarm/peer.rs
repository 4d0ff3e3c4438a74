//! Live peers and the wire-layer contract.
//!
//! The peer-messages layer (outside this crate) owns sockets, framing,
//! and the BEP-3/6/10 details. It exposes each connection to the swarm
//! as a [`PeerIo`] capability and feeds protocol happenings back in as
//! [`PeerEvent`]s through the peer manager.

use std::time::{Duration, Instant};

use crate::bandwidth::Quota;
use crate::constants::CANCEL_HISTORY;
use crate::swarm::bitfield::Bitfield;
use crate::swarm::history::RecentHistory;
use crate::torrent::{BlockIndex, BlockSpan, Direction, PeerId, PieceIndex};

/// Commands the swarm may issue on a live connection.
///
/// Implementations must be non-blocking: a send that would block is
/// queued by the wire layer and drained on its next `pulse`.
pub trait PeerIo: Send {
    fn set_choke(&mut self, choked: bool);

    fn set_interested(&mut self, interested: bool);

    /// Requests the given block spans from the peer.
    fn request_blocks(&mut self, spans: &[BlockSpan]);

    /// Sends a cancel for an outstanding block request.
    fn cancel_block(&mut self, block: BlockIndex);

    /// Tells the peer we completed a piece (HAVE).
    fn on_piece_completed(&mut self, piece: PieceIndex);

    /// Drains buffered reads/writes within the granted quota.
    fn pulse(&mut self, now: Instant, quota: Quota);

    /// Observed piece-data speed in bytes per second.
    fn piece_speed(&self, dir: Direction) -> u64;

    /// Tears the connection down; no further calls follow.
    fn close(&mut self);
}

/// Protocol-level failures reported by the wire layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerWireError {
    /// Request or piece outside the torrent's bounds.
    OutOfRange,
    /// Oversized or malformed frame.
    MessageTooLarge,
    /// The transport dropped underneath the session.
    NotConnected,
    /// Anything else; logged but not acted upon.
    Other(String),
}

impl PeerWireError {
    /// Errors that isolate the peer (set `do_purge`).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PeerWireError::Other(_))
    }
}

/// Happenings on a live connection, delivered by the wire layer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// We uploaded piece data to the peer.
    PeerGotPieceData { bytes: u64 },
    /// We downloaded piece data from the peer.
    ClientGotPieceData { bytes: u64 },
    /// A requested block arrived in full.
    ClientGotBlock { block: BlockIndex },
    ClientGotRej { block: BlockIndex },
    ClientGotChoke,
    ClientGotHave { piece: PieceIndex },
    ClientGotHaveAll,
    ClientGotHaveNone,
    ClientGotBitfield { bits: Vec<u8> },
    ClientGotPort { port: u16 },
    ClientGotSuggest { piece: PieceIndex },
    ClientGotAllowedFast { piece: PieceIndex },
    Error { error: PeerWireError },
}

/// A live, handshake-complete peer connection.
///
/// The swarm owns the record; the wire layer owns the socket behind the
/// boxed [`PeerIo`]. The matching atom lives at the same address key in
/// the swarm's pool.
pub struct Peer {
    pub peer_id: Option<PeerId>,
    /// Decoded client name, e.g. `Transmission 4.0.5`.
    pub client: String,
    pub have: Bitfield,
    /// Pieces this peer contributed blocks to; consulted when a piece
    /// fails verification.
    blame: Bitfield,
    pub strikes: u8,
    /// Completion fraction in [0.0, 1.0], tracked from have-messages.
    pub progress: f64,
    pub do_purge: bool,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub encrypted: bool,
    pub incoming: bool,
    pub utp: bool,
    /// DHT port advertised via a PORT message, if any.
    pub dht_port: Option<u16>,

    pub connected_at: Instant,

    pub blocks_sent_to_peer: RecentHistory,
    pub blocks_sent_to_client: RecentHistory,
    pub cancels_sent_to_peer: RecentHistory,
    pub cancels_sent_to_client: RecentHistory,

    io: Box<dyn PeerIo>,
}

impl Peer {
    pub fn new(io: Box<dyn PeerIo>, piece_count: usize, incoming: bool, now: Instant) -> Self {
        Self {
            peer_id: None,
            client: String::new(),
            have: Bitfield::new(piece_count),
            blame: Bitfield::new(piece_count),
            strikes: 0,
            progress: 0.0,
            do_purge: false,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            encrypted: false,
            incoming,
            utp: false,
            dht_port: None,
            connected_at: now,
            blocks_sent_to_peer: RecentHistory::new(),
            blocks_sent_to_client: RecentHistory::new(),
            cancels_sent_to_peer: RecentHistory::new(),
            cancels_sent_to_client: RecentHistory::new(),
            io,
        }
    }

    pub fn set_choke(&mut self, choked: bool) {
        if self.am_choking != choked {
            self.am_choking = choked;
            self.io.set_choke(choked);
        }
    }

    pub fn set_interested(&mut self, interested: bool) {
        if self.am_interested != interested {
            self.am_interested = interested;
            self.io.set_interested(interested);
        }
    }

    pub fn request_blocks(&mut self, spans: &[BlockSpan]) {
        if !spans.is_empty() {
            self.io.request_blocks(spans);
        }
    }

    /// Sends a cancel and records it in the 60s window.
    pub fn cancel_block(&mut self, block: BlockIndex, now: Instant) {
        self.cancels_sent_to_peer.add(now, 1);
        self.io.cancel_block(block);
    }

    pub fn on_piece_completed(&mut self, piece: PieceIndex) {
        self.io.on_piece_completed(piece);
    }

    pub fn pulse(&mut self, now: Instant, quota: Quota) {
        self.io.pulse(now, quota);
    }

    pub fn piece_speed(&self, dir: Direction) -> u64 {
        self.io.piece_speed(dir)
    }

    pub fn close(&mut self) {
        self.io.close();
    }

    pub fn connection_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.connected_at)
    }

    /// Seeds advertise completion either via progress or a full have set.
    pub fn is_seed(&self) -> bool {
        self.progress >= 1.0 || self.have.is_complete()
    }

    pub fn set_have(&mut self, piece: PieceIndex) {
        self.have.set(piece as usize);
        self.refresh_progress();
    }

    pub fn set_have_all(&mut self) {
        self.have.set_all();
        self.refresh_progress();
    }

    pub fn set_have_none(&mut self) {
        self.have.clear_all();
        self.refresh_progress();
    }

    pub fn set_have_bitfield(&mut self, bytes: &[u8]) {
        self.have = Bitfield::from_bytes(bytes, self.have.piece_count());
        self.refresh_progress();
    }

    pub fn blame_piece(&mut self, piece: PieceIndex) {
        self.blame.set(piece as usize);
    }

    pub fn is_blamed(&self, piece: PieceIndex) -> bool {
        self.blame.has(piece as usize)
    }

    /// Consumes the blame bit after a strike so the piece can be
    /// re-downloaded and re-blamed from scratch.
    pub fn clear_blame(&mut self, piece: PieceIndex) {
        self.blame.clear(piece as usize);
    }

    /// Recent block/cancel counts used by the rechoke pass.
    pub fn rechoke_window(&mut self, now: Instant) -> (u32, u32) {
        (
            self.blocks_sent_to_client.count(now, CANCEL_HISTORY),
            self.cancels_sent_to_peer.count(now, CANCEL_HISTORY),
        )
    }

    fn refresh_progress(&mut self) {
        let total = self.have.piece_count();
        self.progress = if total == 0 {
            0.0
        } else {
            self.have.count() as f64 / total as f64
        };
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("client", &self.client)
            .field("incoming", &self.incoming)
            .field("progress", &self.progress)
            .field("am_choking", &self.am_choking)
            .field("am_interested", &self.am_interested)
            .field("do_purge", &self.do_purge)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::tests::RecordingIo;

    #[test]
    fn choke_and_interest_are_edge_triggered() {
        let (io, log) = RecordingIo::new();
        let now = Instant::now();
        let mut peer = Peer::new(Box::new(io), 8, false, now);

        peer.set_choke(true); // already choking, no-op
        peer.set_choke(false);
        peer.set_choke(false); // no-op
        peer.set_interested(true);

        let log = log.lock();
        assert_eq!(*log, vec!["unchoke", "interested"]);
    }

    #[test]
    fn progress_follows_have_set() {
        let (io, _log) = RecordingIo::new();
        let mut peer = Peer::new(Box::new(io), 4, false, Instant::now());
        assert!(!peer.is_seed());

        peer.set_have(0);
        peer.set_have(1);
        assert!((peer.progress - 0.5).abs() < f64::EPSILON);

        peer.set_have_all();
        assert!(peer.is_seed());

        peer.set_have_none();
        assert_eq!(peer.progress, 0.0);
    }

    #[test]
    fn blame_bits_clear_after_strike() {
        let (io, _log) = RecordingIo::new();
        let mut peer = Peer::new(Box::new(io), 4, false, Instant::now());
        peer.blame_piece(2);
        assert!(peer.is_blamed(2));
        peer.clear_blame(2);
        assert!(!peer.is_blamed(2));
    }
}
