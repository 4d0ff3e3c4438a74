//! The peer manager: owns every swarm and drives the periodic pulses.
//!
//! All mutation happens on one logical thread. The async [`run`] driver
//! only ticks the pulse methods; owners embedding their own event loop
//! can call the pulses directly instead.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bandwidth::{Bandwidth, Quota};
use crate::constants::{
    INCOMING_RESERVE, MAX_BAD_PIECES_PER_PEER, MAX_UPLOAD_IDLE, MIN_UPLOAD_IDLE,
    NEW_CONNECTIONS_PER_PULSE, SEED_PAIR_LINGER,
};
use crate::session::{SessionConfig, SessionStats};
use crate::swarm::atom::{Atom, AtomFlags, PeerSource};
use crate::swarm::choke;
use crate::swarm::peer::{Peer, PeerEvent, PeerIo};
use crate::swarm::swarm::{OutgoingHandshake, Swarm};
use crate::swarm::wishlist::{self, CandidateView};
use crate::torrent::{
    BlockIndex, BlockSpan, Direction, PeerId, PieceIndex, Priority, TorrentId, TorrentView,
};

/// Failures surfaced by swarm membership operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SwarmError {
    #[error("address is blocklisted")]
    Blocklisted,

    #[error("address is banned")]
    Banned,

    #[error("a live peer already exists at this address")]
    DuplicatePeer,

    #[error("a handshake from this address is already in progress")]
    DuplicateHandshake,

    #[error("torrent already added")]
    DuplicateTorrent,

    #[error("the swarm is at its peer limit")]
    TooManyPeers,

    #[error("no such torrent")]
    NoSuchTorrent,

    #[error("no atom for this address")]
    NoSuchAtom,

    #[error("no live peer at this address")]
    NoSuchPeer,

    #[error("inbound handshake for an unknown info-hash")]
    UnknownInfoHash,

    #[error("address family not supported")]
    AddressFamilyUnsupported,
}

/// An outgoing connection the reconnect pulse wants opened.
///
/// The dialer resolves each attempt by reporting a [`HandshakeOutcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttempt {
    pub torrent: TorrentId,
    pub addr: SocketAddr,
    pub utp: bool,
}

/// Everything the wire layer knows when a handshake resolves.
pub struct HandshakeOutcome {
    pub addr: SocketAddr,
    /// `None` for inbound handshakes whose info-hash matched nothing.
    pub torrent: Option<TorrentId>,
    pub incoming: bool,
    pub ok: bool,
    /// Whether any bytes were ever read from the socket.
    pub read_anything: bool,
    pub utp: bool,
    pub encrypted: bool,
    pub peer_id: Option<PeerId>,
    pub client: String,
    /// Present iff `ok`.
    pub io: Option<Box<dyn PeerIo>>,
}

pub struct PeerManager {
    config: SessionConfig,
    stats: SessionStats,
    swarms: BTreeMap<TorrentId, Swarm>,
    /// Session-wide inbound handshakes, keyed by remote address.
    incoming_handshakes: BTreeMap<SocketAddr, Instant>,
    bandwidth: Bandwidth,
    epoch: Instant,
}

impl PeerManager {
    pub fn new(config: SessionConfig, now: Instant) -> Self {
        Self {
            config,
            stats: SessionStats::default(),
            swarms: BTreeMap::new(),
            incoming_handshakes: BTreeMap::new(),
            bandwidth: Bandwidth::unlimited(now),
            epoch: now,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session_stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn session_stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }

    pub fn swarm(&self, id: TorrentId) -> Option<&Swarm> {
        self.swarms.get(&id)
    }

    pub fn swarm_mut(&mut self, id: TorrentId) -> Option<&mut Swarm> {
        self.swarms.get_mut(&id)
    }

    pub fn peer_mut(&mut self, id: TorrentId, addr: SocketAddr) -> Option<&mut Peer> {
        self.swarms.get_mut(&id)?.peer_mut(addr)
    }

    // ------------------------------------------------------------------
    // Torrent lifecycle
    // ------------------------------------------------------------------

    pub fn add_torrent(
        &mut self,
        id: TorrentId,
        torrent: Arc<dyn TorrentView>,
        now: Instant,
    ) -> Result<(), SwarmError> {
        if self.swarms.contains_key(&id) {
            return Err(SwarmError::DuplicateTorrent);
        }
        info!(target: "swarm", torrent = id.0, "torrent added");
        self.stats.files_added += 1;
        self.swarms.insert(id, Swarm::new(id, torrent, now));
        Ok(())
    }

    /// Stops a torrent: cancels outgoing handshakes (their completion is
    /// driven to failure) and disconnects every live peer.
    pub fn stop_torrent(&mut self, id: TorrentId, now: Instant) -> Result<(), SwarmError> {
        let swarm = self.swarms.get_mut(&id).ok_or(SwarmError::NoSuchTorrent)?;
        let pending: Vec<SocketAddr> = swarm.outgoing_handshakes.keys().copied().collect();
        for addr in pending {
            swarm.outgoing_handshakes.remove(&addr);
            if let Some(atom) = swarm.atom_mut(addr) {
                atom.num_fails += 1;
            }
        }
        swarm.disconnect_all(now);
        info!(target: "swarm", torrent = id.0, "torrent stopped");
        Ok(())
    }

    pub fn remove_torrent(&mut self, id: TorrentId, now: Instant) -> Result<(), SwarmError> {
        self.stop_torrent(id, now)?;
        self.swarms.remove(&id);
        Ok(())
    }

    /// Metadata arrived (magnet flows); rebuild URL-based peers.
    pub fn on_metadata_complete(&mut self, id: TorrentId) -> Result<(), SwarmError> {
        let swarm = self.swarms.get_mut(&id).ok_or(SwarmError::NoSuchTorrent)?;
        swarm.rebuild_webseeds();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer discovery
    // ------------------------------------------------------------------

    /// Feeds discovered addresses into the swarm's atom pool.
    pub fn add_peers(
        &mut self,
        id: TorrentId,
        source: PeerSource,
        peers: &[(SocketAddr, AtomFlags)],
        now: Instant,
    ) -> Result<usize, SwarmError> {
        let swarm = self.swarms.get_mut(&id).ok_or(SwarmError::NoSuchTorrent)?;
        let before = swarm.pool_size();
        for &(addr, flags) in peers {
            swarm.ensure_atom(addr, flags, source, now);
        }
        Ok(swarm.pool_size() - before)
    }

    /// Blocklist contents changed: forget every cached verdict.
    pub fn on_blocklist_changed(&mut self) {
        for swarm in self.swarms.values_mut() {
            swarm.invalidate_blocklist_cache();
        }
    }

    // ------------------------------------------------------------------
    // Handshakes
    // ------------------------------------------------------------------

    /// An inbound socket arrived from the acceptor.
    pub fn on_incoming_connection(
        &mut self,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(), SwarmError> {
        if self.config.is_blocklisted(addr.ip()) {
            debug!(target: "swarm", %addr, "rejecting blocklisted inbound connection");
            return Err(SwarmError::Blocklisted);
        }
        if self.incoming_handshakes.contains_key(&addr) {
            return Err(SwarmError::DuplicateHandshake);
        }
        self.incoming_handshakes.insert(addr, now);
        Ok(())
    }

    /// A handshake (either direction) finished.
    ///
    /// On failure the atom's failure count is bumped; on success the new
    /// peer is installed unless an abort rule applies (banned atom, full
    /// swarm, duplicate connection), in which case the returned error
    /// tells the wire layer to drop the connection.
    pub fn on_handshake_done(
        &mut self,
        outcome: HandshakeOutcome,
        now: Instant,
    ) -> Result<(), SwarmError> {
        let HandshakeOutcome {
            addr,
            torrent,
            incoming,
            ok,
            read_anything,
            utp,
            encrypted,
            peer_id,
            client,
            io,
        } = outcome;

        if incoming {
            self.incoming_handshakes.remove(&addr);
        }

        let torrent = match torrent {
            Some(id) => id,
            // Inbound handshake for an info-hash we don't serve.
            None => return Err(SwarmError::UnknownInfoHash),
        };
        let swarm = self
            .swarms
            .get_mut(&torrent)
            .ok_or(SwarmError::NoSuchTorrent)?;

        let source = swarm
            .outgoing_handshakes
            .remove(&addr)
            .map(|hs| hs.source)
            .unwrap_or(PeerSource::Incoming);

        if !ok {
            if let Some(atom) = swarm.atom_mut(addr) {
                atom.num_fails += 1;
                if !read_anything {
                    atom.unreachable = true;
                }
                if utp {
                    atom.utp_failed = true;
                }
            }
            debug!(target: "swarm", torrent = torrent.0, %addr, "handshake failed");
            return Ok(());
        }

        let piece_count = swarm.torrent.layout().piece_count() as usize;
        let atom = swarm.ensure_atom(addr, AtomFlags::default(), source, now);
        atom.last_connected_at = Some(now);
        atom.unreachable = false;
        if !incoming {
            atom.flags.connectable = true;
        }

        let io = io.ok_or(SwarmError::NoSuchPeer)?;
        let mut peer = Peer::new(io, piece_count, incoming, now);
        peer.peer_id = peer_id;
        peer.client = client;
        peer.encrypted = encrypted;
        peer.utp = utp;

        swarm.install_peer(addr, peer, now)
    }

    /// An inbound handshake went away without resolving.
    pub fn on_incoming_handshake_abandoned(&mut self, addr: SocketAddr) {
        self.incoming_handshakes.remove(&addr);
    }

    pub fn incoming_handshake_count(&self) -> usize {
        self.incoming_handshakes.len()
    }

    // ------------------------------------------------------------------
    // Wire events
    // ------------------------------------------------------------------

    pub fn on_peer_event(
        &mut self,
        id: TorrentId,
        addr: SocketAddr,
        event: PeerEvent,
        now: Instant,
    ) -> Result<(), SwarmError> {
        let swarm = self.swarms.get_mut(&id).ok_or(SwarmError::NoSuchTorrent)?;
        if !swarm.peers.contains_key(&addr) {
            return Err(SwarmError::NoSuchPeer);
        }

        match event {
            PeerEvent::PeerGotPieceData { bytes } => {
                self.stats.add_uploaded(bytes);
                self.bandwidth.notify_piece_data(Direction::Up, bytes);
                swarm.bandwidth.notify_piece_data(Direction::Up, bytes);
                let peer = swarm.peers.get_mut(&addr).ok_or(SwarmError::NoSuchPeer)?;
                peer.blocks_sent_to_peer.add(now, 1);
                if let Some(atom) = swarm.atom_mut(addr) {
                    atom.piece_data_at = Some(now);
                    atom.updated_at = Some(now);
                }
            }
            PeerEvent::ClientGotPieceData { bytes } => {
                self.stats.add_downloaded(bytes);
                self.bandwidth.notify_piece_data(Direction::Down, bytes);
                swarm.bandwidth.notify_piece_data(Direction::Down, bytes);
                if let Some(atom) = swarm.atom_mut(addr) {
                    atom.piece_data_at = Some(now);
                    atom.updated_at = Some(now);
                }
            }
            PeerEvent::ClientGotBlock { block } => {
                let piece = swarm.torrent.layout().piece_of_block(block);
                let peer = swarm.peers.get_mut(&addr).ok_or(SwarmError::NoSuchPeer)?;
                peer.blocks_sent_to_client.add(now, 1);
                peer.blame_piece(piece);
                swarm.on_block_arrived(block, addr, now);
            }
            PeerEvent::ClientGotRej { block } => {
                swarm.active_requests.remove(block, addr);
            }
            PeerEvent::ClientGotChoke => {
                let peer = swarm.peers.get_mut(&addr).ok_or(SwarmError::NoSuchPeer)?;
                peer.peer_choking = true;
                // Everything outstanding to a choking peer is dead.
                swarm.active_requests.remove_peer(addr);
            }
            PeerEvent::ClientGotHave { piece } => {
                let peer = swarm.peers.get_mut(&addr).ok_or(SwarmError::NoSuchPeer)?;
                peer.set_have(piece);
                Self::sync_seed_flag(swarm, addr);
            }
            PeerEvent::ClientGotHaveAll => {
                let peer = swarm.peers.get_mut(&addr).ok_or(SwarmError::NoSuchPeer)?;
                peer.set_have_all();
                Self::sync_seed_flag(swarm, addr);
            }
            PeerEvent::ClientGotHaveNone => {
                let peer = swarm.peers.get_mut(&addr).ok_or(SwarmError::NoSuchPeer)?;
                peer.set_have_none();
            }
            PeerEvent::ClientGotBitfield { bits } => {
                let peer = swarm.peers.get_mut(&addr).ok_or(SwarmError::NoSuchPeer)?;
                peer.set_have_bitfield(&bits);
                Self::sync_seed_flag(swarm, addr);
            }
            PeerEvent::ClientGotPort { port } => {
                let peer = swarm.peers.get_mut(&addr).ok_or(SwarmError::NoSuchPeer)?;
                peer.dht_port = Some(port);
            }
            PeerEvent::ClientGotSuggest { piece } | PeerEvent::ClientGotAllowedFast { piece } => {
                debug!(target: "swarm", torrent = id.0, %addr, piece, "fast-extension hint");
            }
            PeerEvent::Error { error } => {
                if error.is_fatal() {
                    let peer = swarm.peers.get_mut(&addr).ok_or(SwarmError::NoSuchPeer)?;
                    peer.do_purge = true;
                    debug!(target: "swarm", torrent = id.0, %addr, ?error, "peer marked for purge");
                } else {
                    warn!(target: "swarm", torrent = id.0, %addr, ?error, "unhandled peer error");
                }
            }
        }
        Ok(())
    }

    fn sync_seed_flag(swarm: &mut Swarm, addr: SocketAddr) {
        let is_seed = swarm
            .peers
            .get(&addr)
            .is_some_and(|peer| peer.is_seed());
        if is_seed {
            if let Some(atom) = swarm.atom_mut(addr) {
                atom.flags.seed = true;
            }
            swarm.mark_all_seeds_dirty();
        }
    }

    // ------------------------------------------------------------------
    // Request scheduling
    // ------------------------------------------------------------------

    /// Picks up to `numwant` blocks to request from `addr`, records them
    /// in the active-request index, and hands them to the wire layer.
    pub fn next_requests(
        &mut self,
        id: TorrentId,
        addr: SocketAddr,
        numwant: usize,
        now: Instant,
    ) -> Result<Vec<BlockSpan>, SwarmError> {
        let swarm = self.swarms.get_mut(&id).ok_or(SwarmError::NoSuchTorrent)?;
        if !swarm.peers.contains_key(&addr) {
            return Err(SwarmError::NoSuchPeer);
        }

        swarm.update_endgame();
        let spans = {
            let view = PeerCandidateView {
                swarm: &*swarm,
                addr,
            };
            wishlist::next_blocks(&view, numwant)
        };

        for span in &spans {
            for block in span.begin..span.end {
                swarm.active_requests.add(block, addr, now);
            }
        }
        swarm.update_endgame();
        if let Some(peer) = swarm.peers.get_mut(&addr) {
            peer.request_blocks(&spans);
        }
        Ok(spans)
    }

    // ------------------------------------------------------------------
    // Completeness and blame
    // ------------------------------------------------------------------

    /// A piece passed verification. May be called from the owner's
    /// trampoline only; never from the hashing thread directly.
    pub fn on_piece_completed(&mut self, id: TorrentId, piece: PieceIndex) -> Result<(), SwarmError> {
        let swarm = self.swarms.get_mut(&id).ok_or(SwarmError::NoSuchTorrent)?;
        swarm.on_piece_completed(piece);
        Ok(())
    }

    /// A piece failed verification: every blamed peer gets a strike;
    /// five strikes ban the atom and purge the peer.
    pub fn on_piece_failed(&mut self, id: TorrentId, piece: PieceIndex) -> Result<(), SwarmError> {
        let swarm = self.swarms.get_mut(&id).ok_or(SwarmError::NoSuchTorrent)?;
        let blamed: Vec<SocketAddr> = swarm
            .peers
            .iter()
            .filter(|(_, peer)| peer.is_blamed(piece))
            .map(|(&addr, _)| addr)
            .collect();

        for addr in blamed {
            let Some(peer) = swarm.peers.get_mut(&addr) else {
                continue;
            };
            peer.strikes = peer.strikes.saturating_add(1);
            peer.clear_blame(piece);
            let strikes = peer.strikes;
            if strikes >= MAX_BAD_PIECES_PER_PEER {
                peer.do_purge = true;
                if let Some(atom) = swarm.atom_mut(addr) {
                    atom.banned = true;
                }
                info!(target: "swarm", torrent = id.0, %addr, "peer banned after bad pieces");
            } else {
                debug!(target: "swarm", torrent = id.0, %addr, strikes, "bad piece strike");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pulses
    // ------------------------------------------------------------------

    /// 500 ms pulse: drains every peer within its quota, refreshes the
    /// rate estimates, then runs the reconnect pass.
    pub fn bandwidth_pulse(&mut self, now: Instant) -> Vec<OutgoingAttempt> {
        self.bandwidth.pulse(now);
        for swarm in self.swarms.values_mut() {
            swarm.bandwidth.pulse(now);
            let n = swarm.peers.len() as u64;
            if n == 0 {
                continue;
            }

            // Split the smaller of the session and torrent budgets
            // evenly; unlimited stays unlimited.
            let share = |dir: Direction, session: &Bandwidth, torrent: &Bandwidth| {
                let pool = session.available(dir).min(torrent.available(dir));
                if pool == u64::MAX {
                    u64::MAX
                } else {
                    pool / n
                }
            };
            let up_share = share(Direction::Up, &self.bandwidth, &swarm.bandwidth);
            let down_share = share(Direction::Down, &self.bandwidth, &swarm.bandwidth);

            for peer in swarm.peers.values_mut() {
                let mut quota = Quota::UNLIMITED;
                if up_share != u64::MAX {
                    let granted = swarm.bandwidth.allocate(Direction::Up, up_share);
                    quota.up = self.bandwidth.allocate(Direction::Up, granted);
                }
                if down_share != u64::MAX {
                    let granted = swarm.bandwidth.allocate(Direction::Down, down_share);
                    quota.down = self.bandwidth.allocate(Direction::Down, granted);
                }
                peer.pulse(now, quota);
            }
        }
        self.reconnect_pulse(now)
    }

    /// 10 s pulse: rechoke every running swarm that has peers.
    pub fn rechoke_pulse(&mut self, now: Instant) {
        for swarm in self.swarms.values_mut() {
            if swarm.torrent.is_running() && swarm.peer_count() > 0 {
                choke::rechoke_uploads(swarm, &self.config, now);
                choke::rechoke_downloads(swarm, now);
            }
        }
    }

    /// 10 s pulse: cancel outgoing block requests that went stale.
    pub fn refill_upkeep(&mut self, now: Instant) {
        for swarm in self.swarms.values_mut() {
            swarm.cancel_stale_requests(now);
        }
    }

    /// 60 s pulse: shrink each swarm's atom pool to its cap.
    pub fn atom_gc_pulse(&mut self, now: Instant) {
        let incoming: Vec<SocketAddr> = self.incoming_handshakes.keys().copied().collect();
        for swarm in self.swarms.values_mut() {
            swarm.atom_gc(now, &|addr| incoming.contains(&addr));
        }
    }

    /// Closes bad peers, enforces the per-torrent and session caps, and
    /// picks new outgoing connection candidates.
    pub fn reconnect_pulse(&mut self, now: Instant) -> Vec<OutgoingAttempt> {
        // 1. Stopped torrents keep no connections.
        for swarm in self.swarms.values_mut() {
            if !swarm.torrent.is_running() {
                swarm.disconnect_all(now);
            }
        }

        // 2. Close peers that turned bad.
        for swarm in self.swarms.values_mut() {
            let peer_count = swarm.peer_count();
            let to_close: Vec<SocketAddr> = swarm
                .peers
                .keys()
                .copied()
                .filter(|&addr| Self::should_close_peer(swarm, addr, peer_count, now))
                .collect();
            for addr in to_close {
                swarm.remove_peer(addr, now);
            }
        }

        // 3. Per-torrent cap.
        for swarm in self.swarms.values_mut() {
            let cap = swarm.torrent.max_connected_peers();
            let surplus = swarm.peer_count().saturating_sub(cap);
            if surplus > 0 {
                let mut ordered = Self::peers_by_liveness(swarm);
                ordered.truncate(surplus);
                for addr in ordered {
                    swarm.remove_peer(addr, now);
                }
            }
        }

        // 4. Session-wide cap.
        let total: usize = self.swarms.values().map(Swarm::peer_count).sum();
        let mut surplus = total.saturating_sub(self.config.peer_limit_global);
        if surplus > 0 {
            let mut all: Vec<(LivenessKey, TorrentId, SocketAddr)> = Vec::new();
            for (&id, swarm) in &self.swarms {
                for (&addr, peer) in &swarm.peers {
                    all.push((Self::liveness_key(swarm, addr, peer), id, addr));
                }
            }
            all.sort();
            for (_, id, addr) in all {
                if surplus == 0 {
                    break;
                }
                if let Some(swarm) = self.swarms.get_mut(&id) {
                    swarm.remove_peer(addr, now);
                    surplus -= 1;
                }
            }
        }

        // 5. Open new outgoing connections.
        self.open_outgoing_connections(now)
    }

    fn should_close_peer(swarm: &Swarm, addr: SocketAddr, peer_count: usize, now: Instant) -> bool {
        let peer = &swarm.peers[&addr];
        if peer.do_purge {
            return true;
        }

        let atom_updated = swarm.atom(addr).and_then(|a| a.updated_at);
        let piece_data_at = swarm.atom(addr).and_then(|a| a.piece_data_at);

        // Two seeds have nothing to trade once PEX can't happen either.
        if swarm.torrent.is_seed() && peer.is_seed() && !swarm.torrent.allows_pex() {
            let since = atom_updated
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            if since >= SEED_PAIR_LINGER {
                return true;
            }
        }

        // Idle cutoff slides from MAX down to MIN as the swarm fills up.
        let relax_if_fewer = (swarm.torrent.max_connected_peers() as f64 * 0.9 + 0.5) as usize;
        let strictness = if relax_if_fewer == 0 || peer_count >= relax_if_fewer {
            1.0
        } else {
            peer_count as f64 / relax_if_fewer as f64
        };
        let limit = MAX_UPLOAD_IDLE.as_secs_f64()
            - (MAX_UPLOAD_IDLE.as_secs_f64() - MIN_UPLOAD_IDLE.as_secs_f64()) * strictness;
        let last_active = match (atom_updated, piece_data_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (t, None) | (None, t) => t,
        };
        let idle = last_active
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_else(|| peer.connection_age(now));
        idle.as_secs_f64() > limit
    }

    /// Least-active peers first: purge-marked, then by piece-data
    /// recency, then by atom update time.
    fn liveness_key(swarm: &Swarm, addr: SocketAddr, peer: &Peer) -> LivenessKey {
        let atom = swarm.atom(addr);
        (
            !peer.do_purge,
            atom.and_then(|a| a.piece_data_at),
            atom.and_then(|a| a.updated_at),
            addr,
        )
    }

    fn peers_by_liveness(swarm: &Swarm) -> Vec<SocketAddr> {
        let mut keyed: Vec<(LivenessKey, SocketAddr)> = swarm
            .peers
            .iter()
            .map(|(&addr, peer)| (Self::liveness_key(swarm, addr, peer), addr))
            .collect();
        keyed.sort();
        keyed.into_iter().map(|(_, addr)| addr).collect()
    }

    fn open_outgoing_connections(&mut self, now: Instant) -> Vec<OutgoingAttempt> {
        // Leave a slice of the session slots for incoming connections.
        let max_candidates =
            (self.config.peer_limit_global as f64 * (1.0 - INCOMING_RESERVE)) as usize;
        let occupied: usize = self
            .swarms
            .values()
            .map(|s| s.peer_count() + s.outgoing_handshakes.len())
            .sum::<usize>()
            + self.incoming_handshakes.len();
        let budget = NEW_CONNECTIONS_PER_PULSE.min(max_candidates.saturating_sub(occupied));
        if budget == 0 {
            return Vec::new();
        }

        let mut rng = rand::rng();
        let mut scored: Vec<(u64, TorrentId, SocketAddr)> = Vec::new();

        let config = self.config.clone();
        let epoch = self.epoch;
        for (&id, swarm) in self.swarms.iter_mut() {
            if !swarm.torrent.is_running() {
                continue;
            }
            if swarm.peer_count() >= swarm.torrent.max_connected_peers() {
                continue;
            }
            // A seed swarm full of seeds has nobody worth dialing.
            if swarm.torrent.is_seed() && swarm.is_all_seeds() {
                continue;
            }
            let torrent = swarm.torrent.clone();
            let live: Vec<SocketAddr> = swarm.peer_addrs();
            let handshaking: Vec<SocketAddr> =
                swarm.outgoing_handshakes.keys().copied().collect();
            for atom in swarm.pool.values_mut() {
                if live.contains(&atom.addr) || handshaking.contains(&atom.addr) {
                    continue;
                }
                if atom.banned || !atom.reconnect_ok(now) {
                    continue;
                }
                if torrent.is_seed() && atom.is_seed() {
                    continue;
                }
                if atom_is_blocklisted(&config, atom) {
                    continue;
                }
                let salt: u8 = rng.random();
                scored.push((
                    candidate_score(torrent.as_ref(), atom, epoch, salt),
                    id,
                    atom.addr,
                ));
            }
        }

        scored.sort();
        scored.truncate(budget);

        let mut attempts = Vec::with_capacity(scored.len());
        for (_, id, addr) in scored {
            let Some(swarm) = self.swarms.get_mut(&id) else {
                continue;
            };
            let utp = {
                let Some(atom) = swarm.atom_mut(addr) else {
                    continue;
                };
                atom.last_attempt_at = Some(now);
                self.config.utp_enabled && atom.flags.utp && !atom.utp_failed
            };
            let source = swarm.atom(addr).map(|a| a.from_best).unwrap_or(PeerSource::Tracker);
            swarm.outgoing_handshakes.insert(
                addr,
                OutgoingHandshake {
                    source,
                    utp,
                    started_at: now,
                },
            );
            debug!(target: "swarm", torrent = id.0, %addr, utp, "opening outgoing connection");
            attempts.push(OutgoingAttempt {
                torrent: id,
                addr,
                utp,
            });
        }
        attempts
    }
}

type LivenessKey = (bool, Option<Instant>, Option<Instant>, SocketAddr);

fn atom_is_blocklisted(config: &SessionConfig, atom: &mut Atom) -> bool {
    *atom
        .blocklisted
        .get_or_insert_with(|| config.is_blocklisted(atom.addr.ip()))
}

/// Packs the candidate ordering into one integer key; smaller is better.
fn candidate_score(torrent: &dyn TorrentView, atom: &Atom, epoch: Instant, salt: u8) -> u64 {
    fn push(key: u64, width: u32, value: u64) -> u64 {
        (key << width) | (value & ((1u64 << width) - 1))
    }

    let mut key = 0u64;
    key = push(key, 1, u64::from(atom.ever_failed()));
    let attempt_secs = atom
        .last_attempt_at
        .map(|t| t.saturating_duration_since(epoch).as_secs())
        .unwrap_or(0);
    key = push(key, 32, attempt_secs);
    key = push(key, 4, u64::from(torrent.priority().rank()));
    key = push(key, 1, u64::from(!torrent.recently_started()));
    key = push(key, 1, u64::from(torrent.is_seed()));
    key = push(key, 1, u64::from(!atom.flags.connectable));
    key = push(key, 1, u64::from(atom.flags.seed));
    key = push(key, 4, atom.from_best as u64);
    key = push(key, 8, u64::from(salt));
    key
}

/// View adapter the wishlist walks for one (swarm, peer) pair.
struct PeerCandidateView<'a> {
    swarm: &'a Swarm,
    addr: SocketAddr,
}

impl CandidateView for PeerCandidateView<'_> {
    fn can_request_block(&self, block: BlockIndex) -> bool {
        !self.swarm.torrent.has_block(block) && !self.swarm.active_requests.has(block, self.addr)
    }

    fn can_request_piece(&self, piece: PieceIndex) -> bool {
        self.swarm.torrent.piece_is_wanted(piece)
            && self
                .swarm
                .peer(self.addr)
                .is_some_and(|peer| peer.have.has(piece as usize))
    }

    fn is_endgame(&self) -> bool {
        self.swarm.is_endgame()
    }

    fn active_request_count(&self, block: BlockIndex) -> usize {
        self.swarm.active_requests.count_for_block(block)
    }

    fn missing_blocks(&self, piece: PieceIndex) -> u64 {
        let span = self.block_span(piece);
        (span.begin..span.end)
            .filter(|&b| !self.swarm.torrent.has_block(b))
            .count() as u64
    }

    fn block_span(&self, piece: PieceIndex) -> BlockSpan {
        self.swarm.torrent.layout().block_span(piece)
    }

    fn piece_priority(&self, piece: PieceIndex) -> Priority {
        self.swarm.torrent.piece_priority(piece)
    }

    fn piece_count(&self) -> u32 {
        self.swarm.torrent.layout().piece_count()
    }
}

impl PeerManager {
    /// Drives the pulses on their cadences until every
    /// [`OutgoingAttempt`] receiver is gone.
    pub async fn run(
        manager: Arc<Mutex<PeerManager>>,
        attempts: mpsc::UnboundedSender<OutgoingAttempt>,
    ) {
        use crate::constants::{
            ATOM_GC_PERIOD, BANDWIDTH_PERIOD, RECHOKE_PERIOD, REFILL_UPKEEP_PERIOD,
        };

        let mut bandwidth = tokio::time::interval(BANDWIDTH_PERIOD);
        let mut rechoke = tokio::time::interval(RECHOKE_PERIOD);
        let mut refill = tokio::time::interval(REFILL_UPKEEP_PERIOD);
        let mut atom_gc = tokio::time::interval(ATOM_GC_PERIOD);
        for interval in [&mut bandwidth, &mut rechoke, &mut refill, &mut atom_gc] {
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = bandwidth.tick() => {
                    let new_attempts = manager.lock().bandwidth_pulse(Instant::now());
                    for attempt in new_attempts {
                        if attempts.send(attempt).is_err() {
                            return;
                        }
                    }
                    if attempts.is_closed() {
                        return;
                    }
                }
                _ = rechoke.tick() => {
                    manager.lock().rechoke_pulse(Instant::now());
                }
                _ = refill.tick() => {
                    manager.lock().refill_upkeep(Instant::now());
                }
                _ = atom_gc.tick() => {
                    manager.lock().atom_gc_pulse(Instant::now());
                }
            }
        }
    }
}
