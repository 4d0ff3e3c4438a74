//! The per-torrent swarm aggregate.
//!
//! A swarm ties together the atom pool, the live peers, and in-flight
//! outgoing handshakes for one torrent, all keyed by socket address so
//! iteration order is deterministic and the atom ↔ peer back-reference
//! is held structurally: a connected atom is exactly one whose address
//! also appears in `peers`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::bandwidth::Bandwidth;
use crate::constants::{ATOM_POOL_CEILING, ATOM_POOL_FACTOR, REQUEST_TTL};
use crate::swarm::atom::{Atom, AtomFlags, PeerSource};
use crate::swarm::manager::SwarmError;
use crate::swarm::peer::Peer;
use crate::swarm::requests::ActiveRequests;
use crate::torrent::{BlockIndex, PieceIndex, TorrentId, TorrentView};

/// An HTTP peer reachable by URL rather than by socket address.
///
/// Webseeds never take part in choking or the atom pool; the set is
/// rebuilt whenever torrent metadata arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Webseed {
    pub url: String,
}

/// Aggregate counters mirrored from swarm membership.
#[derive(Debug, Clone, Default)]
pub struct SwarmStats {
    pub peer_count: usize,
    /// Live peers by the source that first reported their atom.
    pub peers_from: [usize; PeerSource::COUNT],
    pub webseed_count: usize,
}

/// An outbound handshake that has been started but not resolved.
#[derive(Debug, Clone)]
pub struct OutgoingHandshake {
    pub source: PeerSource,
    pub utp: bool,
    pub started_at: Instant,
}

pub struct Swarm {
    pub id: TorrentId,
    pub torrent: Arc<dyn TorrentView>,

    pub(crate) pool: BTreeMap<SocketAddr, Atom>,
    pub(crate) peers: BTreeMap<SocketAddr, Peer>,
    pub(crate) outgoing_handshakes: BTreeMap<SocketAddr, OutgoingHandshake>,
    pub(crate) webseeds: Vec<Webseed>,
    pub active_requests: ActiveRequests,

    pub(crate) stats: SwarmStats,
    pub(crate) bandwidth: Bandwidth,

    /// Current optimistic-unchoke peer, if any.
    pub(crate) optimistic: Option<SocketAddr>,
    /// Remaining rechoke passes the optimistic peer is immune for.
    pub(crate) optimistic_unchoke_time_scaler: u8,

    pub(crate) endgame: bool,

    all_seeds: bool,
    all_seeds_dirty: bool,

    /// Peers currently marked interested, from the last rechoke pass.
    pub(crate) interested_count: usize,
    /// Soft interest ceiling carried between rechoke passes.
    pub(crate) max_peers: usize,
    pub(crate) last_cancel: Option<Instant>,
}

impl Swarm {
    pub fn new(id: TorrentId, torrent: Arc<dyn TorrentView>, now: Instant) -> Self {
        let max_peers = torrent.max_connected_peers();
        let mut swarm = Self {
            id,
            torrent,
            pool: BTreeMap::new(),
            peers: BTreeMap::new(),
            outgoing_handshakes: BTreeMap::new(),
            webseeds: Vec::new(),
            active_requests: ActiveRequests::new(),
            stats: SwarmStats::default(),
            bandwidth: Bandwidth::unlimited(now),
            optimistic: None,
            optimistic_unchoke_time_scaler: 0,
            endgame: false,
            all_seeds: false,
            all_seeds_dirty: true,
            interested_count: 0,
            max_peers,
            last_cancel: None,
        };
        swarm.rebuild_webseeds();
        swarm
    }

    pub fn stats(&self) -> &SwarmStats {
        &self.stats
    }

    pub fn peer(&self, addr: SocketAddr) -> Option<&Peer> {
        self.peers.get(&addr)
    }

    pub fn peer_mut(&mut self, addr: SocketAddr) -> Option<&mut Peer> {
        self.peers.get_mut(&addr)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    pub fn atom(&self, addr: SocketAddr) -> Option<&Atom> {
        self.pool.get(&addr)
    }

    pub fn atom_mut(&mut self, addr: SocketAddr) -> Option<&mut Atom> {
        // Atom mutations may change the all-seeds answer.
        self.all_seeds_dirty = true;
        self.pool.get_mut(&addr)
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn webseeds(&self) -> &[Webseed] {
        &self.webseeds
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    /// Address of the current optimistic-unchoke peer, if any.
    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    /// Inserts or refreshes the atom for `addr`.
    pub fn ensure_atom(
        &mut self,
        addr: SocketAddr,
        flags: AtomFlags,
        source: PeerSource,
        now: Instant,
    ) -> &mut Atom {
        self.all_seeds_dirty = true;
        self.pool
            .entry(addr)
            .and_modify(|atom| atom.merge_sighting(flags, source))
            .or_insert_with(|| {
                debug!(target: "swarm", %addr, ?source, "new atom");
                Atom::new(addr, flags, source, now)
            })
    }

    /// True when every pooled atom is a known seed.
    pub fn is_all_seeds(&mut self) -> bool {
        if self.all_seeds_dirty {
            self.all_seeds = self.pool.values().all(Atom::is_seed);
            self.all_seeds_dirty = false;
        }
        self.all_seeds
    }

    pub(crate) fn mark_all_seeds_dirty(&mut self) {
        self.all_seeds_dirty = true;
    }

    /// The atom pool is pruned down to this size by the GC pulse.
    pub fn max_atom_count(&self) -> usize {
        ATOM_POOL_CEILING.min(ATOM_POOL_FACTOR * self.torrent.max_connected_peers())
    }

    /// Installs a live peer after a successful handshake.
    ///
    /// The caller has already ensured the atom exists and cleared the
    /// session-level checks (blocklist, incoming-handshake dedup).
    pub(crate) fn install_peer(
        &mut self,
        addr: SocketAddr,
        peer: Peer,
        now: Instant,
    ) -> Result<(), SwarmError> {
        let incoming = peer.incoming;
        let atom = self.pool.get_mut(&addr).ok_or(SwarmError::NoSuchAtom)?;

        if atom.banned {
            return Err(SwarmError::Banned);
        }
        if self.peers.contains_key(&addr) {
            return Err(SwarmError::DuplicatePeer);
        }
        if incoming && self.peers.len() >= self.torrent.max_connected_peers() {
            return Err(SwarmError::TooManyPeers);
        }

        atom.updated_at = Some(now);
        let from = atom.from_first;

        self.outgoing_handshakes.remove(&addr);
        self.peers.insert(addr, peer);
        self.stats.peer_count += 1;
        self.stats.peers_from[from as usize] += 1;
        debug!(target: "swarm", torrent = self.id.0, %addr, incoming, "peer installed");
        Ok(())
    }

    /// Removes a live peer, settling the atom's failure counter: fruitful
    /// connections reset it, fruitless ones count as another fail.
    pub(crate) fn remove_peer(&mut self, addr: SocketAddr, now: Instant) -> Option<Peer> {
        let mut peer = self.peers.remove(&addr)?;
        peer.close();

        self.stats.peer_count -= 1;
        if let Some(atom) = self.pool.get_mut(&addr) {
            self.stats.peers_from[atom.from_first as usize] -= 1;
            atom.updated_at = Some(now);
            if atom.piece_data_at.is_some() {
                atom.num_fails = 0;
            } else {
                atom.num_fails += 1;
            }
        }
        if self.optimistic == Some(addr) {
            self.optimistic = None;
            self.optimistic_unchoke_time_scaler = 0;
        }
        for block in self.active_requests.remove_peer(addr) {
            debug!(target: "swarm", %addr, block, "dropping request of removed peer");
        }
        debug!(target: "swarm", torrent = self.id.0, %addr, "peer removed");
        Some(peer)
    }

    pub(crate) fn disconnect_all(&mut self, now: Instant) {
        let addrs = self.peer_addrs();
        for addr in addrs {
            self.remove_peer(addr, now);
        }
    }

    /// Rebuilds the webseed set from the torrent's current metadata.
    pub fn rebuild_webseeds(&mut self) {
        self.webseeds = self
            .torrent
            .webseed_urls()
            .into_iter()
            .map(|url| Webseed { url })
            .collect();
        self.stats.webseed_count = self.webseeds.len();
    }

    /// Re-evaluates endgame: entered once the outstanding request volume
    /// covers everything still missing.
    pub(crate) fn update_endgame(&mut self) {
        let outstanding = self.active_requests.len() as u64;
        let block_size = u64::from(crate::constants::BLOCK_SIZE);
        self.endgame = outstanding * block_size >= self.torrent.bytes_left();
    }

    /// Handles a completed block: clears the request index and cancels
    /// every other peer that had the same block in flight.
    pub(crate) fn on_block_arrived(&mut self, block: BlockIndex, from: SocketAddr, now: Instant) {
        self.active_requests.remove(block, from);
        for other in self.active_requests.remove_block(block) {
            if let Some(peer) = self.peers.get_mut(&other) {
                peer.cancel_block(block, now);
            }
        }
        if let Some(atom) = self.pool.get_mut(&from) {
            atom.piece_data_at = Some(now);
        }
        self.update_endgame();
    }

    /// Refill-upkeep: cancels requests older than the request TTL.
    pub(crate) fn cancel_stale_requests(&mut self, now: Instant) {
        let deadline = match now.checked_sub(REQUEST_TTL) {
            Some(t) => t,
            None => return,
        };
        for (block, addr) in self.active_requests.sent_before(deadline) {
            debug!(target: "swarm", torrent = self.id.0, %addr, block, "request timed out");
            self.active_requests.remove(block, addr);
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.cancel_block(block, now);
            }
        }
        self.update_endgame();
    }

    /// Broadcasts piece completion to every live peer.
    pub(crate) fn on_piece_completed(&mut self, piece: PieceIndex) {
        for peer in self.peers.values_mut() {
            peer.on_piece_completed(piece);
        }
        // Requests for the finished piece are moot now.
        let span = self.torrent.layout().block_span(piece);
        for block in span.begin..span.end {
            self.active_requests.remove_block(block);
        }
    }

    /// Atom-GC: prunes the pool to `max_atom_count`, keeping every atom
    /// that is in use and the best-shelved idle ones.
    ///
    /// `in_use_incoming` reports whether a session-level incoming
    /// handshake is in progress for an address.
    pub(crate) fn atom_gc(&mut self, now: Instant, in_use_incoming: &dyn Fn(SocketAddr) -> bool) {
        let cap = self.max_atom_count();
        if self.pool.len() <= cap {
            return;
        }

        let in_use = |addr: SocketAddr| {
            self.peers.contains_key(&addr)
                || self.outgoing_handshakes.contains_key(&addr)
                || in_use_incoming(addr)
        };

        let mut idle: Vec<(SocketAddr, Option<Instant>, Instant)> = self
            .pool
            .values()
            .filter(|atom| !in_use(atom.addr))
            .map(|atom| (atom.addr, atom.piece_data_at, atom.shelf_date))
            .collect();

        let in_use_count = self.pool.len() - idle.len();
        let keep_idle = cap.saturating_sub(in_use_count);
        if idle.len() <= keep_idle {
            return;
        }

        // Best first: piece data within the last hour beats none, then
        // later shelf dates.
        let hour = std::time::Duration::from_secs(3600);
        idle.sort_by_key(|&(addr, piece_data_at, shelf)| {
            let recent_data = matches!(piece_data_at,
                Some(t) if now.saturating_duration_since(t) <= hour);
            (std::cmp::Reverse(recent_data), std::cmp::Reverse(shelf), addr)
        });

        let evict: Vec<SocketAddr> = idle[keep_idle..].iter().map(|&(addr, _, _)| addr).collect();
        for addr in evict {
            self.pool.remove(&addr);
            debug!(target: "swarm", torrent = self.id.0, %addr, "atom shelved off");
        }
        self.all_seeds_dirty = true;
    }

    /// Clears every cached blocklist verdict; re-checked lazily.
    pub(crate) fn invalidate_blocklist_cache(&mut self) {
        for atom in self.pool.values_mut() {
            atom.blocklisted = None;
        }
    }
}
