//! Rechoke pass: interest sizing, choke selection, optimistic unchoke.
//!
//! Runs every ten seconds per swarm. Interest reacts to the recent
//! cancel-to-block ratio (congestion signal); choking rewards the
//! fastest interested peers and keeps one stochastic optimistic slot
//! open to discover new fast peers.

use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng as _;
use tracing::debug;

use crate::constants::{
    CANCEL_HISTORY, GOOD_CANCEL_RATIO, MAX_INTEREST_INCREASE, MIN_INTERESTING_PEERS,
    NEW_CONNECTION_AGE, OPTIMISTIC_UNCHOKE_CYCLES,
};
use crate::session::SessionConfig;
use crate::swarm::swarm::Swarm;
use crate::torrent::Direction;

/// How a peer behaved in the recent block/cancel window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RechokeState {
    Good = 0,
    Untested = 1,
    Bad = 2,
}

fn classify(blocks: u32, cancels: u32) -> RechokeState {
    if blocks == 0 && cancels == 0 {
        RechokeState::Untested
    } else if cancels == 0 {
        RechokeState::Good
    } else if blocks == 0 {
        RechokeState::Bad
    } else if cancels * GOOD_CANCEL_RATIO < blocks {
        RechokeState::Good
    } else {
        RechokeState::Bad
    }
}

/// Recomputes which peers we are interested in, and how many.
pub(crate) fn rechoke_downloads(swarm: &mut Swarm, now: Instant) {
    let torrent = swarm.torrent.clone();
    if torrent.is_seed() || !torrent.is_transfer_allowed(Direction::Down) {
        return;
    }

    // Size the interest set. Cancels mean we over-requested: shrink in
    // proportion. A quiet stretch since the last cancel grows it back.
    let mut blocks = 0u32;
    let mut cancels = 0u32;
    for peer in swarm.peers.values_mut() {
        let (b, c) = peer.rechoke_window(now);
        if b == 0 {
            // Unresponsive peers would read as congestion; skip them.
            continue;
        }
        blocks += b;
        cancels += c;
    }

    let mut max_interested = swarm.max_peers;
    if cancels > 0 {
        let cancel_rate = f64::from(cancels) / f64::from(cancels + blocks);
        let mult = 1.0 - cancel_rate.min(0.5);
        max_interested = (swarm.interested_count as f64 * mult) as usize;
        swarm.last_cancel = Some(now);
        debug!(
            target: "swarm",
            torrent = swarm.id.0,
            cancel_rate,
            "shrinking interest set"
        );
    }

    if let Some(last_cancel) = swarm.last_cancel {
        let since = now.saturating_duration_since(last_cancel);
        if !since.is_zero() {
            let max_history = CANCEL_HISTORY * 2;
            let mult = since.min(max_history).as_secs_f64() / max_history.as_secs_f64();
            let inc = (MAX_INTEREST_INCREASE as f64 * mult) as usize;
            max_interested = swarm.max_peers + inc;
        }
    } else {
        max_interested = swarm.max_peers + MAX_INTEREST_INCREASE;
    }

    let ceiling = torrent.max_connected_peers().max(MIN_INTERESTING_PEERS);
    max_interested = max_interested.clamp(MIN_INTERESTING_PEERS, ceiling);
    swarm.max_peers = max_interested;

    // Decide which peers are worth the interest.
    let layout = torrent.layout();
    let piece_count = layout.piece_count();
    let piece_is_interesting: Vec<bool> = (0..piece_count)
        .map(|p| torrent.piece_is_wanted(p) && !torrent.has_piece(p))
        .collect();

    let mut rng = rand::rng();
    let mut ranked: Vec<(RechokeState, u32, SocketAddr)> = Vec::new();
    let mut boring: Vec<SocketAddr> = Vec::new();

    for (&addr, peer) in swarm.peers.iter_mut() {
        let interesting = peer.is_seed()
            || (0..piece_count as usize)
                .any(|p| piece_is_interesting[p] && peer.have.has(p));
        if !interesting {
            boring.push(addr);
            continue;
        }
        let (b, c) = peer.rechoke_window(now);
        ranked.push((classify(b, c), rng.random(), addr));
    }

    for addr in boring {
        if let Some(peer) = swarm.peers.get_mut(&addr) {
            peer.set_interested(false);
        }
    }

    ranked.sort();
    swarm.interested_count = max_interested.min(ranked.len());
    for (i, &(_, _, addr)) in ranked.iter().enumerate() {
        if let Some(peer) = swarm.peers.get_mut(&addr) {
            peer.set_interested(i < swarm.interested_count);
        }
    }
}

#[derive(Debug)]
struct ChokeCandidate {
    addr: SocketAddr,
    is_interested: bool,
    was_choked: bool,
    choke: bool,
    rate: u64,
    salt: u32,
    is_new: bool,
}

/// Rate used to rank peers for unchoking.
fn choke_rate(swarm: &Swarm, addr: SocketAddr) -> u64 {
    let peer = &swarm.peers[&addr];
    if swarm.torrent.is_seed() {
        peer.piece_speed(Direction::Up)
    } else if swarm.torrent.is_private() {
        // Small window of opportunity on private swarms: count both ways.
        peer.piece_speed(Direction::Up) + peer.piece_speed(Direction::Down)
    } else {
        peer.piece_speed(Direction::Down)
    }
}

/// Recomputes the choke set and the optimistic unchoke slot.
pub(crate) fn rechoke_uploads(swarm: &mut Swarm, config: &SessionConfig, now: Instant) {
    let choke_all = !swarm.torrent.is_transfer_allowed(Direction::Up);
    let is_maxed_out = swarm.bandwidth.is_maxed_out(Direction::Up);

    // The optimistic slot survives a fixed number of passes untouched.
    if swarm.optimistic_unchoke_time_scaler > 0 {
        swarm.optimistic_unchoke_time_scaler -= 1;
    } else {
        swarm.optimistic = None;
    }

    let mut rng = rand::rng();
    let mut candidates: Vec<ChokeCandidate> = Vec::with_capacity(swarm.peers.len());
    let mut forced_chokes: Vec<SocketAddr> = Vec::new();

    for (&addr, peer) in swarm.peers.iter() {
        if peer.is_seed() || choke_all {
            // Seeds can't use our blocks; paused torrents upload nothing.
            forced_chokes.push(addr);
        } else if swarm.optimistic != Some(addr) {
            candidates.push(ChokeCandidate {
                addr,
                is_interested: peer.peer_interested,
                was_choked: peer.am_choking,
                choke: true,
                rate: 0,
                salt: rng.random(),
                is_new: peer.connection_age(now) <= NEW_CONNECTION_AGE,
            });
        }
    }

    for candidate in &mut candidates {
        candidate.rate = choke_rate(swarm, candidate.addr);
    }
    candidates.sort_by(|a, b| {
        b.rate
            .cmp(&a.rate)
            .then(a.was_choked.cmp(&b.was_choked))
            .then(a.salt.cmp(&b.salt))
    });

    // Unchoke from the top until enough interested peers hold slots.
    // When upload bandwidth is saturated, keep previous choke states
    // rather than promote.
    let mut checked = 0;
    let mut unchoked_interested = 0;
    for candidate in candidates.iter_mut() {
        if unchoked_interested >= config.upload_slots_per_torrent {
            break;
        }
        candidate.choke = if is_maxed_out {
            candidate.was_choked
        } else {
            false
        };
        checked += 1;
        if candidate.is_interested {
            unchoked_interested += 1;
        }
    }

    // Optimistic unchoke: a weighted uniform draw over the interested
    // peers below the cut, young connections counting three times.
    if swarm.optimistic.is_none() && !is_maxed_out && checked < candidates.len() {
        let mut draw: Vec<usize> = Vec::new();
        for (i, candidate) in candidates.iter().enumerate().skip(checked) {
            if candidate.is_interested {
                let weight = if candidate.is_new { 3 } else { 1 };
                for _ in 0..weight {
                    draw.push(i);
                }
            }
        }
        if !draw.is_empty() {
            let i = draw[rng.random_range(0..draw.len())];
            candidates[i].choke = false;
            swarm.optimistic = Some(candidates[i].addr);
            swarm.optimistic_unchoke_time_scaler = OPTIMISTIC_UNCHOKE_CYCLES;
            debug!(
                target: "swarm",
                torrent = swarm.id.0,
                addr = %candidates[i].addr,
                "optimistic unchoke"
            );
        }
    }

    for addr in forced_chokes {
        if let Some(peer) = swarm.peers.get_mut(&addr) {
            peer.set_choke(true);
        }
    }
    for candidate in &candidates {
        if let Some(peer) = swarm.peers.get_mut(&candidate.addr) {
            peer.set_choke(candidate.choke);
        }
    }
}
