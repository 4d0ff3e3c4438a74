//! Peer atoms: passive records of known peer addresses.
//!
//! An atom exists for every `(address, port)` the swarm has ever heard
//! about, whether or not a connection is live. Atoms carry the discovery
//! provenance, capability flags, and the failure history that drives
//! reconnect backoff and pool garbage collection.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng as _;

use crate::constants::{MIN_RECONNECT_INTERVAL, RECONNECT_INTERVALS, SHELF_JITTER};

/// Where a peer address came from, ordered by trust (most-trusted first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerSource {
    /// The peer connected to us.
    Incoming = 0,
    /// Learned through an LTEP extension message.
    Ltep = 1,
    Tracker = 2,
    Dht = 3,
    Pex = 4,
    /// Loaded from the resume file.
    Resume = 5,
    /// Local peer discovery.
    Lpd = 6,
}

impl PeerSource {
    pub const COUNT: usize = 7;

    pub const ALL: [PeerSource; Self::COUNT] = [
        PeerSource::Incoming,
        PeerSource::Ltep,
        PeerSource::Tracker,
        PeerSource::Dht,
        PeerSource::Pex,
        PeerSource::Resume,
        PeerSource::Lpd,
    ];

    /// Firsthand contact keeps addresses fresh longer than gossip.
    pub fn shelf_life(self) -> Duration {
        match self {
            PeerSource::Incoming | PeerSource::Ltep => Duration::from_secs(60 * 60 * 6),
            PeerSource::Tracker | PeerSource::Dht => Duration::from_secs(60 * 60 * 3),
            PeerSource::Pex => Duration::from_secs(60 * 60 * 2),
            PeerSource::Resume => Duration::from_secs(60 * 60),
            PeerSource::Lpd => Duration::from_secs(60 * 10),
        }
    }
}

/// Capability flags gossiped with peer addresses (PEX flag byte layout).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtomFlags {
    pub encryption: bool,
    pub seed: bool,
    pub utp: bool,
    pub holepunch: bool,
    pub connectable: bool,
}

impl AtomFlags {
    pub const SEED: AtomFlags = AtomFlags {
        encryption: false,
        seed: true,
        utp: false,
        holepunch: false,
        connectable: false,
    };

    pub fn from_pex_byte(b: u8) -> Self {
        Self {
            encryption: b & 0x01 != 0,
            seed: b & 0x02 != 0,
            utp: b & 0x04 != 0,
            holepunch: b & 0x08 != 0,
            connectable: b & 0x10 != 0,
        }
    }

    pub fn to_pex_byte(self) -> u8 {
        let mut b = 0u8;
        if self.encryption {
            b |= 0x01;
        }
        if self.seed {
            b |= 0x02;
        }
        if self.utp {
            b |= 0x04;
        }
        if self.holepunch {
            b |= 0x08;
        }
        if self.connectable {
            b |= 0x10;
        }
        b
    }

    /// OR-merge of a fresh sighting into the stored flags.
    pub fn merge(&mut self, other: AtomFlags) {
        self.encryption |= other.encryption;
        self.seed |= other.seed;
        self.utp |= other.utp;
        self.holepunch |= other.holepunch;
        self.connectable |= other.connectable;
    }
}

/// One known peer address within a swarm.
#[derive(Debug, Clone)]
pub struct Atom {
    pub addr: SocketAddr,
    /// First source that reported this address.
    pub from_first: PeerSource,
    /// Most trusted source seen so far.
    pub from_best: PeerSource,
    pub flags: AtomFlags,
    /// Consecutive failed connection attempts.
    pub num_fails: u32,
    /// Last connection status change (connect or disconnect).
    pub updated_at: Option<Instant>,
    pub last_attempt_at: Option<Instant>,
    pub last_connected_at: Option<Instant>,
    /// Last time piece data moved over a connection to this address.
    pub piece_data_at: Option<Instant>,
    /// When an idle atom becomes a garbage-collection candidate.
    pub shelf_date: Instant,
    /// Cached blocklist verdict; `None` until first looked up.
    pub blocklisted: Option<bool>,
    pub banned: bool,
    pub unreachable: bool,
    pub utp_failed: bool,
}

impl Atom {
    pub fn new(addr: SocketAddr, flags: AtomFlags, source: PeerSource, now: Instant) -> Self {
        let jitter = Duration::from_secs(rand::rng().random_range(0..SHELF_JITTER.as_secs()));
        Self {
            addr,
            from_first: source,
            from_best: source,
            flags,
            num_fails: 0,
            updated_at: None,
            last_attempt_at: None,
            last_connected_at: None,
            piece_data_at: None,
            shelf_date: now + source.shelf_life() + jitter,
            blocklisted: None,
            banned: false,
            unreachable: false,
            utp_failed: false,
        }
    }

    /// Applies a repeat sighting: flags are OR'd, the best source is
    /// lowered if the new one outranks it.
    pub fn merge_sighting(&mut self, flags: AtomFlags, source: PeerSource) {
        self.flags.merge(flags);
        if source < self.from_best {
            self.from_best = source;
        }
    }

    pub fn is_seed(&self) -> bool {
        self.flags.seed
    }

    /// True when we failed the most recent attempt at this address.
    pub fn ever_failed(&self) -> bool {
        match (self.last_connected_at, self.last_attempt_at) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(ok), Some(attempt)) => ok < attempt,
        }
    }

    /// Seconds to wait before the next outgoing attempt.
    ///
    /// Addresses that recently moved piece data get the fast path; the
    /// rest back off by failure count, with unreachable addresses pushed
    /// two steps further out.
    pub fn reconnect_interval(&self, now: Instant) -> Duration {
        if !self.unreachable {
            if let Some(t) = self.piece_data_at {
                if now.saturating_duration_since(t) <= MIN_RECONNECT_INTERVAL * 2 {
                    return MIN_RECONNECT_INTERVAL;
                }
            }
        }

        let mut step = self.num_fails as usize;
        if self.unreachable {
            step += 2;
        }
        let secs = RECONNECT_INTERVALS[step.min(RECONNECT_INTERVALS.len() - 1)];
        Duration::from_secs(secs)
    }

    /// Whether enough time has passed since the last attempt.
    pub fn reconnect_ok(&self, now: Instant) -> bool {
        match self.last_attempt_at {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.reconnect_interval(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.0.2.1:6881".parse().unwrap()
    }

    #[test]
    fn source_order_is_trust_order() {
        assert!(PeerSource::Incoming < PeerSource::Ltep);
        assert!(PeerSource::Tracker < PeerSource::Pex);
        assert!(PeerSource::Resume < PeerSource::Lpd);
    }

    #[test]
    fn merge_keeps_best_source_and_ors_flags() {
        let now = Instant::now();
        let mut atom = Atom::new(addr(), AtomFlags::default(), PeerSource::Pex, now);
        atom.merge_sighting(AtomFlags::SEED, PeerSource::Tracker);
        assert_eq!(atom.from_first, PeerSource::Pex);
        assert_eq!(atom.from_best, PeerSource::Tracker);
        assert!(atom.flags.seed);

        // A worse source never raises from_best.
        atom.merge_sighting(AtomFlags::default(), PeerSource::Lpd);
        assert_eq!(atom.from_best, PeerSource::Tracker);
    }

    #[test]
    fn reconnect_interval_is_nondecreasing_in_fails() {
        let now = Instant::now();
        let mut atom = Atom::new(addr(), AtomFlags::default(), PeerSource::Tracker, now);

        let mut prev = Duration::ZERO;
        for fails in 0..10 {
            atom.num_fails = fails;
            let interval = atom.reconnect_interval(now);
            assert!(interval >= prev, "interval shrank at numFails={fails}");
            prev = interval;
        }
        atom.num_fails = 0;
        assert_eq!(atom.reconnect_interval(now), Duration::ZERO);
    }

    #[test]
    fn unreachable_penalty_skips_two_steps() {
        let now = Instant::now();
        let mut atom = Atom::new(addr(), AtomFlags::default(), PeerSource::Tracker, now);
        atom.num_fails = 1;
        let reachable = atom.reconnect_interval(now);
        atom.unreachable = true;
        let unreachable = atom.reconnect_interval(now);
        assert_eq!(reachable, Duration::from_secs(10));
        assert_eq!(unreachable, Duration::from_secs(900));
    }

    #[test]
    fn recent_piece_data_gets_fast_path() {
        let now = Instant::now();
        let mut atom = Atom::new(addr(), AtomFlags::default(), PeerSource::Tracker, now);
        atom.num_fails = 6;
        atom.piece_data_at = Some(now - Duration::from_secs(3));
        assert_eq!(atom.reconnect_interval(now), MIN_RECONNECT_INTERVAL);

        // Unreachable disables the fast path.
        atom.unreachable = true;
        assert!(atom.reconnect_interval(now) > MIN_RECONNECT_INTERVAL);
    }

    #[test]
    fn pex_flag_byte_round_trips() {
        let flags = AtomFlags {
            encryption: true,
            seed: false,
            utp: true,
            holepunch: false,
            connectable: true,
        };
        assert_eq!(AtomFlags::from_pex_byte(flags.to_pex_byte()), flags);
    }
}
