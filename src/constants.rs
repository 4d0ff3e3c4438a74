//! Tuning parameters for the peer-swarm core.
//!
//! Cadences, TTLs, and caps used by the peer manager and the announcer.
//! The values follow the defaults of mainstream clients; changing them
//! changes swarm behavior, not protocol correctness.

use std::time::Duration;

// ============================================================================
// Pulse cadences
// ============================================================================

/// Bandwidth pulse: drain peers, allocate quota, run reconnect.
pub const BANDWIDTH_PERIOD: Duration = Duration::from_millis(500);

/// Rechoke pulse: recompute interest and choke sets per swarm.
pub const RECHOKE_PERIOD: Duration = Duration::from_secs(10);

/// Refill-upkeep pulse: expire stale outgoing block requests.
pub const REFILL_UPKEEP_PERIOD: Duration = Duration::from_secs(10);

/// Atom-GC pulse: prune each swarm's candidate pool.
pub const ATOM_GC_PERIOD: Duration = Duration::from_secs(60);

/// Announcer upkeep pulse.
pub const ANNOUNCER_UPKEEP_PERIOD: Duration = Duration::from_millis(500);

/// UDP tracker transport upkeep.
pub const UDP_TRACKER_UPKEEP_PERIOD: Duration = Duration::from_secs(5);

// ============================================================================
// Request scheduling
// ============================================================================

/// Standard block size (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// An outgoing block request older than this is cancelled by refill-upkeep.
pub const REQUEST_TTL: Duration = Duration::from_secs(90);

// ============================================================================
// Atom pool
// ============================================================================

/// Pool cap is `min(ATOM_POOL_CEILING, ATOM_POOL_FACTOR * max_peers)`.
pub const ATOM_POOL_CEILING: usize = 50;
pub const ATOM_POOL_FACTOR: usize = 3;

/// Shelf jitter added to every new atom, uniform in [0, this).
pub const SHELF_JITTER: Duration = Duration::from_secs(600);

// ============================================================================
// Connection lifecycle
// ============================================================================

/// Peers idle longer than this are purged when the swarm is nearly full.
pub const MIN_UPLOAD_IDLE: Duration = Duration::from_secs(60);

/// Peers idle longer than this are purged even in an empty swarm.
pub const MAX_UPLOAD_IDLE: Duration = Duration::from_secs(300);

/// Fast-path reconnect interval for atoms that recently moved piece data.
pub const MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Reconnect backoff by failure count; unreachable atoms skip two steps.
pub const RECONNECT_INTERVALS: [u64; 7] = [0, 10, 120, 900, 1800, 3600, 7200];

/// Seed-to-seed connections are dropped this long after the atom update
/// when PEX is disallowed.
pub const SEED_PAIR_LINGER: Duration = Duration::from_secs(30);

/// New outgoing connections opened per reconnect pulse.
pub const NEW_CONNECTIONS_PER_PULSE: usize = 6;

/// Share of session peer slots reserved for incoming connections.
pub const INCOMING_RESERVE: f64 = 0.05;

/// Bad-piece strikes before an atom is banned.
pub const MAX_BAD_PIECES_PER_PEER: u8 = 5;

// ============================================================================
// Choking and interest
// ============================================================================

/// Sliding window for block/cancel counters.
pub const CANCEL_HISTORY: Duration = Duration::from_secs(60);

/// Lower bound on the number of peers we stay interested in.
pub const MIN_INTERESTING_PEERS: usize = 5;

/// Upper bound on per-rechoke growth of the interest set.
pub const MAX_INTEREST_INCREASE: usize = 15;

/// `cancels * 10 < blocks` separates good peers from bad ones.
pub const GOOD_CANCEL_RATIO: u32 = 10;

/// An optimistic unchoke is immune for this many rechoke passes.
pub const OPTIMISTIC_UNCHOKE_CYCLES: u8 = 4;

/// Connections at most this old count 3x in the optimistic draw.
pub const NEW_CONNECTION_AGE: Duration = Duration::from_secs(45);

// ============================================================================
// Announcer
// ============================================================================

/// Peers requested per announce; zero when stopping.
pub const NUMWANT: i32 = 80;

/// Announce throttle per upkeep pulse.
pub const MAX_ANNOUNCES_PER_UPKEEP: usize = 20;

/// Scrape throttle per upkeep pulse.
pub const MAX_SCRAPES_PER_UPKEEP: usize = 20;

/// Initial per-URL multiscrape batch bound.
pub const MULTISCRAPE_MAX: usize = 64;

/// Shrink step applied when a tracker rejects a batch as too long.
pub const MULTISCRAPE_STEP: usize = 5;

/// Scrape times are aligned to multiples of this to batch better.
pub const SCRAPE_ALIGNMENT: Duration = Duration::from_secs(10);

/// Default announce interval until a tracker supplies one.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60 * 20);

/// Floor applied to tracker-supplied announce intervals.
pub const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(120);

/// Floor applied to tracker-supplied minimum intervals.
pub const MIN_ANNOUNCE_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Default scrape interval until a tracker supplies one.
pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(60 * 30);

// ============================================================================
// UDP tracker transport
// ============================================================================

/// CONNECT request magic.
pub const UDP_TRACKER_MAGIC: u64 = 0x41727101980;

pub const UDP_ACTION_CONNECT: u32 = 0;
pub const UDP_ACTION_ANNOUNCE: u32 = 1;
pub const UDP_ACTION_SCRAPE: u32 = 2;
pub const UDP_ACTION_ERROR: u32 = 3;

/// A server-issued connection id is valid for this long.
pub const UDP_CONNECTION_TTL: Duration = Duration::from_secs(60);

/// Pending UDP requests older than this fail with a timeout.
pub const UDP_REQUEST_TTL: Duration = Duration::from_secs(60);

/// Resolved tracker addresses are cached for this long.
pub const DNS_TTL: Duration = Duration::from_secs(3600);

/// Grace period granted to in-flight requests during shutdown.
pub const UDP_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

// ============================================================================
// HTTP tracker
// ============================================================================

/// HTTP announce/scrape request timeout.
pub const HTTP_TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// User agent string for tracker requests.
pub const USER_AGENT: &str = "btswarm/0.1.0";
