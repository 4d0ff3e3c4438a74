//! btswarm - the peer-swarm core of a BitTorrent client
//!
//! This library implements the part of a client that manages peers and
//! trackers for active torrents: who we know about, who we talk to, what
//! we request from whom, and how new peers are discovered.
//!
//! # Modules
//!
//! - [`swarm`] - per-torrent peer sets: atom pools, live peers, choking,
//!   request scheduling, endgame, reconnect
//! - [`tracker`] - BEP-12 tiers, HTTP/UDP announce and scrape, the UDP
//!   tracker transport (BEP-15), multiscrape batching
//! - [`bandwidth`] - token-bucket rate accounting feeding the choker
//! - [`session`] - session-wide configuration and persisted counters
//! - [`torrent`] - the collaborator contract a torrent implementation
//!   exposes to the core
//!
//! The wire protocol itself (message framing, handshakes, bencoding) and
//! all disk I/O live outside this crate; they reach the core through the
//! [`swarm::PeerIo`] capability, [`swarm::PeerEvent`]s, and the
//! [`tracker::ResponseDecoder`] seam.

pub mod bandwidth;
pub mod constants;
pub mod session;
pub mod swarm;
pub mod torrent;
pub mod tracker;

pub use bandwidth::{Bandwidth, Quota};
pub use session::{SessionConfig, SessionStats};
pub use swarm::{
    Atom, AtomFlags, Bitfield, HandshakeOutcome, OutgoingAttempt, Peer, PeerEvent, PeerIo,
    PeerManager, PeerSource, Swarm, SwarmError, SwarmStats,
};
pub use torrent::{
    BlockIndex, BlockLayout, BlockSpan, Direction, InfoHash, PeerId, PieceIndex, Priority,
    TorrentId, TorrentView,
};
pub use tracker::{
    AnnounceRequest, AnnounceResponse, Announcer, AnnouncerEvent, ScrapeRequest, ScrapeResponse,
    TrackerCommand, TrackerError, TrackerEvent, UdpTrackerTransport,
};
