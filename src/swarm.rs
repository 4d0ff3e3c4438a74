//! Peer swarms: candidate pools, live peers, choking, request scheduling.
//!
//! A [`Swarm`] is the per-torrent aggregate of everything the client knows
//! about peers for that torrent: the atom pool of candidate addresses, the
//! live connections, in-flight handshakes, and the request bookkeeping.
//! [`PeerManager`] owns all swarms and drives them from a handful of
//! periodic pulses.
//!
//! The actual peer wire protocol lives outside this crate; it reaches the
//! swarm through the [`PeerIo`] capability and the [`PeerEvent`] stream.

mod atom;
mod bitfield;
mod choke;
mod history;
mod manager;
mod peer;
mod requests;
mod swarm;
mod wishlist;

pub use atom::{Atom, AtomFlags, PeerSource};
pub use bitfield::Bitfield;
pub use manager::{HandshakeOutcome, OutgoingAttempt, PeerManager, SwarmError};
pub use peer::{Peer, PeerEvent, PeerIo, PeerWireError};
pub use requests::ActiveRequests;
pub use swarm::{Swarm, SwarmStats, Webseed};
pub use wishlist::{next_blocks, CandidateView};
