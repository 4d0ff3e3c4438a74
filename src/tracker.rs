//! Tracker announcer: tiers, announce/scrape scheduling, UDP transport.
//!
//! One [`Announcer`] per session owns the per-torrent tier lists and
//! drives announces and scrapes from a 500 ms upkeep pulse. The announcer
//! itself performs no I/O: upkeep emits [`TrackerCommand`]s, transports
//! report back through `on_announce_response` / `on_scrape_response`, and
//! swarm-facing results surface as [`AnnouncerEvent`]s.
//!
//! The UDP tracker protocol ([BEP-15]) is implemented in full by
//! [`UdpTrackerTransport`], including connection-id caching and
//! transaction-id demultiplexing. HTTP announces ride on `reqwest`; the
//! bencoded response body is decoded by the collaborator's codec through
//! [`ResponseDecoder`].
//!
//! [BEP-15]: http://bittorrent.org/beps/bep_0015.html

mod announcer;
mod error;
mod http;
mod response;
mod tier;
mod udp;

pub use announcer::{run, Announcer, AnnouncerEvent, TrackerCommand, TrackerScheme};
pub use error::TrackerError;
pub use http::{HttpTracker, ResponseDecoder};
pub use response::{
    parse_compact_peers, parse_compact_peers6, AnnounceRequest, AnnounceResponse, ScrapeRequest,
    ScrapeResponse, ScrapeRow, TrackerEvent,
};
pub use tier::{Tier, Tracker};
pub use udp::{UdpCommand, UdpCompletion, UdpFailure, UdpTrackerTransport};

#[cfg(test)]
mod tests;
