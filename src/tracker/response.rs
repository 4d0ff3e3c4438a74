//! Announce and scrape request/response types.
//!
//! These are the structured forms the announcer builds and consumes; the
//! HTTP and UDP transports translate them to their wire shapes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::torrent::{InfoHash, PeerId};

/// Announce lifecycle events, in BEP-15 wire order.
///
/// The numeric order doubles as queue priority: a tier with a `Stopped`
/// queued outranks one that only owes a periodic re-announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TrackerEvent {
    #[default]
    None = 0,
    Completed = 1,
    Started = 2,
    Stopped = 3,
}

impl TrackerEvent {
    /// Query-string form; empty for the periodic re-announce.
    pub fn as_str(self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
        }
    }

    pub fn as_udp_id(self) -> u32 {
        self as u32
    }
}

/// A fully-built announce, ready for either transport.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub url: String,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    /// Random per-session key letting trackers match us across IPs.
    pub key: u32,
    pub uploaded: u64,
    pub downloaded: u64,
    pub corrupt: u64,
    pub left: u64,
    pub event: TrackerEvent,
    /// Peers wanted back; zero when stopping.
    pub numwant: i32,
    pub tracker_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    pub interval: Option<u32>,
    pub min_interval: Option<u32>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub downloads: Option<u32>,
    pub tracker_id: Option<String>,
    pub warning: Option<String>,
    pub peers: Vec<SocketAddr>,
    pub peers6: Vec<SocketAddr>,
}

/// A scrape for one URL, possibly batching many torrents.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub url: String,
    pub info_hashes: Vec<InfoHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeRow {
    pub info_hash: InfoHash,
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeResponse {
    pub rows: Vec<ScrapeRow>,
    /// Tracker-requested floor for the next scrape, when present.
    pub min_request_interval: Option<u32>,
}

/// Decodes BEP-23 compact IPv4 peers (6 bytes each).
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Decodes BEP-7 compact IPv6 peers (18 bytes each).
pub fn parse_compact_peers6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect()
}

/// `host:port` lookup key for a UDP tracker URL.
pub fn udp_host_key(url: &str) -> Option<String> {
    let rest = url.strip_prefix("udp://")?;
    let host_port = rest.split('/').next().unwrap_or(rest);
    if host_port.is_empty() {
        return None;
    }
    Some(host_port.to_ascii_lowercase())
}
