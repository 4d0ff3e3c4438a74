//! Session-wide configuration and bookkeeping.
//!
//! The session is deliberately not a singleton: everything here is plain
//! state owned by whoever constructs the peer manager and the announcer,
//! passed down explicitly.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng as _;

use crate::torrent::PeerId;

/// Predicate deciding whether an address is blocklisted.
///
/// Lookups are cheap-on-repeat because callers cache the verdict per
/// atom; [`crate::swarm::PeerManager::on_blocklist_changed`] drops those
/// caches when the underlying list is swapped.
pub type Blocklist = Arc<dyn Fn(IpAddr) -> bool + Send + Sync>;

/// Typed property bag for the swarm core.
#[derive(Clone)]
pub struct SessionConfig {
    /// Our peer id, sent in announces and handshakes.
    pub peer_id: PeerId,
    /// TCP/µTP listen port advertised to trackers.
    pub listen_port: u16,
    /// Session-wide cap on live peer connections.
    pub peer_limit_global: usize,
    /// Default per-torrent peer cap, used when the torrent has none.
    pub peer_limit_per_torrent: usize,
    /// Unchoke slots granted per torrent each rechoke pass.
    pub upload_slots_per_torrent: usize,
    /// Whether paused torrents may still be scraped.
    pub scrape_paused_torrents: bool,
    /// Whether peer exchange is enabled at the session level.
    pub pex_enabled: bool,
    /// Whether outgoing µTP connections may be attempted.
    pub utp_enabled: bool,
    /// Optional address blocklist.
    pub blocklist: Option<Blocklist>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_id: random_peer_id(),
            listen_port: 51413,
            peer_limit_global: 240,
            peer_limit_per_torrent: 60,
            upload_slots_per_torrent: 14,
            scrape_paused_torrents: true,
            pex_enabled: true,
            utp_enabled: true,
            blocklist: None,
        }
    }
}

impl SessionConfig {
    pub fn is_blocklisted(&self, addr: IpAddr) -> bool {
        match &self.blocklist {
            Some(list) => list(addr),
            None => false,
        }
    }
}

/// Azureus-style peer id: `-BS0100-` plus twelve random digits.
pub fn random_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-BS0100-");
    let mut rng = rand::rng();
    for b in &mut id[8..] {
        *b = b'0' + rng.random_range(0..10u8);
    }
    PeerId(id)
}

/// Session counters persisted across runs by the owner.
///
/// The on-disk format is the collaborator's business; this type only
/// keeps the integer dictionary current.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub files_added: u64,
    pub session_count: u64,
    pub seconds_active: u64,
}

impl SessionStats {
    pub fn add_downloaded(&mut self, bytes: u64) {
        self.downloaded_bytes += bytes;
    }

    pub fn add_uploaded(&mut self, bytes: u64) {
        self.uploaded_bytes += bytes;
    }

    /// The persisted dictionary, keyed as stored on disk.
    pub fn entries(&self) -> [(&'static str, u64); 5] {
        [
            ("downloaded-bytes", self.downloaded_bytes),
            ("uploaded-bytes", self.uploaded_bytes),
            ("files-added", self.files_added),
            ("session-count", self.session_count),
            ("seconds-active", self.seconds_active),
        ]
    }
}

/// Monotonic generator for session-unique tags (tier ids, request tags).
#[derive(Debug, Default)]
pub struct TagGenerator {
    next: AtomicU64,
}

impl TagGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix() {
        let id = random_peer_id();
        assert_eq!(&id.0[..8], b"-BS0100-");
        assert!(id.0[8..].iter().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn stats_entries_keys() {
        let mut stats = SessionStats::default();
        stats.add_downloaded(10);
        stats.add_uploaded(4);
        let entries = stats.entries();
        assert_eq!(entries[0], ("downloaded-bytes", 10));
        assert_eq!(entries[1], ("uploaded-bytes", 4));
    }

    #[test]
    fn tags_are_unique_and_increasing() {
        let generator = TagGenerator::new();
        let a = generator.next();
        let b = generator.next();
        assert!(b > a);
    }
}
