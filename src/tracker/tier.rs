//! Trackers and tiers (BEP-12 multitracker).
//!
//! A tier is an ordered failover group of trackers. Each tier owns an
//! announce-event queue with collapse rules that keep it canonical: no
//! consecutive duplicates, no trailing periodic re-announces, and a
//! `stopped` always wipes whatever it supersedes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng as _;
use tracing::debug;

use crate::constants::{
    DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_SCRAPE_INTERVAL, MIN_ANNOUNCE_INTERVAL,
    MIN_ANNOUNCE_MIN_INTERVAL, SCRAPE_ALIGNMENT,
};
use crate::tracker::response::TrackerEvent;

/// One announce URL within a tier.
#[derive(Debug, Clone)]
pub struct Tracker {
    /// Session-unique, stable for the torrent's lifetime.
    pub id: u64,
    pub announce_url: String,
    /// Derived per the scrape convention; `None` when underivable.
    pub scrape_url: Option<String>,
    /// `host:port` lookup key, shared by multiscrape batching.
    pub host_key: String,

    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub downloads: Option<u32>,
    pub tracker_id: Option<String>,
    pub consecutive_failures: u32,
}

impl Tracker {
    pub fn new(id: u64, announce_url: String) -> Self {
        let scrape_url = derive_scrape_url(&announce_url);
        let host_key = host_key(&announce_url);
        Self {
            id,
            announce_url,
            scrape_url,
            host_key,
            seeders: None,
            leechers: None,
            downloads: None,
            tracker_id: None,
            consecutive_failures: 0,
        }
    }

    /// Seconds until the next retry after `consecutive_failures`
    /// attempts went bad.
    pub fn retry_interval(&self) -> Duration {
        let secs = match self.consecutive_failures {
            0 => 0,
            1 => 20,
            2 => 60 * 5 + jitter(),
            3 => 60 * 15 + jitter(),
            4 => 60 * 30 + jitter(),
            5 => 60 * 60 + jitter(),
            _ => 60 * 120 + jitter(),
        };
        Duration::from_secs(secs)
    }
}

fn jitter() -> u64 {
    rand::rng().random_range(0..60)
}

/// The scrape convention: the last path component must begin with
/// `announce`, which is swapped for `scrape`.
pub fn derive_scrape_url(announce_url: &str) -> Option<String> {
    let slash = announce_url.rfind('/')?;
    let tail = &announce_url[slash + 1..];
    if !tail.starts_with("announce") {
        return None;
    }
    let mut url = String::with_capacity(announce_url.len());
    url.push_str(&announce_url[..slash + 1]);
    url.push_str("scrape");
    url.push_str(&tail["announce".len()..]);
    Some(url)
}

/// `host:port` portion of a tracker URL, lowercased.
pub fn host_key(url: &str) -> String {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    rest.split('/').next().unwrap_or(rest).to_ascii_lowercase()
}

/// Accumulated transfer totals since the last acknowledged `stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounts {
    pub uploaded: u64,
    pub downloaded: u64,
    pub corrupt: u64,
}

#[derive(Debug)]
pub struct Tier {
    pub id: u64,
    trackers: Vec<Tracker>,
    current: usize,

    events: VecDeque<TrackerEvent>,

    pub announce_at: Option<Instant>,
    pub scrape_at: Option<Instant>,
    pub manual_announce_allowed_at: Option<Instant>,
    pub last_announce_at: Option<Instant>,
    pub last_scrape_at: Option<Instant>,

    pub is_running: bool,
    pub is_announcing: bool,
    pub is_scraping: bool,
    pub last_succeeded: bool,
    pub last_timed_out: bool,

    pub announce_interval: Duration,
    pub announce_min_interval: Duration,
    pub scrape_interval: Duration,

    pub byte_counts: ByteCounts,
    pub last_error: Option<String>,
}

impl Tier {
    pub fn new(id: u64, trackers: Vec<Tracker>) -> Self {
        Self {
            id,
            trackers,
            current: 0,
            events: VecDeque::new(),
            announce_at: None,
            scrape_at: None,
            manual_announce_allowed_at: None,
            last_announce_at: None,
            last_scrape_at: None,
            is_running: false,
            is_announcing: false,
            is_scraping: false,
            last_succeeded: false,
            last_timed_out: false,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            announce_min_interval: MIN_ANNOUNCE_MIN_INTERVAL,
            scrape_interval: DEFAULT_SCRAPE_INTERVAL,
            byte_counts: ByteCounts::default(),
            last_error: None,
        }
    }

    pub fn trackers(&self) -> &[Tracker] {
        &self.trackers
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    pub fn current_tracker(&self) -> Option<&Tracker> {
        self.trackers.get(self.current)
    }

    pub fn current_tracker_mut(&mut self) -> Option<&mut Tracker> {
        self.trackers.get_mut(self.current)
    }

    /// Fails over to the next tracker in the tier, wrapping around.
    pub fn advance_tracker(&mut self) {
        if !self.trackers.is_empty() {
            self.current = (self.current + 1) % self.trackers.len();
            debug!(
                target: "tracker",
                tier = self.id,
                url = %self.trackers[self.current].announce_url,
                "tier failing over"
            );
        }
    }

    /// Queues `event` to fire at `fire_at`, applying the collapse rules:
    /// a `stopped` wipes everything except a queued `completed`; a fresh
    /// lifecycle event supersedes a pending `stopped`; trailing `none`s
    /// and trailing duplicates of `event` are stripped. The queue stays
    /// canonical: `none` and `stopped` only ever sit at the tail.
    pub fn push_event(&mut self, event: TrackerEvent, fire_at: Instant) {
        if event == TrackerEvent::None && self.events.back() == Some(&TrackerEvent::Stopped) {
            // Nothing to re-announce after a goodbye.
            return;
        }
        if !self.events.is_empty() {
            if event == TrackerEvent::Stopped {
                let had_completed = self.events.contains(&TrackerEvent::Completed);
                self.events.clear();
                if had_completed {
                    self.events.push_back(TrackerEvent::Completed);
                }
            } else {
                // A restart makes a queued goodbye moot.
                self.events.retain(|e| *e != TrackerEvent::Stopped);
            }
            while self.events.back() == Some(&TrackerEvent::None) {
                self.events.pop_back();
            }
            while self.events.back() == Some(&event) {
                self.events.pop_back();
            }
        }
        self.events.push_back(event);
        self.announce_at = Some(fire_at);
    }

    pub fn pop_event(&mut self) -> Option<TrackerEvent> {
        self.events.pop_front()
    }

    pub fn peek_event(&self) -> Option<TrackerEvent> {
        self.events.front().copied()
    }

    pub fn events(&self) -> impl Iterator<Item = TrackerEvent> + '_ {
        self.events.iter().copied()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Queue priority: the strongest event waiting.
    pub fn priority(&self) -> TrackerEvent {
        self.events
            .iter()
            .copied()
            .max()
            .unwrap_or(TrackerEvent::None)
    }

    /// Whether this tier wants to announce at `now`.
    pub fn announce_due(&self, now: Instant) -> bool {
        !self.is_announcing
            && !self.is_scraping
            && self.has_events()
            && self.announce_at.is_some_and(|t| t <= now)
    }

    /// Whether this tier wants to scrape at `now`.
    pub fn scrape_due(&self, now: Instant) -> bool {
        !self.is_announcing
            && !self.is_scraping
            && self
                .current_tracker()
                .is_some_and(|t| t.scrape_url.is_some())
            && self.scrape_at.is_some_and(|t| t <= now)
    }

    /// Applies tracker-supplied interval bounds.
    pub fn set_intervals(&mut self, interval: Option<u32>, min_interval: Option<u32>) {
        if let Some(secs) = interval {
            self.announce_interval =
                Duration::from_secs(u64::from(secs)).max(MIN_ANNOUNCE_INTERVAL);
        }
        if let Some(secs) = min_interval {
            self.announce_min_interval =
                Duration::from_secs(u64::from(secs)).max(MIN_ANNOUNCE_MIN_INTERVAL);
        }
    }

    /// Schedules the next scrape, aligned up to the next multiple of ten
    /// seconds past the epoch so concurrent tiers batch into one
    /// multiscrape.
    pub fn bump_scrape_time(&mut self, epoch: Instant, now: Instant, interval: Duration) {
        let elapsed = now.saturating_duration_since(epoch) + interval;
        let align = SCRAPE_ALIGNMENT.as_secs();
        let aligned = elapsed.as_secs().div_ceil(align) * align;
        self.scrape_at = Some(epoch + Duration::from_secs(aligned));
    }

    /// Clears transfer totals after a tracker acknowledged `stopped`.
    pub fn acknowledge_stop(&mut self) {
        self.byte_counts = ByteCounts::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrape_url_derivation() {
        assert_eq!(
            derive_scrape_url("http://example.com/announce").as_deref(),
            Some("http://example.com/scrape")
        );
        assert_eq!(
            derive_scrape_url("http://example.com/announce.php?pass=1").as_deref(),
            Some("http://example.com/scrape.php?pass=1")
        );
        assert_eq!(derive_scrape_url("http://example.com/a"), None);
    }

    #[test]
    fn host_keys_are_lowercased_host_port() {
        assert_eq!(host_key("udp://Tracker.Example.COM:6969/announce"), "tracker.example.com:6969");
        assert_eq!(host_key("http://example.com/announce"), "example.com");
    }
}
