//! The session announcer.
//!
//! Owns every torrent's tier list, decides when each tier announces and
//! scrapes, batches multiscrapes per URL, and throttles the work done in
//! any one upkeep pulse. Transports hand results back by tag; swarm-
//! facing output (peers, counts, errors) is drained via `poll_events`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::{
    MAX_ANNOUNCES_PER_UPKEEP, MAX_SCRAPES_PER_UPKEEP, MULTISCRAPE_MAX, MULTISCRAPE_STEP, NUMWANT,
};
use crate::session::TagGenerator;
use crate::torrent::{InfoHash, PeerId, TorrentId, TorrentView};
use crate::tracker::error::TrackerError;
use crate::tracker::http::{HttpTracker, ResponseDecoder};
use crate::tracker::response::{
    udp_host_key, AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse, TrackerEvent,
};
use crate::tracker::tier::{Tier, Tracker};
use crate::tracker::udp::{UdpCommand, UdpCompletion, UdpFailure, UdpTrackerTransport};

/// Which transport a command rides on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerScheme {
    Http,
    Udp { host: String },
}

/// Work the announcer wants a transport to perform.
///
/// A `tag` of `None` is fire-and-forget: no response is expected and no
/// completion should be reported.
#[derive(Debug)]
pub enum TrackerCommand {
    Announce {
        tag: Option<u64>,
        scheme: TrackerScheme,
        request: AnnounceRequest,
    },
    Scrape {
        tag: u64,
        scheme: TrackerScheme,
        request: ScrapeRequest,
    },
}

/// Results surfaced to the swarm layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnouncerEvent {
    /// Fresh peer addresses from a tracker (fed to the atom pool).
    Peers {
        torrent: TorrentId,
        peers: Vec<SocketAddr>,
    },
    Counts {
        torrent: TorrentId,
        seeders: Option<u32>,
        leechers: Option<u32>,
    },
    /// An announce error; published only for single-tracker torrents.
    Error {
        torrent: TorrentId,
        message: String,
    },
    Warning {
        torrent: TorrentId,
        message: String,
    },
}

struct TorrentTrackers {
    view: Arc<dyn TorrentView>,
    tiers: Vec<Tier>,
}

impl TorrentTrackers {
    fn tracker_count(&self) -> usize {
        self.tiers.iter().map(Tier::tracker_count).sum()
    }

    fn tier_mut(&mut self, tier_id: u64) -> Option<&mut Tier> {
        self.tiers.iter_mut().find(|t| t.id == tier_id)
    }
}

struct ScrapeInfo {
    multiscrape_max: usize,
}

struct AnnounceContext {
    torrent: TorrentId,
    tier_id: u64,
    event: TrackerEvent,
    is_running_on_success: bool,
}

struct ScrapeContext {
    url: String,
    /// (torrent, tier, info-hash) triples batched into the request.
    entries: Vec<(TorrentId, u64, InfoHash)>,
}

struct StopEntry {
    volume: u64,
    info_hash: InfoHash,
    url: String,
    request: AnnounceRequest,
}

pub struct Announcer {
    peer_id: PeerId,
    port: u16,
    /// Random per-session announce key.
    key: u32,
    scrape_paused_torrents: bool,

    epoch: Instant,
    tags: TagGenerator,

    torrents: BTreeMap<TorrentId, TorrentTrackers>,
    scrape_info: HashMap<String, ScrapeInfo>,
    stops: Vec<StopEntry>,

    pending_announces: HashMap<u64, AnnounceContext>,
    pending_scrapes: HashMap<u64, ScrapeContext>,

    events: VecDeque<AnnouncerEvent>,
}

impl Announcer {
    pub fn new(peer_id: PeerId, port: u16, scrape_paused_torrents: bool, now: Instant) -> Self {
        Self {
            peer_id,
            port,
            key: rand::rng().random(),
            scrape_paused_torrents,
            epoch: now,
            tags: TagGenerator::new(),
            torrents: BTreeMap::new(),
            scrape_info: HashMap::new(),
            stops: Vec::new(),
            pending_announces: HashMap::new(),
            pending_scrapes: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    /// Registers a torrent with its BEP-12 announce list (outer Vec =
    /// tiers, inner = failover URLs within the tier).
    pub fn add_torrent(
        &mut self,
        id: TorrentId,
        view: Arc<dyn TorrentView>,
        announce_list: &[Vec<String>],
        now: Instant,
    ) {
        let mut tiers = Vec::with_capacity(announce_list.len());
        for urls in announce_list {
            let trackers: Vec<Tracker> = urls
                .iter()
                .map(|url| Tracker::new(self.tags.next(), url.clone()))
                .collect();
            if trackers.is_empty() {
                continue;
            }
            let mut tier = Tier::new(self.tags.next(), trackers);
            tier.scrape_at = Some(now);
            tiers.push(tier);
        }
        self.torrents.insert(id, TorrentTrackers { view, tiers });
    }

    /// Unregisters a torrent. Running tiers contribute a fire-and-forget
    /// `stopped` announce to the stops set.
    pub fn remove_torrent(&mut self, id: TorrentId) {
        let Some(state) = self.torrents.remove(&id) else {
            return;
        };
        for tier in &state.tiers {
            if !tier.is_running {
                continue;
            }
            let Some(tracker) = tier.current_tracker() else {
                continue;
            };
            let request = build_announce_request(
                self.peer_id,
                self.port,
                self.key,
                &state.view,
                tier,
                tracker,
                TrackerEvent::Stopped,
            );
            self.stops.push(StopEntry {
                volume: request.uploaded + request.downloaded,
                info_hash: request.info_hash,
                url: request.url.clone(),
                request,
            });
        }
    }

    pub fn torrent_started(&mut self, id: TorrentId, now: Instant) {
        self.push_to_all_tiers(id, TrackerEvent::Started, now, true);
    }

    pub fn torrent_stopped(&mut self, id: TorrentId, now: Instant) {
        self.push_to_all_tiers(id, TrackerEvent::Stopped, now, false);
    }

    pub fn torrent_completed(&mut self, id: TorrentId, now: Instant) {
        self.push_to_all_tiers(id, TrackerEvent::Completed, now, true);
    }

    /// User-driven re-announce; honors the tracker's minimum interval.
    pub fn manual_announce(&mut self, id: TorrentId, now: Instant) {
        let Some(state) = self.torrents.get_mut(&id) else {
            return;
        };
        for tier in &mut state.tiers {
            let allowed = tier
                .manual_announce_allowed_at
                .map_or(true, |t| t <= now);
            if allowed {
                tier.push_event(TrackerEvent::None, now);
            }
        }
    }

    /// Accumulates transfer totals reported in subsequent announces.
    pub fn credit_bytes(&mut self, id: TorrentId, uploaded: u64, downloaded: u64, corrupt: u64) {
        if let Some(state) = self.torrents.get_mut(&id) {
            for tier in &mut state.tiers {
                tier.byte_counts.uploaded += uploaded;
                tier.byte_counts.downloaded += downloaded;
                tier.byte_counts.corrupt += corrupt;
            }
        }
    }

    fn push_to_all_tiers(
        &mut self,
        id: TorrentId,
        event: TrackerEvent,
        now: Instant,
        running: bool,
    ) {
        if let Some(state) = self.torrents.get_mut(&id) {
            for tier in &mut state.tiers {
                // A stop leaves is_running set until the tracker
                // acknowledges it.
                if running {
                    tier.is_running = true;
                }
                tier.push_event(event, now);
            }
        }
    }

    /// Queued announcer events since the last poll.
    pub fn poll_events(&mut self) -> Vec<AnnouncerEvent> {
        self.events.drain(..).collect()
    }

    /// True when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.stops.is_empty()
            && self.pending_announces.is_empty()
            && self.pending_scrapes.is_empty()
    }

    // ------------------------------------------------------------------
    // Upkeep
    // ------------------------------------------------------------------

    /// The 500 ms pulse: flush stops, start due announces (highest queue
    /// priority first, throttled), then batch due scrapes.
    pub fn upkeep(&mut self, now: Instant) -> Vec<TrackerCommand> {
        let mut commands = Vec::new();
        self.flush_stops(&mut commands);
        self.start_announces(&mut commands, now);
        self.start_scrapes(&mut commands, now);
        commands
    }

    fn flush_stops(&mut self, commands: &mut Vec<TrackerCommand>) {
        if self.stops.is_empty() {
            return;
        }
        // Biggest sessions say goodbye first.
        self.stops.sort_by(|a, b| {
            b.volume
                .cmp(&a.volume)
                .then_with(|| a.info_hash.cmp(&b.info_hash))
                .then_with(|| a.url.cmp(&b.url))
        });
        for stop in self.stops.drain(..) {
            let Some(scheme) = scheme_for(&stop.url) else {
                continue;
            };
            commands.push(TrackerCommand::Announce {
                tag: None,
                scheme,
                request: stop.request,
            });
        }
    }

    fn start_announces(&mut self, commands: &mut Vec<TrackerCommand>, now: Instant) {
        // (priority desc, torrent, tier) of every due tier.
        let mut due: Vec<(TrackerEvent, TorrentId, u64)> = Vec::new();
        for (&id, state) in &self.torrents {
            for tier in &state.tiers {
                if tier.announce_due(now) {
                    due.push((tier.priority(), id, tier.id));
                }
            }
        }
        due.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        due.truncate(MAX_ANNOUNCES_PER_UPKEEP);

        for (_, id, tier_id) in due {
            let tag = self.tags.next();
            let Some(state) = self.torrents.get_mut(&id) else {
                continue;
            };
            let view = state.view.clone();
            let Some(tier) = state.tier_mut(tier_id) else {
                continue;
            };
            let Some(event) = tier.pop_event() else {
                continue;
            };
            // Anything still queued fires as soon as this one resolves;
            // an emptied queue is re-armed by the response handler.
            tier.announce_at = if tier.has_events() { Some(now) } else { None };

            let Some(tracker) = tier.current_tracker() else {
                continue;
            };
            let request = build_announce_request(
                self.peer_id,
                self.port,
                self.key,
                &view,
                tier,
                tracker,
                event,
            );
            let Some(scheme) = scheme_for(&request.url) else {
                warn!(target: "tracker", url = %request.url, "unsupported tracker scheme");
                continue;
            };
            tier.is_announcing = true;
            debug!(target: "tracker", tier = tier.id, ?event, url = %request.url, "announcing");
            self.pending_announces.insert(
                tag,
                AnnounceContext {
                    torrent: id,
                    tier_id,
                    event,
                    is_running_on_success: event != TrackerEvent::Stopped,
                },
            );
            commands.push(TrackerCommand::Announce {
                tag: Some(tag),
                scheme,
                request,
            });
        }
    }

    fn start_scrapes(&mut self, commands: &mut Vec<TrackerCommand>, now: Instant) {
        struct Batch {
            url: String,
            entries: Vec<(TorrentId, u64, InfoHash)>,
        }
        let mut batches: Vec<Batch> = Vec::new();

        let scrape_paused = self.scrape_paused_torrents;
        for (&id, state) in &mut self.torrents {
            if !scrape_paused && !state.view.is_running() {
                continue;
            }
            let info_hash = state.view.info_hash();
            for tier in &mut state.tiers {
                if !tier.scrape_due(now) {
                    continue;
                }
                let Some(url) = tier.current_tracker().and_then(|t| t.scrape_url.clone()) else {
                    continue;
                };
                let max = self
                    .scrape_info
                    .entry(url.clone())
                    .or_insert(ScrapeInfo {
                        multiscrape_max: MULTISCRAPE_MAX,
                    })
                    .multiscrape_max;

                let slot = batches
                    .iter()
                    .position(|b| b.url == url && b.entries.len() < max);
                match slot {
                    Some(idx) => {
                        batches[idx].entries.push((id, tier.id, info_hash));
                        tier.is_scraping = true;
                    }
                    None if batches.len() < MAX_SCRAPES_PER_UPKEEP => {
                        batches.push(Batch {
                            url,
                            entries: vec![(id, tier.id, info_hash)],
                        });
                        tier.is_scraping = true;
                    }
                    None => {}
                }
            }
        }

        for batch in batches {
            let Some(scheme) = scheme_for(&batch.url) else {
                continue;
            };
            let tag = self.tags.next();
            let request = ScrapeRequest {
                url: batch.url.clone(),
                info_hashes: batch.entries.iter().map(|&(_, _, h)| h).collect(),
            };
            debug!(
                target: "tracker",
                url = %batch.url,
                hashes = request.info_hashes.len(),
                "scraping"
            );
            self.pending_scrapes.insert(
                tag,
                ScrapeContext {
                    url: batch.url,
                    entries: batch.entries,
                },
            );
            commands.push(TrackerCommand::Scrape {
                tag,
                scheme,
                request,
            });
        }
    }

    // ------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------

    pub fn on_announce_response(
        &mut self,
        tag: u64,
        result: Result<AnnounceResponse, TrackerError>,
        now: Instant,
    ) {
        let Some(ctx) = self.pending_announces.remove(&tag) else {
            return;
        };
        let Some(state) = self.torrents.get_mut(&ctx.torrent) else {
            return;
        };
        let single_tracker = state.tracker_count() == 1;
        let Some(tier) = state.tier_mut(ctx.tier_id) else {
            return;
        };

        tier.is_announcing = false;
        tier.last_announce_at = Some(now);

        match result {
            Ok(response) => {
                tier.last_succeeded = true;
                tier.last_timed_out = false;
                tier.last_error = None;
                tier.set_intervals(response.interval, response.min_interval);
                tier.is_running = ctx.is_running_on_success;
                let min_interval = tier.announce_min_interval;
                tier.manual_announce_allowed_at = Some(now + min_interval);

                let has_scrape_fields = response.seeders.is_some()
                    && response.leechers.is_some()
                    && response.downloads.is_some();
                if let Some(tracker) = tier.current_tracker_mut() {
                    tracker.consecutive_failures = 0;
                    if response.seeders.is_some() {
                        tracker.seeders = response.seeders;
                    }
                    if response.leechers.is_some() {
                        tracker.leechers = response.leechers;
                    }
                    if response.downloads.is_some() {
                        tracker.downloads = response.downloads;
                    }
                    if let Some(id) = &response.tracker_id {
                        tracker.tracker_id = Some(id.clone());
                    }
                }
                if ctx.event == TrackerEvent::Stopped {
                    tier.acknowledge_stop();
                } else if !tier.has_events() {
                    // Keep the periodic cycle alive at the interval the
                    // tracker just gave us.
                    let interval = tier.announce_interval;
                    tier.push_event(TrackerEvent::None, now + interval);
                }
                if has_scrape_fields {
                    // No point scraping soon after a scrape-grade answer.
                    let interval = tier.scrape_interval;
                    tier.bump_scrape_time(self.epoch, now, interval);
                }

                let mut peers = response.peers;
                peers.extend(response.peers6);
                if !peers.is_empty() {
                    self.events.push_back(AnnouncerEvent::Peers {
                        torrent: ctx.torrent,
                        peers,
                    });
                }
                self.events.push_back(AnnouncerEvent::Counts {
                    torrent: ctx.torrent,
                    seeders: response.seeders,
                    leechers: response.leechers,
                });
                if let Some(message) = response.warning {
                    self.events.push_back(AnnouncerEvent::Warning {
                        torrent: ctx.torrent,
                        message,
                    });
                }
            }
            Err(error) => {
                let message = error.to_string();
                tier.last_succeeded = false;
                tier.last_timed_out = error.is_timeout();
                tier.last_error = Some(message.clone());

                let retry = tier
                    .current_tracker_mut()
                    .map(|tracker| {
                        tracker.consecutive_failures += 1;
                        tracker.retry_interval()
                    })
                    .unwrap_or_default();
                tier.advance_tracker();
                tier.push_event(ctx.event, now + retry);
                info!(
                    target: "tracker",
                    tier = tier.id,
                    %message,
                    retry_secs = retry.as_secs(),
                    "announce failed"
                );

                // Many-tracker torrents fail over quietly.
                if single_tracker {
                    self.events.push_back(AnnouncerEvent::Error {
                        torrent: ctx.torrent,
                        message,
                    });
                }
            }
        }
    }

    pub fn on_scrape_response(
        &mut self,
        tag: u64,
        result: Result<ScrapeResponse, TrackerError>,
        now: Instant,
    ) {
        let Some(ctx) = self.pending_scrapes.remove(&tag) else {
            return;
        };

        match result {
            Ok(response) => {
                for &(torrent, tier_id, info_hash) in &ctx.entries {
                    let Some(state) = self.torrents.get_mut(&torrent) else {
                        continue;
                    };
                    let Some(tier) = state.tier_mut(tier_id) else {
                        continue;
                    };
                    tier.is_scraping = false;
                    tier.last_scrape_at = Some(now);

                    if let Some(min) = response.min_request_interval {
                        tier.scrape_interval =
                            tier.scrape_interval.max(std::time::Duration::from_secs(min.into()));
                    }
                    let interval = tier.scrape_interval;
                    tier.bump_scrape_time(self.epoch, now, interval);

                    let row = response.rows.iter().find(|r| r.info_hash == info_hash);
                    if let Some(row) = row {
                        if let Some(tracker) = tier.current_tracker_mut() {
                            tracker.consecutive_failures = 0;
                            tracker.seeders = Some(row.seeders);
                            tracker.leechers = Some(row.leechers);
                            tracker.downloads = Some(row.completed);
                        }
                        self.events.push_back(AnnouncerEvent::Counts {
                            torrent,
                            seeders: Some(row.seeders),
                            leechers: Some(row.leechers),
                        });
                    }
                }
            }
            Err(error) => {
                let message = error.to_string();
                let too_big = multiscrape_too_big(&message);
                if too_big {
                    self.shrink_multiscrape(&ctx.url, ctx.entries.len());
                }
                for &(torrent, tier_id, _) in &ctx.entries {
                    let Some(state) = self.torrents.get_mut(&torrent) else {
                        continue;
                    };
                    let Some(tier) = state.tier_mut(tier_id) else {
                        continue;
                    };
                    tier.is_scraping = false;
                    if too_big {
                        // Re-batch under the shrunk bound right away.
                        tier.scrape_at = Some(now);
                    } else {
                        let retry = tier
                            .current_tracker_mut()
                            .map(|tracker| {
                                tracker.consecutive_failures += 1;
                                tracker.retry_interval()
                            })
                            .unwrap_or_default();
                        tier.scrape_at = Some(now + retry);
                    }
                    // Scrape failures stay off the event stream.
                }
                debug!(target: "tracker", url = %ctx.url, %message, too_big, "scrape failed");
            }
        }
    }

    /// Handles a tracker rejecting a batch as too long: shrink that
    /// URL's bound by one step, unless a concurrent response already
    /// shrank it further.
    fn shrink_multiscrape(&mut self, url: &str, row_count: usize) {
        let Some(info) = self.scrape_info.get_mut(url) else {
            return;
        };
        if info.multiscrape_max < row_count {
            return;
        }
        let n = info.multiscrape_max.saturating_sub(MULTISCRAPE_STEP).max(1);
        if info.multiscrape_max != n {
            info!(target: "tracker", url, n, "reducing multiscrape max");
            info.multiscrape_max = n;
        }
    }

    /// Current multiscrape bound for a scrape URL.
    pub fn multiscrape_max(&self, url: &str) -> usize {
        self.scrape_info
            .get(url)
            .map_or(MULTISCRAPE_MAX, |i| i.multiscrape_max)
    }

    #[cfg(test)]
    pub(crate) fn set_multiscrape_max(&mut self, url: &str, n: usize) {
        self.scrape_info
            .insert(url.to_owned(), ScrapeInfo { multiscrape_max: n });
    }
}

/// Marker strings trackers use to reject an over-long scrape URL.
fn multiscrape_too_big(message: &str) -> bool {
    ["Bad Request", "GET string too long", "Request-URI Too Long"]
        .iter()
        .any(|marker| message.contains(marker))
}

fn scheme_for(url: &str) -> Option<TrackerScheme> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Some(TrackerScheme::Http)
    } else if let Some(host) = udp_host_key(url) {
        Some(TrackerScheme::Udp { host })
    } else {
        None
    }
}

fn build_announce_request(
    peer_id: PeerId,
    port: u16,
    key: u32,
    view: &Arc<dyn TorrentView>,
    tier: &Tier,
    tracker: &Tracker,
    event: TrackerEvent,
) -> AnnounceRequest {
    AnnounceRequest {
        url: tracker.announce_url.clone(),
        info_hash: view.info_hash(),
        peer_id,
        port,
        key,
        uploaded: tier.byte_counts.uploaded,
        downloaded: tier.byte_counts.downloaded,
        corrupt: tier.byte_counts.corrupt,
        left: view.bytes_left(),
        event,
        numwant: if event == TrackerEvent::Stopped {
            0
        } else {
            NUMWANT
        },
        tracker_id: tracker.tracker_id.clone(),
    }
}

impl From<UdpFailure> for TrackerError {
    fn from(failure: UdpFailure) -> Self {
        if failure.did_timeout {
            TrackerError::Timeout
        } else if !failure.did_connect {
            TrackerError::ConnectionFailed
        } else {
            TrackerError::TrackerRejected(failure.message)
        }
    }
}

/// Glue task: drives upkeep, dispatches commands onto the HTTP client
/// and the UDP transport, routes responses back, and forwards events.
///
/// Runs until the event receiver is dropped.
pub async fn run<D: ResponseDecoder + 'static>(
    announcer: Arc<Mutex<Announcer>>,
    http: Arc<HttpTracker<D>>,
    events_tx: mpsc::UnboundedSender<AnnouncerEvent>,
) -> Result<(), TrackerError> {
    use crate::constants::{ANNOUNCER_UPKEEP_PERIOD, UDP_TRACKER_UPKEEP_PERIOD};

    enum Back {
        Announce(u64, Result<AnnounceResponse, TrackerError>),
        Scrape(u64, Result<ScrapeResponse, TrackerError>),
        Dns(String, Result<SocketAddr, String>),
    }

    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    let mut transport = UdpTrackerTransport::new();
    let (back_tx, mut back_rx) = mpsc::unbounded_channel::<Back>();

    let mut upkeep = tokio::time::interval(ANNOUNCER_UPKEEP_PERIOD);
    let mut udp_upkeep = tokio::time::interval(UDP_TRACKER_UPKEEP_PERIOD);
    upkeep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    udp_upkeep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut recv_buf = vec![0u8; 4096];

    loop {
        if events_tx.is_closed() {
            return Ok(());
        }

        tokio::select! {
            _ = upkeep.tick() => {
                let commands = announcer.lock().upkeep(Instant::now());
                for command in commands {
                    dispatch(command, &http, &mut transport, &back_tx);
                }
            }
            _ = udp_upkeep.tick() => {
                let now = Instant::now();
                for command in transport.upkeep(now) {
                    match command {
                        UdpCommand::Resolve { host } => {
                            let back_tx = back_tx.clone();
                            tokio::spawn(async move {
                                let result = tokio::net::lookup_host(&host)
                                    .await
                                    .map_err(|e| e.to_string())
                                    .and_then(|mut addrs| {
                                        addrs.next().ok_or_else(|| "no address".to_owned())
                                    });
                                let _ = back_tx.send(Back::Dns(host, result));
                            });
                        }
                        UdpCommand::Send { to, payload } => {
                            let _ = socket.send_to(&payload, to).await;
                        }
                    }
                }
            }
            result = socket.recv_from(&mut recv_buf) => {
                if let Ok((n, _from)) = result {
                    transport.handle_message(&recv_buf[..n], Instant::now());
                }
            }
            Some(back) = back_rx.recv() => {
                let now = Instant::now();
                match back {
                    Back::Announce(tag, result) => {
                        announcer.lock().on_announce_response(tag, result, now);
                    }
                    Back::Scrape(tag, result) => {
                        announcer.lock().on_scrape_response(tag, result, now);
                    }
                    Back::Dns(host, result) => {
                        transport.on_dns(&host, result, now);
                    }
                }
            }
        }

        // Drain UDP completions and surface announcer events.
        {
            let now = Instant::now();
            let mut guard = announcer.lock();
            for (tag, completion) in transport.poll_completions() {
                match completion {
                    UdpCompletion::Announce(result) => {
                        guard.on_announce_response(tag, result.map_err(Into::into), now);
                    }
                    UdpCompletion::Scrape(result) => {
                        guard.on_scrape_response(tag, result.map_err(Into::into), now);
                    }
                }
            }
            for event in guard.poll_events() {
                if events_tx.send(event).is_err() {
                    return Ok(());
                }
            }
        }
    }

    fn dispatch<D: ResponseDecoder + 'static>(
        command: TrackerCommand,
        http: &Arc<HttpTracker<D>>,
        transport: &mut UdpTrackerTransport,
        back_tx: &mpsc::UnboundedSender<Back>,
    ) {
        let now = Instant::now();
        match command {
            TrackerCommand::Announce {
                tag,
                scheme,
                request,
            } => match scheme {
                TrackerScheme::Http => {
                    let http = http.clone();
                    let back_tx = back_tx.clone();
                    tokio::spawn(async move {
                        let result = http.announce(&request).await;
                        if let Some(tag) = tag {
                            let _ = back_tx.send(Back::Announce(tag, result));
                        }
                    });
                }
                TrackerScheme::Udp { host } => {
                    transport.announce(tag, host, request, now);
                }
            },
            TrackerCommand::Scrape {
                tag,
                scheme,
                request,
            } => match scheme {
                TrackerScheme::Http => {
                    let http = http.clone();
                    let back_tx = back_tx.clone();
                    tokio::spawn(async move {
                        let result = http.scrape(&request).await;
                        let _ = back_tx.send(Back::Scrape(tag, result));
                    });
                }
                TrackerScheme::Udp { host } => {
                    transport.scrape(Some(tag), host, request, now);
                }
            },
        }
    }
}
