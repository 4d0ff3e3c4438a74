//! Tracker-side invariants and end-to-end scenarios.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BufMut;
use rand::Rng as _;

use crate::constants::{MULTISCRAPE_MAX, UDP_TRACKER_MAGIC};
use crate::session::random_peer_id;
use crate::swarm::tests::FakeTorrent;
use crate::torrent::TorrentId;
use crate::tracker::announcer::{Announcer, AnnouncerEvent, TrackerCommand, TrackerScheme};
use crate::tracker::error::TrackerError;
use crate::tracker::response::{AnnounceRequest, TrackerEvent};
use crate::tracker::tier::Tier;
use crate::tracker::udp::{UdpCommand, UdpCompletion, UdpTrackerTransport};

const TORRENT: TorrentId = TorrentId(7);
const UDP_URL: &str = "udp://tracker.example.com:6969/announce";
const HTTP_URL: &str = "http://tracker.example.com/announce";

fn announcer(now: Instant) -> Announcer {
    Announcer::new(random_peer_id(), 51413, true, now)
}

fn add_single_tracker_torrent(announcer: &mut Announcer, url: &str, now: Instant) {
    let view = FakeTorrent::new(4, 2, 10);
    announcer.add_torrent(TORRENT, view, &[vec![url.to_owned()]], now);
}

// ----------------------------------------------------------------------
// Event queue
// ----------------------------------------------------------------------

fn queue_of(tier: &Tier) -> Vec<TrackerEvent> {
    tier.events().collect()
}

#[test]
fn event_queue_collapse() {
    let now = Instant::now();
    let mut tier = Tier::new(0, vec![]);

    // none, started, none, completed, none, stopped
    for event in [
        TrackerEvent::None,
        TrackerEvent::Started,
        TrackerEvent::None,
        TrackerEvent::Completed,
        TrackerEvent::None,
        TrackerEvent::Stopped,
    ] {
        tier.push_event(event, now);
    }

    assert_eq!(
        queue_of(&tier),
        vec![TrackerEvent::Completed, TrackerEvent::Stopped]
    );
    assert_eq!(tier.priority(), TrackerEvent::Stopped);
}

#[test]
fn event_queue_stays_canonical_under_random_pushes() {
    let now = Instant::now();
    let events = [
        TrackerEvent::None,
        TrackerEvent::Completed,
        TrackerEvent::Started,
        TrackerEvent::Stopped,
    ];
    let mut rng = rand::rng();

    for _ in 0..50 {
        let mut tier = Tier::new(0, vec![]);
        for _ in 0..40 {
            tier.push_event(events[rng.random_range(0..events.len())], now);

            let queue = queue_of(&tier);
            for pair in queue.windows(2) {
                assert_ne!(pair[0], pair[1], "consecutive duplicates in {queue:?}");
            }
            for (i, event) in queue.iter().enumerate() {
                let is_last = i == queue.len() - 1;
                if *event == TrackerEvent::None {
                    assert!(is_last, "inner none in {queue:?}");
                }
                if *event == TrackerEvent::Stopped {
                    assert!(is_last, "stopped not last in {queue:?}");
                }
            }
        }
    }
}

#[test]
fn priority_is_the_strongest_queued_event() {
    let now = Instant::now();
    let mut tier = Tier::new(0, vec![]);
    assert_eq!(tier.priority(), TrackerEvent::None);
    tier.push_event(TrackerEvent::Started, now);
    tier.push_event(TrackerEvent::None, now);
    assert_eq!(tier.priority(), TrackerEvent::Started);
}

#[test]
fn scrape_times_align_to_ten_second_marks() {
    let epoch = Instant::now();
    let mut tier = Tier::new(0, vec![]);
    tier.bump_scrape_time(epoch, epoch + Duration::from_secs(13), Duration::from_secs(9));
    assert_eq!(tier.scrape_at, Some(epoch + Duration::from_secs(30)));
}

// ----------------------------------------------------------------------
// UDP transport
// ----------------------------------------------------------------------

fn tracker_addr() -> SocketAddr {
    "198.51.100.1:6969".parse().unwrap()
}

fn announce_request(url: &str) -> AnnounceRequest {
    AnnounceRequest {
        url: url.to_owned(),
        info_hash: crate::torrent::InfoHash([0x42; 20]),
        peer_id: random_peer_id(),
        port: 51413,
        key: 0x1234,
        uploaded: 0,
        downloaded: 0,
        corrupt: 0,
        left: 1000,
        event: TrackerEvent::Started,
        numwant: 80,
        tracker_id: None,
    }
}

/// Pulls the single datagram out of a command list.
fn sent_payload(commands: &[UdpCommand]) -> &[u8] {
    let sends: Vec<&Vec<u8>> = commands
        .iter()
        .filter_map(|c| match c {
            UdpCommand::Send { payload, .. } => Some(payload),
            UdpCommand::Resolve { .. } => None,
        })
        .collect();
    assert_eq!(sends.len(), 1);
    sends[0]
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
}

#[test]
fn udp_announce_round_trip() {
    let t0 = Instant::now();
    let mut transport = UdpTrackerTransport::new();
    let host = "tracker.example.com:6969".to_owned();

    transport.announce(Some(99), host.clone(), announce_request(UDP_URL), t0);

    // No address yet: upkeep asks for DNS.
    let commands = transport.upkeep(t0);
    assert_eq!(commands, vec![UdpCommand::Resolve { host: host.clone() }]);

    transport.on_dns(&host, Ok(tracker_addr()), t0);

    // With an address but no connection id, upkeep sends a CONNECT.
    let commands = transport.upkeep(t0);
    let connect = sent_payload(&commands);
    assert_eq!(connect.len(), 16);
    assert_eq!(
        u64::from_be_bytes(connect[..8].try_into().unwrap()),
        UDP_TRACKER_MAGIC
    );
    assert_eq!(u32_at(connect, 8), 0);
    let connect_tid = u32_at(connect, 12);

    // CONNECT response carries the connection id.
    let mut reply = Vec::new();
    reply.put_u32(0);
    reply.put_u32(connect_tid);
    reply.put_u64(0xDEAD_BEEF_CAFE_BABE);
    assert!(transport.handle_message(&reply, t0));

    // Now the queued announce goes out under that connection id.
    let commands = transport.upkeep(t0);
    let announce = sent_payload(&commands);
    assert_eq!(announce.len(), 98);
    assert_eq!(
        u64::from_be_bytes(announce[..8].try_into().unwrap()),
        0xDEAD_BEEF_CAFE_BABE
    );
    assert_eq!(u32_at(announce, 8), 1);
    let announce_tid = u32_at(announce, 12);
    assert_eq!(&announce[16..36], &[0x42; 20]);
    // event, key, numwant, port at their fixed offsets
    assert_eq!(u32_at(announce, 80), 2);
    assert_eq!(u32_at(announce, 88), 0x1234);
    assert_eq!(u32_at(announce, 92) as i32, 80);
    assert_eq!(
        u16::from_be_bytes(announce[96..98].try_into().unwrap()),
        51413
    );

    // ANNOUNCE response: interval=1800, leechers=3, seeders=7, two peers.
    let mut reply = Vec::new();
    reply.put_u32(1);
    reply.put_u32(announce_tid);
    reply.put_u32(1800);
    reply.put_u32(3);
    reply.put_u32(7);
    reply.put_slice(&[192, 0, 2, 1, 0x1a, 0xe1]);
    reply.put_slice(&[192, 0, 2, 2, 0x1a, 0xe2]);
    assert!(transport.handle_message(&reply, t0));

    let mut completions = transport.poll_completions();
    assert_eq!(completions.len(), 1);
    let (tag, completion) = completions.remove(0);
    assert_eq!(tag, 99);
    let response = match completion {
        UdpCompletion::Announce(Ok(response)) => response,
        other => panic!("unexpected completion: {other:?}"),
    };
    assert_eq!(response.interval, Some(1800));
    assert_eq!(response.leechers, Some(3));
    assert_eq!(response.seeders, Some(7));
    assert_eq!(
        response.peers,
        vec![
            "192.0.2.1:6881".parse::<SocketAddr>().unwrap(),
            "192.0.2.2:6882".parse::<SocketAddr>().unwrap(),
        ]
    );
    assert!(transport.is_idle());
}

#[test]
fn udp_transaction_ids_are_unique_in_flight() {
    let t0 = Instant::now();
    let mut transport = UdpTrackerTransport::new();
    let host = "tracker.example.com:6969".to_owned();

    for i in 0..8 {
        transport.announce(Some(i), host.clone(), announce_request(UDP_URL), t0);
    }
    transport.on_dns(&host, Ok(tracker_addr()), t0);
    let connect = transport.upkeep(t0);
    let connect_tid = u32_at(sent_payload(&connect), 12);
    let mut reply = Vec::new();
    reply.put_u32(0);
    reply.put_u32(connect_tid);
    reply.put_u64(1);
    transport.handle_message(&reply, t0);

    let commands = transport.upkeep(t0);
    let mut tids = HashSet::new();
    for command in &commands {
        if let UdpCommand::Send { payload, .. } = command {
            assert!(tids.insert(u32_at(payload, 12)), "duplicate transaction id");
        }
    }
    assert_eq!(tids.len(), 8);
}

#[test]
fn udp_requests_time_out_after_sixty_seconds() {
    let t0 = Instant::now();
    let mut transport = UdpTrackerTransport::new();
    let host = "tracker.example.com:6969".to_owned();

    transport.announce(Some(5), host.clone(), announce_request(UDP_URL), t0);
    transport.on_dns(&host, Ok(tracker_addr()), t0);
    transport.upkeep(t0); // CONNECT goes out, no answer ever comes

    transport.upkeep(t0 + Duration::from_secs(61));
    let completions = transport.poll_completions();
    assert_eq!(completions.len(), 1);
    match &completions[0] {
        (5, UdpCompletion::Announce(Err(failure))) => {
            assert!(failure.did_timeout);
            assert!(!failure.did_connect);
        }
        other => panic!("unexpected completion: {other:?}"),
    }
    assert!(transport.is_idle());
}

#[test]
fn udp_unknown_transaction_ids_are_ignored() {
    let t0 = Instant::now();
    let mut transport = UdpTrackerTransport::new();
    let host = "tracker.example.com:6969".to_owned();
    transport.announce(Some(1), host.clone(), announce_request(UDP_URL), t0);

    let mut reply = Vec::new();
    reply.put_u32(1);
    reply.put_u32(0xabcd);
    reply.put_u32(1800);
    reply.put_u32(0);
    reply.put_u32(0);
    assert!(!transport.handle_message(&reply, t0));
    assert!(transport.poll_completions().is_empty());
}

#[test]
fn udp_shutdown_drains_with_grace() {
    let t0 = Instant::now();
    let mut transport = UdpTrackerTransport::new();
    let host = "tracker.example.com:6969".to_owned();
    transport.announce(Some(1), host.clone(), announce_request(UDP_URL), t0);
    assert!(!transport.is_idle());

    transport.start_shutdown(t0);
    // Within the grace window nothing is cancelled yet.
    transport.upkeep(t0 + Duration::from_secs(1));
    assert!(!transport.is_idle());

    transport.upkeep(t0 + Duration::from_secs(4));
    assert!(transport.is_idle());

    transport.close();
    assert!(transport.poll_completions().is_empty());
}

// ----------------------------------------------------------------------
// Announcer scheduling
// ----------------------------------------------------------------------

fn single_announce_command(commands: Vec<TrackerCommand>) -> (u64, TrackerScheme, AnnounceRequest) {
    let mut announces: Vec<(u64, TrackerScheme, AnnounceRequest)> = commands
        .into_iter()
        .filter_map(|c| match c {
            TrackerCommand::Announce {
                tag: Some(tag),
                scheme,
                request,
            } => Some((tag, scheme, request)),
            _ => None,
        })
        .collect();
    assert_eq!(announces.len(), 1);
    announces.remove(0)
}

#[test]
fn started_announce_round_trip_schedules_next() {
    let t0 = Instant::now();
    let mut announcer = announcer(t0);
    add_single_tracker_torrent(&mut announcer, UDP_URL, t0);
    announcer.torrent_started(TORRENT, t0);

    let (tag, scheme, request) = single_announce_command(announcer.upkeep(t0));
    assert_eq!(
        scheme,
        TrackerScheme::Udp {
            host: "tracker.example.com:6969".to_owned()
        }
    );
    assert_eq!(request.event, TrackerEvent::Started);
    assert_eq!(request.numwant, 80);

    let response = crate::tracker::response::AnnounceResponse {
        interval: Some(1800),
        leechers: Some(3),
        seeders: Some(7),
        peers: vec![
            "192.0.2.1:6881".parse().unwrap(),
            "192.0.2.2:6882".parse().unwrap(),
        ],
        ..Default::default()
    };
    announcer.on_announce_response(tag, Ok(response), t0);

    let events = announcer.poll_events();
    assert!(events.iter().any(|e| matches!(
        e,
        AnnouncerEvent::Peers { torrent, peers }
            if *torrent == TORRENT && peers.len() == 2
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        AnnouncerEvent::Counts { seeders: Some(7), leechers: Some(3), .. }
    )));

    // No announce is due until the tracker's interval elapses.
    let early = announcer.upkeep(t0 + Duration::from_secs(1));
    assert!(!early
        .iter()
        .any(|c| matches!(c, TrackerCommand::Announce { .. })));
    let commands = announcer.upkeep(t0 + Duration::from_secs(1801));
    let (_, _, request) = single_announce_command(commands);
    assert_eq!(request.event, TrackerEvent::None);
}

#[test]
fn failed_announce_retries_on_the_next_tracker() {
    let t0 = Instant::now();
    let mut announcer = announcer(t0);
    let view = FakeTorrent::new(4, 2, 10);
    announcer.add_torrent(
        TORRENT,
        view,
        &[vec![
            "udp://one.example.com:6969/announce".to_owned(),
            "udp://two.example.com:6969/announce".to_owned(),
        ]],
        t0,
    );
    announcer.torrent_started(TORRENT, t0);

    let (tag, _, request) = single_announce_command(announcer.upkeep(t0));
    assert!(request.url.contains("one.example.com"));

    announcer.on_announce_response(tag, Err(TrackerError::Timeout), t0);
    // Multi-tracker torrents fail over silently.
    assert!(announcer.poll_events().is_empty());

    // First failure backs off 20s, then the tier's second URL is used.
    let early = announcer.upkeep(t0 + Duration::from_secs(5));
    assert!(!early
        .iter()
        .any(|c| matches!(c, TrackerCommand::Announce { .. })));
    let commands = announcer.upkeep(t0 + Duration::from_secs(21));
    let (_, _, request) = single_announce_command(commands);
    assert!(request.url.contains("two.example.com"));
    assert_eq!(request.event, TrackerEvent::Started);
}

#[test]
fn single_tracker_announce_errors_are_published() {
    let t0 = Instant::now();
    let mut announcer = announcer(t0);
    add_single_tracker_torrent(&mut announcer, UDP_URL, t0);
    announcer.torrent_started(TORRENT, t0);

    let (tag, _, _) = single_announce_command(announcer.upkeep(t0));
    announcer.on_announce_response(tag, Err(TrackerError::ConnectionFailed), t0);

    let events = announcer.poll_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, AnnouncerEvent::Error { torrent, .. } if *torrent == TORRENT)));
}

#[test]
fn stop_then_start_supersedes_the_goodbye() {
    let t0 = Instant::now();
    let mut announcer = announcer(t0);
    add_single_tracker_torrent(&mut announcer, UDP_URL, t0);
    announcer.torrent_started(TORRENT, t0);
    announcer.torrent_stopped(TORRENT, t0);
    announcer.torrent_started(TORRENT, t0);

    let (_, _, request) = single_announce_command(announcer.upkeep(t0));
    assert_eq!(request.event, TrackerEvent::Started);
    assert!(announcer.upkeep(t0).is_empty(), "no stopped announce left");
}

#[test]
fn stopped_announce_reports_zero_numwant_and_resets_counters() {
    let t0 = Instant::now();
    let mut announcer = announcer(t0);
    add_single_tracker_torrent(&mut announcer, UDP_URL, t0);
    announcer.torrent_started(TORRENT, t0);
    announcer.credit_bytes(TORRENT, 5000, 7000, 0);

    let (tag, _, request) = single_announce_command(announcer.upkeep(t0));
    assert_eq!(request.uploaded, 5000);
    announcer.on_announce_response(tag, Ok(Default::default()), t0);

    announcer.torrent_stopped(TORRENT, t0);
    let (tag, _, request) = single_announce_command(announcer.upkeep(t0));
    assert_eq!(request.event, TrackerEvent::Stopped);
    assert_eq!(request.numwant, 0);
    assert_eq!(request.uploaded, 5000);
    announcer.on_announce_response(tag, Ok(Default::default()), t0);

    // The acknowledged stop clears the byte counters.
    announcer.torrent_started(TORRENT, t0);
    let (_, _, request) = single_announce_command(announcer.upkeep(t0));
    assert_eq!(request.uploaded, 0);
    assert_eq!(request.downloaded, 0);
}

#[test]
fn removal_flushes_fire_and_forget_stops_biggest_first() {
    let t0 = Instant::now();
    let mut announcer = announcer(t0);

    let small = TorrentId(1);
    let big = TorrentId(2);
    for (id, volume) in [(small, 10), (big, 1_000_000)] {
        let view = FakeTorrent::new(4, 2, 10);
        announcer.add_torrent(id, view, &[vec![UDP_URL.to_owned()]], t0);
        announcer.torrent_started(id, t0);
        let (tag, _, _) = single_announce_command(announcer.upkeep(t0));
        announcer.on_announce_response(tag, Ok(Default::default()), t0);
        announcer.credit_bytes(id, volume, 0, 0);
    }

    announcer.remove_torrent(small);
    announcer.remove_torrent(big);

    let commands = announcer.upkeep(t0);
    let stops: Vec<&AnnounceRequest> = commands
        .iter()
        .filter_map(|c| match c {
            TrackerCommand::Announce {
                tag: None, request, ..
            } => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(stops.len(), 2);
    assert_eq!(stops[0].uploaded, 1_000_000, "big torrent says goodbye first");
    assert!(stops.iter().all(|r| r.event == TrackerEvent::Stopped));
    assert!(stops.iter().all(|r| r.numwant == 0));
}

// ----------------------------------------------------------------------
// Multiscrape
// ----------------------------------------------------------------------

fn scrape_commands(commands: Vec<TrackerCommand>) -> Vec<crate::tracker::response::ScrapeRequest> {
    commands
        .into_iter()
        .filter_map(|c| match c {
            TrackerCommand::Scrape { request, .. } => Some(request),
            _ => None,
        })
        .collect()
}

#[test]
fn multiscrape_batches_within_the_url_bound() {
    let t0 = Instant::now();
    let mut announcer = announcer(t0);
    for i in 0..100u64 {
        let view = FakeTorrent::new(4, 2, 10);
        announcer.add_torrent(TorrentId(i), view, &[vec![HTTP_URL.to_owned()]], t0);
    }

    let scrapes = scrape_commands(announcer.upkeep(t0));
    assert!(!scrapes.is_empty());
    let total: usize = scrapes.iter().map(|s| s.info_hashes.len()).sum();
    assert_eq!(total, 100);
    for scrape in &scrapes {
        assert!(scrape.info_hashes.len() <= MULTISCRAPE_MAX);
        assert_eq!(scrape.url, "http://tracker.example.com/scrape");
    }
}

#[test]
fn multiscrape_shrinks_on_uri_too_long() {
    let t0 = Instant::now();
    let mut announcer = announcer(t0);
    let scrape_url = "http://tracker.example.com/scrape";
    announcer.set_multiscrape_max(scrape_url, 32);

    for i in 0..32u64 {
        let view = FakeTorrent::new(4, 2, 10);
        announcer.add_torrent(TorrentId(i), view, &[vec![HTTP_URL.to_owned()]], t0);
    }

    let commands = announcer.upkeep(t0);
    let tag = commands
        .iter()
        .find_map(|c| match c {
            TrackerCommand::Scrape { tag, request, .. } if request.info_hashes.len() == 32 => {
                Some(*tag)
            }
            _ => None,
        })
        .unwrap();

    announcer.on_scrape_response(
        tag,
        Err(TrackerError::TrackerRejected(
            "Request-URI Too Long".to_owned(),
        )),
        t0,
    );
    assert_eq!(announcer.multiscrape_max(scrape_url), 27);

    // The retry re-batches under the shrunk bound right away.
    let scrapes = scrape_commands(announcer.upkeep(t0 + Duration::from_secs(1)));
    assert!(!scrapes.is_empty());
    for scrape in &scrapes {
        assert!(scrape.info_hashes.len() <= 27, "batch of {}", scrape.info_hashes.len());
    }
}

#[test]
fn scrape_failures_stay_silent() {
    let t0 = Instant::now();
    let mut announcer = announcer(t0);
    add_single_tracker_torrent(&mut announcer, HTTP_URL, t0);

    let commands = announcer.upkeep(t0);
    let tag = commands
        .iter()
        .find_map(|c| match c {
            TrackerCommand::Scrape { tag, .. } => Some(*tag),
            _ => None,
        })
        .unwrap();
    announcer.on_scrape_response(tag, Err(TrackerError::Timeout), t0);
    assert!(announcer.poll_events().is_empty());
}
