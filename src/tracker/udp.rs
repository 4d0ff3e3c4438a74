//! UDP tracker transport (BEP-15).
//!
//! One transport per session multiplexes every UDP tracker host. Each
//! host caches a resolved address (1 h) and a server-issued connection
//! id (60 s); requests queue on the host until both are available and
//! are matched back to responses by transaction id.
//!
//! The transport does no I/O itself: `upkeep` returns DNS lookups and
//! datagrams for the driver to perform, `handle_message` accepts raw
//! inbound datagrams, and finished requests come out of
//! `poll_completions`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng as _;
use tracing::{debug, warn};

use crate::constants::{
    DNS_TTL, UDP_ACTION_ANNOUNCE, UDP_ACTION_CONNECT, UDP_ACTION_ERROR, UDP_ACTION_SCRAPE,
    UDP_CONNECTION_TTL, UDP_REQUEST_TTL, UDP_SHUTDOWN_GRACE, UDP_TRACKER_MAGIC,
};
use crate::tracker::response::{
    parse_compact_peers, AnnounceRequest, AnnounceResponse, ScrapeRequest, ScrapeResponse,
    ScrapeRow,
};

/// I/O the driver must perform on the transport's behalf.
#[derive(Debug, PartialEq, Eq)]
pub enum UdpCommand {
    /// Resolve `host` ("host:port") and report via `on_dns`.
    Resolve { host: String },
    /// Send one datagram.
    Send { to: SocketAddr, payload: Vec<u8> },
}

/// Why a request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpFailure {
    /// Whether a connection id had been obtained.
    pub did_connect: bool,
    pub did_timeout: bool,
    pub message: String,
}

/// A finished request, routed back by the issuer's tag.
#[derive(Debug)]
pub enum UdpCompletion {
    Announce(Result<AnnounceResponse, UdpFailure>),
    Scrape(Result<ScrapeResponse, UdpFailure>),
}

#[derive(Debug)]
struct PendingAnnounce {
    /// `None` marks fire-and-forget (a stopped announce).
    tag: Option<u64>,
    transaction_id: u32,
    request: AnnounceRequest,
    created_at: Instant,
    sent_at: Option<Instant>,
}

#[derive(Debug)]
struct PendingScrape {
    tag: Option<u64>,
    transaction_id: u32,
    request: ScrapeRequest,
    created_at: Instant,
    sent_at: Option<Instant>,
}

#[derive(Debug)]
struct TrackerHost {
    key: String,
    addr: Option<SocketAddr>,
    addr_expires_at: Option<Instant>,
    dns_pending: bool,
    connection_id: Option<u64>,
    connection_expires_at: Option<Instant>,
    connecting_at: Option<Instant>,
    connect_transaction_id: Option<u32>,
    announces: Vec<PendingAnnounce>,
    scrapes: Vec<PendingScrape>,
    close_at: Option<Instant>,
}

impl TrackerHost {
    fn new(key: String) -> Self {
        Self {
            key,
            addr: None,
            addr_expires_at: None,
            dns_pending: false,
            connection_id: None,
            connection_expires_at: None,
            connecting_at: None,
            connect_transaction_id: None,
            announces: Vec::new(),
            scrapes: Vec::new(),
            close_at: None,
        }
    }

    fn has_pending_work(&self) -> bool {
        !self.announces.is_empty() || !self.scrapes.is_empty()
    }

    fn connection_valid(&self, now: Instant) -> bool {
        self.connection_id.is_some()
            && self.connection_expires_at.is_some_and(|t| t > now)
    }
}

pub struct UdpTrackerTransport {
    hosts: HashMap<String, TrackerHost>,
    completions: Vec<(u64, UdpCompletion)>,
    shutting_down: bool,
}

impl Default for UdpTrackerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTrackerTransport {
    pub fn new() -> Self {
        Self {
            hosts: HashMap::new(),
            completions: Vec::new(),
            shutting_down: false,
        }
    }

    /// Queues an announce on `host` ("host:port"). A `None` tag makes the
    /// request fire-and-forget: it is dropped right after the send.
    pub fn announce(
        &mut self,
        tag: Option<u64>,
        host: String,
        request: AnnounceRequest,
        now: Instant,
    ) {
        let host = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| TrackerHost::new(host));
        host.announces.push(PendingAnnounce {
            tag,
            transaction_id: random_transaction_id(),
            request,
            created_at: now,
            sent_at: None,
        });
    }

    pub fn scrape(&mut self, tag: Option<u64>, host: String, request: ScrapeRequest, now: Instant) {
        let host = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| TrackerHost::new(host));
        host.scrapes.push(PendingScrape {
            tag,
            transaction_id: random_transaction_id(),
            request,
            created_at: now,
            sent_at: None,
        });
    }

    /// Periodic upkeep: expiry, DNS, CONNECT, request dispatch, timeouts.
    pub fn upkeep(&mut self, now: Instant) -> Vec<UdpCommand> {
        let mut commands = Vec::new();

        for host in self.hosts.values_mut() {
            // 1. Address cache.
            let closing = host.close_at.is_some();
            if closing || host.addr_expires_at.is_some_and(|t| t <= now) {
                host.addr = None;
                host.addr_expires_at = None;
            }
            if host.addr.is_none() && !host.dns_pending && !closing && host.has_pending_work() {
                host.dns_pending = true;
                commands.push(UdpCommand::Resolve {
                    host: host.key.clone(),
                });
            }

            // 2. Timeouts, including the shutdown deadline.
            Self::timeout_requests(&mut self.completions, host, now);

            let Some(addr) = host.addr else { continue };

            // 3. Connection id.
            if !host.connection_valid(now) && host.has_pending_work() {
                if host.connecting_at.is_none() {
                    let transaction_id = random_transaction_id();
                    host.connecting_at = Some(now);
                    host.connect_transaction_id = Some(transaction_id);
                    debug!(target: "tracker", host = %host.key, "sending CONNECT");
                    commands.push(UdpCommand::Send {
                        to: addr,
                        payload: build_connect(transaction_id),
                    });
                }
                continue;
            }

            // 4. Dispatch unsent requests.
            if let Some(connection_id) = host.connection_id {
                for pending in &mut host.announces {
                    if pending.sent_at.is_none() {
                        pending.sent_at = Some(now);
                        commands.push(UdpCommand::Send {
                            to: addr,
                            payload: build_announce(connection_id, pending),
                        });
                    }
                }
                for pending in &mut host.scrapes {
                    if pending.sent_at.is_none() {
                        pending.sent_at = Some(now);
                        commands.push(UdpCommand::Send {
                            to: addr,
                            payload: build_scrape(connection_id, pending),
                        });
                    }
                }
                // Fire-and-forget requests are done once they hit the wire.
                host.announces
                    .retain(|p| p.tag.is_some() || p.sent_at.is_none());
                host.scrapes
                    .retain(|p| p.tag.is_some() || p.sent_at.is_none());
            }
        }

        // Idle hosts keep their caches; they only drain away during
        // shutdown.
        if self.shutting_down {
            self.hosts
                .retain(|_, host| host.has_pending_work() || host.connecting_at.is_some());
        }
        commands
    }

    /// DNS finished for `host`.
    pub fn on_dns(&mut self, host: &str, result: Result<SocketAddr, String>, now: Instant) {
        let Some(host) = self.hosts.get_mut(host) else {
            return;
        };
        if !host.dns_pending {
            // Lookup was cancelled by shutdown.
            return;
        }
        host.dns_pending = false;
        match result {
            Ok(addr) => {
                debug!(target: "tracker", host = %host.key, %addr, "dns resolved");
                host.addr = Some(addr);
                host.addr_expires_at = Some(now + DNS_TTL);
            }
            Err(message) => {
                warn!(target: "tracker", host = %host.key, message, "dns failed");
                Self::fail_all(&mut self.completions, host, false, false, "Unknown host");
            }
        }
    }

    /// Demultiplexes one raw datagram. Returns whether it was consumed.
    pub fn handle_message(&mut self, data: &[u8], now: Instant) -> bool {
        if data.len() < 8 {
            return false;
        }
        let mut buf = data;
        let action = buf.get_u32();
        let transaction_id = buf.get_u32();

        // (a) an in-flight CONNECT?
        if action == UDP_ACTION_CONNECT || action == UDP_ACTION_ERROR {
            for host in self.hosts.values_mut() {
                if host.connect_transaction_id == Some(transaction_id) {
                    Self::on_connect_response(&mut self.completions, host, action, buf, now);
                    return true;
                }
            }
        }

        // (b) somebody's announce?
        if action == UDP_ACTION_ANNOUNCE || action == UDP_ACTION_ERROR {
            for host in self.hosts.values_mut() {
                if let Some(i) = host
                    .announces
                    .iter()
                    .position(|p| p.sent_at.is_some() && p.transaction_id == transaction_id)
                {
                    let pending = host.announces.remove(i);
                    Self::finish_announce(&mut self.completions, pending, action, buf);
                    return true;
                }
            }
        }

        // (c) somebody's scrape?
        if action == UDP_ACTION_SCRAPE || action == UDP_ACTION_ERROR {
            for host in self.hosts.values_mut() {
                if let Some(i) = host
                    .scrapes
                    .iter()
                    .position(|p| p.sent_at.is_some() && p.transaction_id == transaction_id)
                {
                    let pending = host.scrapes.remove(i);
                    Self::finish_scrape(&mut self.completions, pending, action, buf);
                    return true;
                }
            }
        }

        false
    }

    /// Takes every completion recorded since the last poll.
    pub fn poll_completions(&mut self) -> Vec<(u64, UdpCompletion)> {
        std::mem::take(&mut self.completions)
    }

    /// Begins a graceful shutdown: pending requests get a short grace
    /// period, in-flight DNS is cancelled.
    pub fn start_shutdown(&mut self, now: Instant) {
        self.shutting_down = true;
        for host in self.hosts.values_mut() {
            host.close_at = Some(now + UDP_SHUTDOWN_GRACE);
            host.dns_pending = false;
        }
    }

    /// True when no host has work left.
    pub fn is_idle(&self) -> bool {
        self.hosts.values().all(|h| !h.has_pending_work())
    }

    /// Unconditional teardown.
    pub fn close(&mut self) {
        self.hosts.clear();
        self.completions.clear();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    fn on_connect_response(
        completions: &mut Vec<(u64, UdpCompletion)>,
        host: &mut TrackerHost,
        action: u32,
        mut buf: &[u8],
        now: Instant,
    ) {
        host.connecting_at = None;
        host.connect_transaction_id = None;

        if action == UDP_ACTION_CONNECT && buf.len() >= 8 {
            host.connection_id = Some(buf.get_u64());
            host.connection_expires_at = Some(now + UDP_CONNECTION_TTL);
            debug!(target: "tracker", host = %host.key, "connection id cached");
        } else {
            let message = if action == UDP_ACTION_ERROR {
                String::from_utf8_lossy(buf).into_owned()
            } else {
                "Connection failed".to_owned()
            };
            Self::fail_all(completions, host, false, false, &message);
        }
    }

    fn finish_announce(
        completions: &mut Vec<(u64, UdpCompletion)>,
        pending: PendingAnnounce,
        action: u32,
        mut buf: &[u8],
    ) {
        let Some(tag) = pending.tag else { return };
        let outcome = if action == UDP_ACTION_ANNOUNCE && buf.len() >= 12 {
            let interval = buf.get_u32();
            let leechers = buf.get_u32();
            let seeders = buf.get_u32();
            Ok(AnnounceResponse {
                interval: Some(interval),
                leechers: Some(leechers),
                seeders: Some(seeders),
                peers: parse_compact_peers(buf),
                ..AnnounceResponse::default()
            })
        } else if action == UDP_ACTION_ERROR {
            Err(UdpFailure {
                did_connect: true,
                did_timeout: false,
                message: String::from_utf8_lossy(buf).into_owned(),
            })
        } else {
            Err(UdpFailure {
                did_connect: true,
                did_timeout: false,
                message: "response too short".to_owned(),
            })
        };
        completions.push((tag, UdpCompletion::Announce(outcome)));
    }

    fn finish_scrape(
        completions: &mut Vec<(u64, UdpCompletion)>,
        pending: PendingScrape,
        action: u32,
        mut buf: &[u8],
    ) {
        let Some(tag) = pending.tag else { return };
        let outcome = if action == UDP_ACTION_SCRAPE {
            let mut rows = Vec::new();
            for &info_hash in &pending.request.info_hashes {
                if buf.len() < 12 {
                    break;
                }
                rows.push(ScrapeRow {
                    info_hash,
                    seeders: buf.get_u32(),
                    completed: buf.get_u32(),
                    leechers: buf.get_u32(),
                });
            }
            Ok(ScrapeResponse {
                rows,
                min_request_interval: None,
            })
        } else {
            Err(UdpFailure {
                did_connect: true,
                did_timeout: false,
                message: String::from_utf8_lossy(buf).into_owned(),
            })
        };
        completions.push((tag, UdpCompletion::Scrape(outcome)));
    }

    fn timeout_requests(
        completions: &mut Vec<(u64, UdpCompletion)>,
        host: &mut TrackerHost,
        now: Instant,
    ) {
        let cancel_all = host.close_at.is_some_and(|t| t <= now);

        // A CONNECT that never came back fails everything queued here.
        if let Some(connecting_at) = host.connecting_at {
            if cancel_all || now.saturating_duration_since(connecting_at) >= UDP_REQUEST_TTL {
                host.connecting_at = None;
                host.connect_transaction_id = None;
                Self::fail_all(completions, host, false, true, "Connection failed");
            }
        }

        let did_connect = host.connection_id.is_some();
        host.announces.retain(|pending| {
            if cancel_all || now.saturating_duration_since(pending.created_at) >= UDP_REQUEST_TTL {
                if let Some(tag) = pending.tag {
                    completions.push((
                        tag,
                        UdpCompletion::Announce(Err(UdpFailure {
                            did_connect,
                            did_timeout: true,
                            message: "Tracker did not respond".to_owned(),
                        })),
                    ));
                }
                false
            } else {
                true
            }
        });
        host.scrapes.retain(|pending| {
            if cancel_all || now.saturating_duration_since(pending.created_at) >= UDP_REQUEST_TTL {
                if let Some(tag) = pending.tag {
                    completions.push((
                        tag,
                        UdpCompletion::Scrape(Err(UdpFailure {
                            did_connect,
                            did_timeout: true,
                            message: "Tracker did not respond".to_owned(),
                        })),
                    ));
                }
                false
            } else {
                true
            }
        });
    }

    fn fail_all(
        completions: &mut Vec<(u64, UdpCompletion)>,
        host: &mut TrackerHost,
        did_connect: bool,
        did_timeout: bool,
        message: &str,
    ) {
        for pending in host.announces.drain(..) {
            if let Some(tag) = pending.tag {
                completions.push((
                    tag,
                    UdpCompletion::Announce(Err(UdpFailure {
                        did_connect,
                        did_timeout,
                        message: message.to_owned(),
                    })),
                ));
            }
        }
        for pending in host.scrapes.drain(..) {
            if let Some(tag) = pending.tag {
                completions.push((
                    tag,
                    UdpCompletion::Scrape(Err(UdpFailure {
                        did_connect,
                        did_timeout,
                        message: message.to_owned(),
                    })),
                ));
            }
        }
    }
}

fn random_transaction_id() -> u32 {
    rand::rng().random()
}

fn build_connect(transaction_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(UDP_TRACKER_MAGIC);
    buf.put_u32(UDP_ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf.to_vec()
}

fn build_announce(connection_id: u64, pending: &PendingAnnounce) -> Vec<u8> {
    let req = &pending.request;
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(UDP_ACTION_ANNOUNCE);
    buf.put_u32(pending.transaction_id);
    buf.put_slice(req.info_hash.as_bytes());
    buf.put_slice(&req.peer_id.0);
    buf.put_u64(req.downloaded);
    buf.put_u64(req.left);
    buf.put_u64(req.uploaded);
    buf.put_u32(req.event.as_udp_id());
    buf.put_u32(0); // ip: let the tracker use the source address
    buf.put_u32(req.key);
    buf.put_i32(req.numwant);
    buf.put_u16(req.port);
    buf.to_vec()
}

fn build_scrape(connection_id: u64, pending: &PendingScrape) -> Vec<u8> {
    let req = &pending.request;
    let mut buf = BytesMut::with_capacity(16 + 20 * req.info_hashes.len());
    buf.put_u64(connection_id);
    buf.put_u32(UDP_ACTION_SCRAPE);
    buf.put_u32(pending.transaction_id);
    for info_hash in &req.info_hashes {
        buf.put_slice(info_hash.as_bytes());
    }
    buf.to_vec()
}
