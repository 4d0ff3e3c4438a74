//! Bandwidth accounting for the swarm core.
//!
//! A token-bucket limiter per direction. The bandwidth pulse refills the
//! buckets and hands out per-peer quota; the choke pass asks whether the
//! upload side is already saturated before promoting peers.

use std::time::Instant;

use crate::torrent::Direction;

/// Per-pulse byte budget handed to a peer connection.
///
/// `u64::MAX` in a direction means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub up: u64,
    pub down: u64,
}

impl Quota {
    pub const UNLIMITED: Quota = Quota {
        up: u64::MAX,
        down: u64::MAX,
    };
}

/// A token bucket with burst headroom of twice the configured rate.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64, now: Instant) -> Self {
        let max_tokens = (bytes_per_sec * 2) as f64;
        Self {
            tokens: max_tokens,
            max_tokens,
            tokens_per_sec: bytes_per_sec as f64,
            last_refill: now,
        }
    }

    fn unlimited(now: Instant) -> Self {
        Self {
            tokens: f64::MAX,
            max_tokens: f64::MAX,
            tokens_per_sec: f64::MAX,
            last_refill: now,
        }
    }

    fn is_limited(&self) -> bool {
        self.tokens_per_sec != f64::MAX
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        if self.is_limited() {
            self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);
        }
    }

    fn take(&mut self, bytes: u64) -> u64 {
        if !self.is_limited() {
            return bytes;
        }
        let granted = (bytes as f64).min(self.tokens.max(0.0));
        self.tokens -= granted;
        granted as u64
    }
}

/// One measured direction: a limiter plus the observed piece-data rate.
#[derive(Debug)]
struct DirectionState {
    bucket: TokenBucket,
    /// Piece-data bytes observed since the last pulse.
    pulse_bytes: u64,
    /// Smoothed piece-data speed, bytes per second.
    speed: f64,
    last_pulse: Instant,
}

impl DirectionState {
    fn new(limit: Option<u64>, now: Instant) -> Self {
        let bucket = match limit {
            Some(rate) => TokenBucket::new(rate, now),
            None => TokenBucket::unlimited(now),
        };
        Self {
            bucket,
            pulse_bytes: 0,
            speed: 0.0,
            last_pulse: now,
        }
    }
}

/// Per-scope (session or torrent) bandwidth state.
#[derive(Debug)]
pub struct Bandwidth {
    up: DirectionState,
    down: DirectionState,
}

impl Bandwidth {
    /// `None` means unlimited in that direction.
    pub fn new(up_limit: Option<u64>, down_limit: Option<u64>, now: Instant) -> Self {
        Self {
            up: DirectionState::new(up_limit, now),
            down: DirectionState::new(down_limit, now),
        }
    }

    pub fn unlimited(now: Instant) -> Self {
        Self::new(None, None, now)
    }

    pub fn set_limit(&mut self, dir: Direction, limit: Option<u64>, now: Instant) {
        let state = self.state_mut(dir);
        state.bucket = match limit {
            Some(rate) => TokenBucket::new(rate, now),
            None => TokenBucket::unlimited(now),
        };
    }

    pub fn is_limited(&self, dir: Direction) -> bool {
        self.state(dir).bucket.is_limited()
    }

    /// Refills both buckets and folds the bytes observed since the last
    /// pulse into the speed estimate. Called once per bandwidth pulse.
    pub fn pulse(&mut self, now: Instant) {
        for dir in [Direction::Up, Direction::Down] {
            let state = self.state_mut(dir);
            state.bucket.refill(now);
            let elapsed = now.saturating_duration_since(state.last_pulse).as_secs_f64();
            if elapsed > 0.0 {
                let instantaneous = state.pulse_bytes as f64 / elapsed;
                // EMA keeps the maxed-out test stable across pulses.
                state.speed = 0.4 * instantaneous + 0.6 * state.speed;
                state.pulse_bytes = 0;
                state.last_pulse = now;
            }
        }
    }

    /// Records piece-data transfer for the speed estimate.
    pub fn notify_piece_data(&mut self, dir: Direction, bytes: u64) {
        self.state_mut(dir).pulse_bytes += bytes;
    }

    /// Grants up to `bytes` of quota in `dir`, returning the grant.
    pub fn allocate(&mut self, dir: Direction, bytes: u64) -> u64 {
        self.state_mut(dir).bucket.take(bytes)
    }

    /// Tokens currently drawable in `dir`; `u64::MAX` when unlimited.
    pub fn available(&self, dir: Direction) -> u64 {
        let bucket = &self.state(dir).bucket;
        if bucket.is_limited() {
            bucket.tokens.max(0.0) as u64
        } else {
            u64::MAX
        }
    }

    /// Observed piece-data speed in bytes per second.
    pub fn speed(&self, dir: Direction) -> u64 {
        self.state(dir).speed as u64
    }

    /// True when `dir` is limited and the observed speed has reached the
    /// configured rate; the choke pass then keeps previous choke states
    /// instead of promoting peers.
    pub fn is_maxed_out(&self, dir: Direction) -> bool {
        let state = self.state(dir);
        state.bucket.is_limited() && state.speed >= state.bucket.tokens_per_sec
    }

    fn state(&self, dir: Direction) -> &DirectionState {
        match dir {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    fn state_mut(&mut self, dir: Direction) -> &mut DirectionState {
        match dir {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unlimited_grants_everything() {
        let now = Instant::now();
        let mut bw = Bandwidth::unlimited(now);
        assert_eq!(bw.allocate(Direction::Up, u64::MAX / 2), u64::MAX / 2);
        assert!(!bw.is_maxed_out(Direction::Up));
    }

    #[test]
    fn limited_bucket_refills_over_time() {
        let now = Instant::now();
        let mut bw = Bandwidth::new(Some(1000), None, now);

        // Burst headroom is 2x the rate.
        assert_eq!(bw.allocate(Direction::Up, 5000), 2000);
        assert_eq!(bw.allocate(Direction::Up, 5000), 0);

        bw.pulse(now + Duration::from_secs(1));
        let granted = bw.allocate(Direction::Up, 5000);
        assert!((900..=1100).contains(&granted), "granted {granted}");
    }

    #[test]
    fn maxed_out_tracks_observed_speed() {
        let now = Instant::now();
        let mut bw = Bandwidth::new(Some(1000), None, now);
        assert!(!bw.is_maxed_out(Direction::Up));

        for i in 1..=20u64 {
            bw.notify_piece_data(Direction::Up, 2000);
            bw.pulse(now + Duration::from_secs(i));
        }
        assert!(bw.is_maxed_out(Direction::Up));
        assert!(!bw.is_maxed_out(Direction::Down));
    }
}
