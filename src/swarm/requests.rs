//! Outgoing block-request bookkeeping.
//!
//! A bidirectional index between blocks and the peers we requested them
//! from, timestamped so refill-upkeep can cancel requests that have gone
//! stale. Outside endgame a block has at most one pending peer; endgame
//! deliberately duplicates.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Instant;

use crate::torrent::BlockIndex;

/// Block ↔ peer request index with send timestamps.
#[derive(Debug, Default)]
pub struct ActiveRequests {
    by_block: BTreeMap<BlockIndex, BTreeMap<SocketAddr, Instant>>,
    by_peer: BTreeMap<SocketAddr, BTreeSet<BlockIndex>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request; returns false if it was already present.
    pub fn add(&mut self, block: BlockIndex, peer: SocketAddr, now: Instant) -> bool {
        let fresh = self
            .by_block
            .entry(block)
            .or_default()
            .insert(peer, now)
            .is_none();
        if fresh {
            self.by_peer.entry(peer).or_default().insert(block);
        }
        fresh
    }

    /// Drops one (block, peer) pair; returns whether it existed.
    pub fn remove(&mut self, block: BlockIndex, peer: SocketAddr) -> bool {
        let mut removed = false;
        if let Some(peers) = self.by_block.get_mut(&block) {
            removed = peers.remove(&peer).is_some();
            if peers.is_empty() {
                self.by_block.remove(&block);
            }
        }
        if removed {
            if let Some(blocks) = self.by_peer.get_mut(&peer) {
                blocks.remove(&block);
                if blocks.is_empty() {
                    self.by_peer.remove(&peer);
                }
            }
        }
        removed
    }

    /// Drops every pending request for `block`; returns the peers that
    /// had it outstanding.
    pub fn remove_block(&mut self, block: BlockIndex) -> Vec<SocketAddr> {
        let peers: Vec<SocketAddr> = self
            .by_block
            .remove(&block)
            .map(|m| m.into_keys().collect())
            .unwrap_or_default();
        for peer in &peers {
            if let Some(blocks) = self.by_peer.get_mut(peer) {
                blocks.remove(&block);
                if blocks.is_empty() {
                    self.by_peer.remove(peer);
                }
            }
        }
        peers
    }

    /// Drops every pending request to `peer`; returns its blocks.
    pub fn remove_peer(&mut self, peer: SocketAddr) -> Vec<BlockIndex> {
        let blocks: Vec<BlockIndex> = self
            .by_peer
            .remove(&peer)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for block in &blocks {
            if let Some(peers) = self.by_block.get_mut(block) {
                peers.remove(&peer);
                if peers.is_empty() {
                    self.by_block.remove(block);
                }
            }
        }
        blocks
    }

    pub fn has(&self, block: BlockIndex, peer: SocketAddr) -> bool {
        self.by_block
            .get(&block)
            .is_some_and(|peers| peers.contains_key(&peer))
    }

    /// Pending peers for one block.
    pub fn count_for_block(&self, block: BlockIndex) -> usize {
        self.by_block.get(&block).map_or(0, BTreeMap::len)
    }

    /// Pending blocks for one peer.
    pub fn count_for_peer(&self, peer: SocketAddr) -> usize {
        self.by_peer.get(&peer).map_or(0, BTreeSet::len)
    }

    /// Total (block, peer) pairs outstanding.
    pub fn len(&self) -> usize {
        self.by_peer.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    /// Requests sent strictly before `deadline`, in address-sorted order.
    pub fn sent_before(&self, deadline: Instant) -> Vec<(BlockIndex, SocketAddr)> {
        let mut stale = Vec::new();
        for (&block, peers) in &self.by_block {
            for (&peer, &sent_at) in peers {
                if sent_at < deadline {
                    stale.push((block, peer));
                }
            }
        }
        stale
    }
}
