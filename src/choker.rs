//! Upload slot allocation.
//!
//! The choker keeps connections in a rotating order. Each cycle it prefers
//! the best reciprocating peers for `max_uploads - 1` slots and hands the
//! rest out in rotation order, which is what makes the optimistic unchoke
//! move around the swarm.

use crate::config::Config;
use crate::constants::MIN_PREFERRED_RATE;
use rand::Rng as _;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// What the choker needs to know about one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerView {
    /// The peer wants our data.
    pub interested: bool,
    /// We are currently choking the peer.
    pub choked: bool,
    /// Bytes/s the peer sends us.
    pub download_rate: f64,
    /// Bytes/s we send the peer.
    pub upload_rate: f64,
    pub snubbed: bool,
    pub ip: Option<IpAddr>,
    /// Give-to-get score `(forward1, forward2)` for peers on the reward
    /// extension.
    pub forward: Option<(f64, f64)>,
}

pub struct Choker<K> {
    connections: Vec<K>,
    max_uploads: usize,
    round_robin_period: Duration,
    last_round_robin: Instant,
    paused: bool,
    locality_bias: f64,
    local_ip: Option<IpAddr>,
    last_preferred: usize,
}

impl<K: Copy + Eq + Hash + Debug> Choker<K> {
    pub fn new(config: &Config, now: Instant) -> Self {
        Self {
            connections: Vec::new(),
            max_uploads: config.max_uploads,
            round_robin_period: config.round_robin_period,
            last_round_robin: now,
            paused: false,
            locality_bias: config.locality_bias,
            local_ip: None,
            last_preferred: 0,
        }
    }

    pub fn set_local_ip(&mut self, ip: IpAddr) {
        self.local_ip = Some(ip);
    }

    /// Adds a connection near a random position so new peers get a fair
    /// shot at the rotating slot.
    pub fn connection_made(&mut self, key: K) {
        if self.connections.contains(&key) {
            return;
        }
        let len = self.connections.len() as i64;
        let pos = rand::rng().random_range(-2..=len).max(0) as usize;
        self.connections.insert(pos, key);
    }

    pub fn connection_lost(&mut self, key: K) {
        self.connections.retain(|k| *k != key);
    }

    pub fn connections(&self) -> &[K] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn unpause(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Number of peers that qualified for a preferred slot last cycle.
    pub fn last_preferred(&self) -> usize {
        self.last_preferred
    }

    /// Periodic cycle: rotates the order when the round-robin period has
    /// elapsed, then rechokes.
    pub fn round_robin(
        &mut self,
        now: Instant,
        seeding: bool,
        view: impl Fn(&K) -> Option<PeerView>,
    ) -> Vec<(K, bool)> {
        if now.saturating_duration_since(self.last_round_robin) >= self.round_robin_period {
            self.last_round_robin = now;
            let next = (1..self.connections.len()).find(|&i| {
                view(&self.connections[i]).is_some_and(|v| v.choked && v.interested)
            });
            if let Some(i) = next {
                self.connections.rotate_left(i);
            }
        }
        self.rechoke(seeding, view)
    }

    /// Computes the unchoke set. Returns `(key, unchoke)` for every
    /// connection whose choke state should change.
    pub fn rechoke(
        &mut self,
        seeding: bool,
        view: impl Fn(&K) -> Option<PeerView>,
    ) -> Vec<(K, bool)> {
        let views: Vec<(K, PeerView)> = self
            .connections
            .iter()
            .filter_map(|k| view(k).map(|v| (*k, v)))
            .collect();

        if self.paused {
            return views
                .iter()
                .filter(|(_, v)| !v.choked)
                .map(|(k, _)| (*k, false))
                .collect();
        }

        let preferred = self.preferred(&views, seeding);

        let mut count = preferred.len();
        let mut hit = false;
        let mut decisions = Vec::new();
        for (key, v) in &views {
            let unchoke = if preferred.contains(key) {
                true
            } else if count < self.max_uploads || !hit {
                if v.interested {
                    count += 1;
                    hit = true;
                }
                true
            } else {
                false
            };
            if unchoke == v.choked {
                decisions.push((*key, unchoke));
            }
        }
        decisions
    }

    fn preferred(&mut self, views: &[(K, PeerView)], seeding: bool) -> HashSet<K> {
        let slots = self.max_uploads.saturating_sub(1);
        if slots == 0 {
            self.last_preferred = 0;
            return HashSet::new();
        }

        let mut regular: Vec<(f64, K)> = Vec::new();
        let mut extension: Vec<((f64, f64), K)> = Vec::new();
        for (key, v) in views {
            if !v.interested {
                continue;
            }
            if let Some(forward) = v.forward {
                extension.push((forward, *key));
                continue;
            }
            let rate = if seeding {
                v.upload_rate
            } else {
                if v.download_rate < MIN_PREFERRED_RATE || v.snubbed {
                    continue;
                }
                v.download_rate
            };
            regular.push((rate + self.locality(v.ip), *key));
        }
        self.last_preferred = regular.len() + extension.len();

        regular.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        extension.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        regular
            .into_iter()
            .take(slots)
            .map(|(_, k)| k)
            .chain(extension.into_iter().take(slots).map(|(_, k)| k))
            .collect()
    }

    /// Score bonus for a peer on our /24 (or /64 for IPv6).
    fn locality(&self, ip: Option<IpAddr>) -> f64 {
        if self.locality_bias == 0.0 {
            return 0.0;
        }
        match (self.local_ip, ip) {
            (Some(IpAddr::V4(a)), Some(IpAddr::V4(b))) if a.octets()[..3] == b.octets()[..3] => {
                self.locality_bias
            }
            (Some(IpAddr::V6(a)), Some(IpAddr::V6(b))) if a.segments()[..4] == b.segments()[..4] => {
                self.locality_bias
            }
            _ => 0.0,
        }
    }
}
