//! Process-wide state shared by every engine.
//!
//! Several torrents running in one process share a budget of in-flight TCP
//! connects, a set of banned addresses and the per-tracker announce keys.
//! A [`Session`] is created once and handed to each engine in an `Arc`.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng as _;
use sha1::{Digest, Sha1};

use crate::constants::MAX_INCOMPLETE_CONNECTS;

#[derive(Debug)]
pub struct Session {
    connects: Arc<Mutex<ConnectCounter>>,
    banned: DashMap<IpAddr, ()>,
    tracker_keys: DashMap<String, String>,
    key_salt: [u8; 8],
}

#[derive(Debug)]
struct ConnectCounter {
    in_flight: usize,
    limit: usize,
}

/// A reserved connect slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct ConnectPermit {
    counter: Arc<Mutex<ConnectCounter>>,
}

impl Drop for ConnectPermit {
    fn drop(&mut self) {
        let mut counter = self.counter.lock();
        counter.in_flight = counter.in_flight.saturating_sub(1);
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_connect_limit(MAX_INCOMPLETE_CONNECTS)
    }

    pub fn with_connect_limit(limit: usize) -> Self {
        let mut key_salt = [0u8; 8];
        rand::rng().fill(&mut key_salt);
        Self {
            connects: Arc::new(Mutex::new(ConnectCounter {
                in_flight: 0,
                limit: limit.max(1),
            })),
            banned: DashMap::new(),
            tracker_keys: DashMap::new(),
            key_salt,
        }
    }

    /// Reserves an outbound connect slot, or `None` when the process-wide
    /// cap is reached.
    pub fn try_connect(&self) -> Option<ConnectPermit> {
        let mut counter = self.connects.lock();
        if counter.in_flight >= counter.limit {
            return None;
        }
        counter.in_flight += 1;
        Some(ConnectPermit {
            counter: Arc::clone(&self.connects),
        })
    }

    pub fn connects_in_flight(&self) -> usize {
        self.connects.lock().in_flight
    }

    pub fn ban(&self, ip: IpAddr) {
        self.banned.insert(ip, ());
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.banned.contains_key(ip)
    }

    pub fn banned_count(&self) -> usize {
        self.banned.len()
    }

    /// The `key` parameter sent to `url`.
    ///
    /// Stable for the life of the process, derived from the process id, the
    /// URL and a per-session random salt.
    pub fn tracker_key(&self, url: &str) -> String {
        self.tracker_keys
            .entry(url.to_string())
            .or_insert_with(|| {
                let mut hasher = Sha1::new();
                hasher.update(std::process::id().to_be_bytes());
                hasher.update(url.as_bytes());
                hasher.update(self.key_salt);
                let digest = hasher.finalize();
                digest[..4].iter().map(|b| format!("{b:02X}")).collect()
            })
            .clone()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_permits_are_bounded() {
        let session = Session::with_connect_limit(2);
        let a = session.try_connect().unwrap();
        let _b = session.try_connect().unwrap();
        assert!(session.try_connect().is_none());
        assert_eq!(session.connects_in_flight(), 2);

        drop(a);
        assert_eq!(session.connects_in_flight(), 1);
        assert!(session.try_connect().is_some());
    }

    #[test]
    fn test_permits_shared_across_threads() {
        let session = Arc::new(Session::with_connect_limit(3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.try_connect())
            })
            .collect();
        let permits: Vec<_> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
        assert_eq!(permits.len(), 3);
        drop(permits);
        assert_eq!(session.connects_in_flight(), 0);
    }

    #[test]
    fn test_ban_list() {
        let session = Session::new();
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        assert!(!session.is_banned(&ip));
        session.ban(ip);
        assert!(session.is_banned(&ip));
        assert_eq!(session.banned_count(), 1);
    }

    #[test]
    fn test_tracker_key_stable_per_url() {
        let session = Session::new();
        let a = session.tracker_key("http://a/announce");
        assert_eq!(a.len(), 8);
        assert_eq!(a, session.tracker_key("http://a/announce"));
        assert_ne!(a, session.tracker_key("http://b/announce"));
    }
}
