//! Connection admission.
//!
//! The [`Encrypter`] owns every socket that has not finished the
//! BitTorrent handshake. It decides which outbound connects to start,
//! which incoming sockets to accept and which finished handshakes may
//! become peer connections.

mod handshake;

pub use handshake::{Completed, PendingHandshake};

use crate::config::Config;
use crate::connecter::Connecter;
use crate::constants::REANNOUNCE_WINDOW;
use crate::peer::{Handshake, PeerError, PeerId};
use crate::rawserver::SocketId;
use crate::session::{ConnectPermit, Session};
use bytes::Bytes;
use rand::Rng as _;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct EncrypterOptions {
    /// Stop starting connects once this many peers are connected or
    /// connecting.
    pub max_initiate: usize,
    /// Refuse connections beyond this many.
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    /// One connection per IP.
    pub security: bool,
}

impl From<&Config> for EncrypterOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_initiate: config.max_initiate,
            max_connections: config.connection_limit(),
            handshake_timeout: config.handshake_timeout,
            security: config.security,
        }
    }
}

/// A handshake that passed admission.
#[derive(Debug)]
pub struct Admitted {
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    pub locally_initiated: bool,
    pub supports_extensions: bool,
    pub rest: Bytes,
}

/// Connects released by [`Encrypter::next_connects`].
#[derive(Debug, Default)]
pub struct Connects {
    pub start: Vec<(SocketAddr, ConnectPermit)>,
    /// The process-wide connect quota was full; try again later.
    pub deferred: bool,
}

#[derive(Debug)]
pub struct Encrypter {
    options: EncrypterOptions,
    info_hash: [u8; 20],
    peer_id: PeerId,
    session: Arc<Session>,
    pending: BTreeMap<SocketId, PendingHandshake>,
    queue: VecDeque<SocketAddr>,
    /// Addresses with a TCP connect in flight.
    connecting: HashSet<SocketAddr>,
}

impl Encrypter {
    pub fn new(
        options: EncrypterOptions,
        info_hash: [u8; 20],
        peer_id: PeerId,
        session: Arc<Session>,
    ) -> Self {
        Self {
            options,
            info_hash,
            peer_id,
            session,
            pending: BTreeMap::new(),
            queue: VecDeque::new(),
            connecting: HashSet::new(),
        }
    }

    fn handshake(&self) -> Bytes {
        Handshake::new(self.info_hash, *self.peer_id.as_bytes()).encode()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    /// Queues addresses to connect to. Banned, queued and in-progress
    /// addresses are skipped.
    pub fn enqueue<I>(&mut self, addrs: I)
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        for addr in addrs {
            if self.session.is_banned(&addr.ip())
                || self.connecting.contains(&addr)
                || self.queue.contains(&addr)
                || self.pending.values().any(|p| p.addr == addr)
            {
                continue;
            }
            self.queue.push_back(addr);
        }
    }

    /// Pulls queued addresses while fewer than `max_initiate` peers are
    /// connected or connecting and the session grants connect permits.
    pub fn next_connects(&mut self, established: usize) -> Connects {
        let mut connects = Connects::default();
        while let Some(addr) = self.queue.front().copied() {
            let busy = established + self.pending.len() + self.connecting.len();
            if busy >= self.options.max_initiate {
                break;
            }
            let Some(permit) = self.session.try_connect() else {
                connects.deferred = true;
                break;
            };
            self.queue.pop_front();
            self.connecting.insert(addr);
            connects.start.push((addr, permit));
        }
        connects
    }

    /// An outbound connect finished. Returns our handshake to send.
    pub fn connected(
        &mut self,
        id: SocketId,
        addr: SocketAddr,
        permit: Option<ConnectPermit>,
        now: Instant,
    ) -> Bytes {
        self.connecting.remove(&addr);
        trace!("connected to {} as {}", addr, id);
        self.pending
            .insert(id, PendingHandshake::new(addr, true, permit, now));
        self.handshake()
    }

    pub fn connect_failed(&mut self, addr: SocketAddr) {
        self.connecting.remove(&addr);
    }

    /// An incoming socket. Returns our handshake to send, or `None` if the
    /// socket must be closed.
    pub fn accepted(
        &mut self,
        id: SocketId,
        addr: SocketAddr,
        established: usize,
        now: Instant,
    ) -> Option<Bytes> {
        if self.session.is_banned(&addr.ip()) {
            debug!("refusing banned {}", addr);
            return None;
        }
        if established + self.pending.len() >= self.options.max_connections {
            debug!("refusing {}: connection limit reached", addr);
            return None;
        }
        self.pending
            .insert(id, PendingHandshake::new(addr, false, None, now));
        Some(self.handshake())
    }

    /// Feeds handshake bytes. Once the handshake is complete and admitted
    /// the socket leaves the encrypter; errors mean it must be closed.
    pub fn receive(
        &mut self,
        id: SocketId,
        data: &[u8],
        connecter: &Connecter,
    ) -> Result<Option<Admitted>, PeerError> {
        let Some(pending) = self.pending.get_mut(&id) else {
            return Ok(None);
        };
        let completed = match pending.feed(data, &self.info_hash) {
            Ok(Some(completed)) => completed,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.pending.remove(&id);
                return Err(e);
            }
        };
        let Some(pending) = self.pending.remove(&id) else {
            return Ok(None);
        };

        let peer_id = PeerId(completed.handshake.peer_id);
        if peer_id == self.peer_id {
            return Err(PeerError::Protocol("connected to ourselves".into()));
        }
        if self.session.is_banned(&pending.addr.ip()) {
            return Err(PeerError::Protocol("banned address".into()));
        }
        if connecter.is_duplicate(&peer_id, pending.addr.ip(), self.options.security) {
            return Err(PeerError::Protocol("duplicate connection".into()));
        }
        if connecter.len() >= self.options.max_connections {
            return Err(PeerError::Protocol("connection limit reached".into()));
        }

        Ok(Some(Admitted {
            addr: pending.addr,
            peer_id,
            locally_initiated: pending.locally_initiated,
            supports_extensions: completed.handshake.supports_extension_protocol(),
            rest: completed.rest,
        }))
    }

    /// Forgets a socket that closed before finishing the handshake.
    pub fn closed(&mut self, id: SocketId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Sockets whose handshake took longer than the handshake timeout.
    /// They are dropped here and must be closed by the caller.
    pub fn expire(&mut self, now: Instant) -> Vec<SocketId> {
        let timeout = self.options.handshake_timeout;
        let expired: Vec<SocketId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.started) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.pending.remove(id);
        }
        expired
    }

    /// Drops everything not yet connected.
    pub fn close_all(&mut self) -> Vec<SocketId> {
        self.queue.clear();
        std::mem::take(&mut self.pending).into_keys().collect()
    }
}

/// Delay before re-announcing after the swarm emptied.
pub fn reannounce_delay() -> Duration {
    let (low, high) = REANNOUNCE_WINDOW;
    Duration::from_secs(rand::rng().random_range(low..=high))
}

#[cfg(test)]
mod tests;
