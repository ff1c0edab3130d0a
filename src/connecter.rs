//! Established peer connections.
//!
//! The [`Connecter`] owns one [`Connection`] per socket that finished the
//! BitTorrent handshake. It turns incoming bytes into validated
//! [`PeerEvent`]s, negotiates the extension protocol and drives the
//! per-connection housekeeping: keep-alives, inactivity and PEX deltas.
//! What the events mean for downloading and uploading is up to the engine.

mod connection;

pub use connection::{Connection, PeerEvent};

use crate::constants::CLIENT_VERSION;
use crate::peer::{
    ExtensionHandshake, Message, PeerError, PeerId, EXTENSION_HANDSHAKE_ID, LOCAL_EXTENSIONS,
    OVERLAY_SWARM, UT_PEX,
};
use crate::pex::PexPeer;
use crate::rawserver::{Outgoing, SocketId};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ConnecterOptions {
    pub piece_count: usize,
    /// Port we accept connections on, announced as `p`.
    pub listen_port: u16,
    /// Addresses accepted from one PEX message; 0 ignores PEX.
    pub pex_max: usize,
    /// Advertise the overlay-swarm extension.
    pub overlay_support: bool,
}

#[derive(Debug)]
pub struct Connecter {
    options: ConnecterOptions,
    connections: BTreeMap<SocketId, Connection>,
}

impl Connecter {
    pub fn new(options: ConnecterOptions) -> Self {
        Self {
            options,
            connections: BTreeMap::new(),
        }
    }

    /// Registers a connection whose handshake just completed and sends our
    /// extension handshake if the peer speaks the extension protocol.
    pub fn connection_made(
        &mut self,
        id: SocketId,
        addr: SocketAddr,
        peer_id: PeerId,
        locally_initiated: bool,
        supports_extensions: bool,
        now: Instant,
        out: &mut Outgoing,
    ) -> &mut Connection {
        if supports_extensions {
            out.push((id, self.local_handshake(addr.ip())));
        }
        self.connections.entry(id).or_insert_with(|| {
            Connection::new(
                addr,
                peer_id,
                locally_initiated,
                supports_extensions,
                self.options.piece_count,
                self.options.pex_max,
                now,
            )
        })
    }

    fn local_handshake(&self, peer_ip: IpAddr) -> Message {
        let local: Vec<(&str, u8)> = LOCAL_EXTENSIONS
            .iter()
            .copied()
            .filter(|(name, _)| *name != OVERLAY_SWARM || self.options.overlay_support)
            .filter(|(name, _)| *name != UT_PEX || self.options.pex_max > 0)
            .collect();
        let mut hs = ExtensionHandshake::with_extensions(&local);
        hs.client = Some(CLIENT_VERSION.to_string());
        hs.listen_port = Some(self.options.listen_port);
        hs.yourip = Some(peer_ip);
        Message::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload: hs.encode(),
        }
    }

    pub fn lost_connection(&mut self, id: SocketId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: SocketId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.connections.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SocketId, &Connection)> {
        self.connections.iter().map(|(id, c)| (*id, c))
    }

    /// Parses bytes received on `id`. Bytes for an unknown socket are
    /// dropped.
    pub fn receive(
        &mut self,
        id: SocketId,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<PeerEvent>, PeerError> {
        match self.connections.get_mut(&id) {
            Some(conn) => conn.receive(data, now),
            None => Ok(Vec::new()),
        }
    }

    /// Records that something was written to `id`.
    pub fn note_sent(&mut self, id: SocketId, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.last_sent = now;
        }
    }

    /// Queues HAVE for a freshly verified piece on every connection.
    pub fn broadcast_have(&self, piece: usize, out: &mut Outgoing) {
        for id in self.connections.keys() {
            out.push((
                *id,
                Message::Have {
                    piece: piece as u32,
                },
            ));
        }
    }

    /// Queues a keep-alive on every connection idle for `interval`.
    pub fn keepalives(&mut self, now: Instant, interval: Duration, out: &mut Outgoing) {
        for (id, conn) in &mut self.connections {
            if now.saturating_duration_since(conn.last_sent) >= interval {
                out.push((*id, Message::KeepAlive));
                conn.last_sent = now;
            }
        }
    }

    /// Connections that have been silent for `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<SocketId> {
        self.connections
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_received) >= timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether a handshake from `peer_id` at `ip` duplicates a connection
    /// we already hold. With `security` set any second connection from the
    /// same IP counts.
    pub fn is_duplicate(&self, peer_id: &PeerId, ip: IpAddr, security: bool) -> bool {
        self.connections
            .values()
            .any(|c| c.peer_id == *peer_id || (security && c.addr.ip() == ip))
    }

    /// Sends every PEX-capable peer the added and dropped listen addresses
    /// since its last round.
    pub fn pex_round(&mut self, out: &mut Outgoing) {
        if self.options.pex_max == 0 {
            return;
        }
        let swarm: Vec<PexPeer> = self
            .connections
            .values()
            .filter_map(Connection::listen_addr)
            .map(PexPeer::new)
            .collect();

        for (id, conn) in &mut self.connections {
            let Some(remote_id) = conn.remote_extension_id(UT_PEX) else {
                continue;
            };
            let own = conn.listen_addr();
            let others: Vec<PexPeer> = swarm
                .iter()
                .filter(|p| Some(p.addr) != own)
                .cloned()
                .collect();
            if let Some(delta) = conn.pex.next_delta(&others) {
                debug!(
                    "pex to {}: {} added, {} dropped",
                    conn.addr,
                    delta.added.len(),
                    delta.dropped.len()
                );
                out.push((
                    *id,
                    Message::Extended {
                        id: remote_id,
                        payload: delta.encode(),
                    },
                ));
            }
        }
    }
}
