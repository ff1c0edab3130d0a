use crate::peer::{Handshake, PeerError, HANDSHAKE_LEN, HANDSHAKE_PREFIX_LEN, PROTOCOL};
use crate::session::ConnectPermit;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Instant;

/// End of the info hash within the handshake.
const INFO_HASH_END: usize = HANDSHAKE_PREFIX_LEN + 20;

/// A socket still exchanging the BitTorrent handshake.
#[derive(Debug)]
pub struct PendingHandshake {
    pub(crate) addr: SocketAddr,
    pub(crate) locally_initiated: bool,
    pub(crate) started: Instant,
    buf: BytesMut,
    /// Connect slot held until the handshake finishes or fails.
    _permit: Option<ConnectPermit>,
}

/// The remote half of a finished handshake.
#[derive(Debug)]
pub struct Completed {
    pub handshake: Handshake,
    /// Bytes that followed the handshake in the same read.
    pub rest: Bytes,
}

impl PendingHandshake {
    pub(crate) fn new(
        addr: SocketAddr,
        locally_initiated: bool,
        permit: Option<ConnectPermit>,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            locally_initiated,
            started: now,
            buf: BytesMut::with_capacity(HANDSHAKE_LEN),
            _permit: permit,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accumulates handshake bytes, failing as soon as the received prefix
    /// cannot belong to a handshake for `info_hash`.
    pub fn feed(&mut self, data: &[u8], info_hash: &[u8; 20]) -> Result<Option<Completed>, PeerError> {
        if data.is_empty() {
            return Ok(None);
        }
        let before = self.buf.len();
        self.buf.extend_from_slice(data);

        let header = 1 + PROTOCOL.len();
        if before == 0 && self.buf[0] as usize != PROTOCOL.len() {
            return Err(PeerError::InvalidHandshake);
        }
        if before < header && self.buf.len() >= header && &self.buf[1..header] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }
        if before < INFO_HASH_END
            && self.buf.len() >= INFO_HASH_END
            && &self.buf[HANDSHAKE_PREFIX_LEN..INFO_HASH_END] != info_hash
        {
            return Err(PeerError::InfoHashMismatch);
        }
        if self.buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let rest = self.buf.split_off(HANDSHAKE_LEN).freeze();
        let handshake = Handshake::decode(&self.buf)?;
        Ok(Some(Completed { handshake, rest }))
    }
}
