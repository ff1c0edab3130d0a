use crate::bencode::FromBencode;
use crate::peer::{
    Bitfield, Block, Chunk, ExtensionHandshake, ExtensionMessage, FrameDecoder, Message,
    ParseResult, PeerError, PeerId, EXTENSION_HANDSHAKE_ID, UT_PEX,
};
use crate::pex::{PexMessage, PexState};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::trace;

/// A validated message from an established peer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    Bitfield(Bitfield),
    Request(Chunk),
    Piece(Block),
    Cancel(Chunk),
    Extensions(ExtensionHandshake),
    /// Peer exchange, already capped to the configured number of
    /// addresses.
    Pex(PexMessage),
    /// Overlay-swarm payload, passed through untouched.
    Overlay(Bytes),
}

/// A peer connection past the BitTorrent handshake.
#[derive(Debug)]
pub struct Connection {
    pub(crate) addr: SocketAddr,
    pub(crate) peer_id: PeerId,
    pub(crate) locally_initiated: bool,
    /// The handshake advertised the extension protocol.
    pub(crate) supports_extensions: bool,
    decoder: FrameDecoder,
    /// Any message other than a keep-alive has arrived.
    got_anything: bool,
    remote_extensions: Option<ExtensionHandshake>,
    pub(crate) pex: PexState,
    piece_count: usize,
    pex_max: usize,
    pub(crate) last_received: Instant,
    pub(crate) last_sent: Instant,
}

impl Connection {
    pub(crate) fn new(
        addr: SocketAddr,
        peer_id: PeerId,
        locally_initiated: bool,
        supports_extensions: bool,
        piece_count: usize,
        pex_max: usize,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            peer_id,
            locally_initiated,
            supports_extensions,
            decoder: FrameDecoder::new(),
            got_anything: false,
            remote_extensions: None,
            pex: PexState::new(),
            piece_count,
            pex_max,
            last_received: now,
            last_sent: now,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn is_locally_initiated(&self) -> bool {
        self.locally_initiated
    }

    pub fn remote_extensions(&self) -> Option<&ExtensionHandshake> {
        self.remote_extensions.as_ref()
    }

    /// The id the peer wants `name` sent on, if it negotiated it.
    pub fn remote_extension_id(&self, name: &str) -> Option<u8> {
        self.remote_extensions.as_ref()?.get_extension_id(name)
    }

    /// Where the peer accepts connections: the address we dialled, or the
    /// port it announced in its extension handshake.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        if self.locally_initiated {
            return Some(self.addr);
        }
        let port = self.remote_extensions.as_ref()?.listen_port?;
        Some(SocketAddr::new(self.addr.ip(), port))
    }

    /// Feeds bytes from the socket and returns the messages they complete.
    ///
    /// Any malformed or out-of-place message fails the whole call; the
    /// connection must then be closed.
    pub fn receive(&mut self, data: &[u8], now: Instant) -> Result<Vec<PeerEvent>, PeerError> {
        self.last_received = now;
        self.decoder.extend(data);
        let mut events = Vec::new();
        loop {
            match self.decoder.next() {
                ParseResult::Complete(message) => {
                    if let Some(event) = self.validate(message)? {
                        events.push(event);
                    }
                }
                ParseResult::NeedMore => return Ok(events),
                ParseResult::Violation(e) => return Err(e),
            }
        }
    }

    fn check_index(&self, index: u32) -> Result<usize, PeerError> {
        if (index as usize) < self.piece_count {
            Ok(index as usize)
        } else {
            Err(PeerError::InvalidPieceIndex(index))
        }
    }

    fn validate(&mut self, message: Message) -> Result<Option<PeerEvent>, PeerError> {
        if matches!(message, Message::KeepAlive) {
            return Ok(None);
        }
        let first = !self.got_anything;
        // the extension handshake belongs to the handshake phase
        if !matches!(message, Message::Extended { id: EXTENSION_HANDSHAKE_ID, .. }) {
            self.got_anything = true;
        }

        let event = match message {
            Message::KeepAlive | Message::Port(_) | Message::Unknown { .. } => None,
            Message::Choke => Some(PeerEvent::Choke),
            Message::Unchoke => Some(PeerEvent::Unchoke),
            Message::Interested => Some(PeerEvent::Interested),
            Message::NotInterested => Some(PeerEvent::NotInterested),
            Message::Have { piece } => Some(PeerEvent::Have(self.check_index(piece)?)),
            Message::Bitfield(bits) => {
                if !first {
                    return Err(PeerError::Protocol("bitfield after other messages".into()));
                }
                Some(PeerEvent::Bitfield(Bitfield::from_bytes(&bits, self.piece_count)?))
            }
            Message::Request {
                index,
                begin,
                length,
            } => Some(PeerEvent::Request(Chunk::new(
                self.check_index(index)?,
                begin,
                length,
            ))),
            Message::Cancel {
                index,
                begin,
                length,
            } => Some(PeerEvent::Cancel(Chunk::new(
                self.check_index(index)?,
                begin,
                length,
            ))),
            Message::Piece { index, begin, data } => {
                if data.is_empty() {
                    return Err(PeerError::Protocol("empty piece".into()));
                }
                Some(PeerEvent::Piece(Block::new(self.check_index(index)?, begin, data)))
            }
            Message::Extended { id, payload } => self.extended(id, payload)?,
        };
        Ok(event)
    }

    fn extended(&mut self, id: u8, payload: Bytes) -> Result<Option<PeerEvent>, PeerError> {
        match ExtensionMessage::decode(id, payload)? {
            ExtensionMessage::Handshake(hs) => {
                trace!("{} speaks {:?}", self.addr, hs.extensions.keys());
                self.remote_extensions = Some(hs.clone());
                Ok(Some(PeerEvent::Extensions(hs)))
            }
            ExtensionMessage::Pex(payload) => {
                if self.pex_max == 0 || self.remote_extension_id(UT_PEX).is_none() {
                    return Ok(None);
                }
                let mut pex = PexMessage::from_bencode_bytes(&payload)?;
                pex.truncate_added(self.pex_max);
                Ok(Some(PeerEvent::Pex(pex)))
            }
            ExtensionMessage::Overlay(payload) => Ok(Some(PeerEvent::Overlay(payload))),
            ExtensionMessage::Unknown { .. } => Ok(None),
        }
    }
}
