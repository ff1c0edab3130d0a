//! Peer wire protocol (BEP-3, BEP-10)
//!
//! This module holds the pure data side of the wire protocol: the handshake,
//! message encoding, the incremental frame decoder, bitfields, chunks and
//! the extension handshake. Connection state machines live in
//! [`crate::connecter`] and [`crate::encrypter`].

mod bitfield;
mod chunk;
mod codec;
mod error;
mod extension;
mod message;
mod peer_id;

pub use bitfield::Bitfield;
pub use chunk::{chunk_count, slice_piece, Block, Chunk};
pub use codec::{FrameDecoder, ParseResult};
pub use error::PeerError;
pub use extension::{
    ExtensionHandshake, ExtensionMessage, EXTENSION_HANDSHAKE_ID, LOCAL_EXTENSIONS,
    OVERLAY_SWARM, UT_PEX,
};
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN, HANDSHAKE_PREFIX_LEN, PROTOCOL};
pub use peer_id::PeerId;
