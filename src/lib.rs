//! swarmcore - a single-torrent BitTorrent swarm engine
//!
//! This library implements the core of a BitTorrent client: the peer wire
//! protocol, piece scheduling, choking, verified storage and the HTTP
//! tracker client, tied together by a per-torrent [`Engine`].
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding and typed schema access
//! - [`metainfo`] - BEP-3/12 `.torrent` parsing and info hashes
//! - [`peer`] - BEP-3/10 wire messages, framing, bitfields and extension handshakes
//! - [`pex`] - BEP-11 Peer Exchange payloads and deltas
//! - [`storage`] - Piece storage, verification, write buffering and resume snapshots
//! - [`picker`] - Rarest-first, streaming and super-seed piece selection
//! - [`choker`] - Upload slot selection with optimistic unchoke
//! - [`download`] / [`upload`] - Per-peer request and serving state
//! - [`connecter`] / [`encrypter`] - Established connections and admission
//! - [`tracker`] - BEP-3/23 HTTP tracker announces with tier failover
//! - [`rawserver`] - The socket and timer event loop
//! - [`engine`] - The per-torrent engine and its control handle
//!
//! Process-wide limits shared by several engines live in [`session`];
//! user options in [`config`].

pub mod bandwidth;
pub mod bencode;
pub mod choker;
pub mod config;
pub mod connecter;
pub mod constants;
pub mod download;
pub mod encrypter;
pub mod engine;
pub mod metainfo;
pub mod peer;
pub mod pex;
pub mod picker;
pub mod rate;
pub mod rawserver;
pub mod session;
pub mod storage;
pub mod tracker;
pub mod upload;

pub use bencode::{decode, encode, BencodeError, FromBencode, Value};
pub use config::{AllocType, Config, ConfigError};
pub use engine::{Command, Engine, EngineError, EngineHandle, Status};
pub use metainfo::{File, Info, InfoHash, Metainfo, MetainfoError};
pub use peer::{Bitfield, Block, Chunk, ExtensionHandshake, Handshake, Message, PeerError, PeerId};
pub use pex::{PexFlags, PexMessage, PexPeer};
pub use session::Session;
pub use storage::{FileEntry, Snapshot, StorageBackend, StorageError, StorageWrapper};
pub use tracker::{AnnounceResponse, HttpTracker, Rerequester, TrackerError, TrackerEvent};
