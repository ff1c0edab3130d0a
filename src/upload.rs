//! Serving chunks to peers.
//!
//! Each connection gets an [`Upload`] holding the requests the peer has
//! queued with us and whether we are choking it. The [`Uploader`] owns them
//! all, reads the data from storage and queues PIECE messages while the
//! upload rate limit and the socket backlog allow.

use crate::bandwidth::TokenBucket;
use crate::config::Config;
use crate::constants::UPLOAD_HIGH_WATER;
use crate::peer::{Chunk, Message, PeerError};
use crate::rate::RateMeter;
use crate::rawserver::{Outgoing, SocketId};
use crate::storage::{StorageError, StorageWrapper};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub max_slice_length: u32,
    pub max_rate_period: Duration,
    pub rate_fudge: Duration,
    /// Bytes per second, 0 for unlimited.
    pub max_upload_rate: u64,
    pub breakup_seed_bitfield: bool,
}

impl From<&Config> for UploadOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_slice_length: config.max_slice_length,
            max_rate_period: config.max_rate_period,
            rate_fudge: config.upload_rate_fudge,
            max_upload_rate: config.max_upload_rate * 1024,
            breakup_seed_bitfield: config.breakup_seed_bitfield,
        }
    }
}

/// Upload state for one connection.
#[derive(Debug)]
pub struct Upload {
    id: SocketId,
    ip: IpAddr,
    /// We are choking the peer.
    choked: bool,
    /// The peer wants our data.
    interested: bool,
    ever_interested: bool,
    buffer: VecDeque<Chunk>,
    measure: RateMeter,
    /// Pieces revealed to this peer while super-seeding. `None` when not
    /// super-seeding.
    offered: Option<HashSet<usize>>,
    /// Super-seed offers the peer ignored.
    pub(crate) skipped: u32,
}

impl Upload {
    fn new(id: SocketId, ip: IpAddr, options: &UploadOptions, now: Instant) -> Self {
        Self {
            id,
            ip,
            choked: true,
            interested: false,
            ever_interested: false,
            buffer: VecDeque::new(),
            measure: RateMeter::new_at(options.max_rate_period, options.rate_fudge, now),
            offered: None,
            skipped: 0,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn is_interested(&self) -> bool {
        self.interested
    }

    pub fn ever_interested(&self) -> bool {
        self.ever_interested
    }

    pub fn queued_requests(&self) -> usize {
        self.buffer.len()
    }

    pub fn rate(&mut self, now: Instant) -> f64 {
        self.measure.rate_at(now)
    }

    pub fn total(&self) -> u64 {
        self.measure.total()
    }

    pub fn is_super_seeding(&self) -> bool {
        self.offered.is_some()
    }

    /// Reveals a piece to a super-seeding peer with a HAVE.
    pub fn offer(&mut self, piece: usize, out: &mut Outgoing) {
        if let Some(offered) = &mut self.offered {
            offered.insert(piece);
        }
        out.push((
            self.id,
            Message::Have {
                piece: piece as u32,
            },
        ));
    }

    /// Returns true if the choker should run again.
    pub fn got_interested(&mut self) -> bool {
        if self.interested {
            return false;
        }
        self.interested = true;
        self.ever_interested = true;
        !self.choked
    }

    /// Returns true if the choker should run again.
    pub fn got_not_interested(&mut self) -> bool {
        if !self.interested {
            return false;
        }
        self.interested = false;
        self.buffer.clear();
        !self.choked
    }

    /// Queues a REQUEST.
    ///
    /// Requests for pieces we do not hold, oversized requests and requests
    /// from a peer that never declared interest are protocol violations.
    /// Requests arriving while we choke the peer crossed our CHOKE and are
    /// dropped.
    pub fn got_request(
        &mut self,
        chunk: Chunk,
        storage: &StorageWrapper,
        max_slice_length: u32,
    ) -> Result<(), PeerError> {
        if !self.interested {
            return Err(PeerError::Protocol("request while not interested".into()));
        }
        if chunk.length == 0 || chunk.length > max_slice_length {
            return Err(PeerError::Protocol(format!(
                "request of {} bytes",
                chunk.length
            )));
        }
        if let Some(offered) = &self.offered {
            if !offered.contains(&chunk.piece) {
                return Err(PeerError::Protocol(format!(
                    "request for piece {} that was not offered",
                    chunk.piece
                )));
            }
        }
        if !storage.do_i_have(chunk.piece) {
            return Err(PeerError::Protocol(format!(
                "request for piece {} we do not have",
                chunk.piece
            )));
        }
        if chunk.end() > storage.piece_size(chunk.piece) {
            return Err(PeerError::Protocol(format!(
                "request past the end of piece {}",
                chunk.piece
            )));
        }
        if self.choked {
            return Ok(());
        }
        if !self.buffer.contains(&chunk) {
            self.buffer.push_back(chunk);
        }
        Ok(())
    }

    /// Drops a queued request. Unknown chunks are ignored.
    pub fn got_cancel(&mut self, chunk: &Chunk) {
        self.buffer.retain(|c| c != chunk);
    }

    pub(crate) fn choke(&mut self, out: &mut Outgoing) {
        if !self.choked {
            self.choked = true;
            self.buffer.clear();
            out.push((self.id, Message::Choke));
        }
    }

    pub(crate) fn unchoke(&mut self, out: &mut Outgoing) {
        if self.choked {
            self.choked = false;
            out.push((self.id, Message::Unchoke));
        }
    }
}

/// Why [`Uploader::pump`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Nothing left to send, or the peer is choked.
    Idle,
    /// The socket has enough queued; resume when it drains.
    Backlogged,
    /// The rate limit ran out; resume after the delay.
    Throttled(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pumped {
    pub state: PumpState,
    /// Pieces that turned out not to be held any more while reading them.
    pub lost: Vec<usize>,
}

pub struct Uploader {
    options: UploadOptions,
    uploads: BTreeMap<SocketId, Upload>,
    bucket: TokenBucket,
    measure: RateMeter,
}

impl Uploader {
    pub fn new(options: UploadOptions, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new_at(options.max_upload_rate, now),
            measure: RateMeter::new_at(options.max_rate_period, options.rate_fudge, now),
            options,
            uploads: BTreeMap::new(),
        }
    }

    pub fn make_upload(&mut self, id: SocketId, ip: IpAddr, now: Instant) {
        let upload = Upload::new(id, ip, &self.options, now);
        self.uploads.insert(id, upload);
    }

    pub fn lost_connection(&mut self, id: SocketId) -> Option<Upload> {
        self.uploads.remove(&id)
    }

    pub fn get(&self, id: SocketId) -> Option<&Upload> {
        self.uploads.get(&id)
    }

    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut Upload> {
        self.uploads.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    pub fn max_slice_length(&self) -> u32 {
        self.options.max_slice_length
    }

    pub fn rate(&mut self, now: Instant) -> f64 {
        self.measure.rate_at(now)
    }

    pub fn total(&self) -> u64 {
        self.measure.total()
    }

    pub fn set_max_rate(&mut self, bytes_per_sec: u64) {
        self.bucket.set_rate(bytes_per_sec);
    }

    /// Announces what we have to a freshly connected peer.
    ///
    /// Seeds with `breakup_seed_bitfield` mask a few pieces and follow up
    /// with HAVEs for them. Super-seeders announce nothing up front.
    pub fn send_initial(
        &mut self,
        id: SocketId,
        storage: &mut StorageWrapper,
        super_seeding: bool,
        out: &mut Outgoing,
    ) {
        let Some(upload) = self.uploads.get_mut(&id) else {
            return;
        };
        if super_seeding {
            upload.offered = Some(HashSet::new());
            return;
        }
        if storage.have_list().is_empty() {
            return;
        }
        let (bitfield, masked) = if self.options.breakup_seed_bitfield && storage.is_complete() {
            storage.have_list_cloaked()
        } else {
            (storage.have_list().clone(), Vec::new())
        };
        out.push((id, Message::Bitfield(bitfield.to_bytes())));
        for piece in masked {
            out.push((
                id,
                Message::Have {
                    piece: piece as u32,
                },
            ));
        }
    }

    /// Applies a choker decision.
    pub fn set_choked(&mut self, id: SocketId, choked: bool, out: &mut Outgoing) {
        if let Some(upload) = self.uploads.get_mut(&id) {
            if choked {
                upload.choke(out);
            } else {
                upload.unchoke(out);
            }
        }
    }

    /// Queues PIECE messages for `id` until its requests run out, the rate
    /// limit is hit or the socket already holds enough. `queued` is what
    /// the socket has buffered right now.
    ///
    /// Pieces that fail a re-check on read are reported in
    /// [`Pumped::lost`] and their requests dropped; other storage errors
    /// are fatal.
    pub async fn pump(
        &mut self,
        id: SocketId,
        storage: &mut StorageWrapper,
        queued: usize,
        out: &mut Outgoing,
        now: Instant,
    ) -> Result<Pumped, StorageError> {
        let mut lost = Vec::new();
        let mut pending = queued;
        let state = loop {
            let Some(upload) = self.uploads.get_mut(&id) else {
                break PumpState::Idle;
            };
            if upload.choked {
                break PumpState::Idle;
            }
            let Some(&chunk) = upload.buffer.front() else {
                break PumpState::Idle;
            };
            if pending >= UPLOAD_HIGH_WATER {
                break PumpState::Backlogged;
            }
            let length = chunk.length as usize;
            if !self.bucket.try_consume(length, now) {
                break PumpState::Throttled(self.bucket.time_until(length, now));
            }
            upload.buffer.pop_front();

            let data = match storage.get_piece(chunk.piece, chunk.begin, chunk.length).await {
                Ok(data) => data,
                Err(StorageError::HashMismatch(piece) | StorageError::NotHeld(piece)) => {
                    warn!("piece {} unavailable while serving {}", piece, id);
                    upload.buffer.retain(|c| c.piece != piece);
                    lost.push(piece);
                    continue;
                }
                Err(e) => return Err(e),
            };
            upload.measure.update_at(length as u64, now);
            self.measure.update_at(length as u64, now);
            let message = Message::Piece {
                index: chunk.piece as u32,
                begin: chunk.begin,
                data,
            };
            pending += message.wire_len();
            out.push((id, message));
        };
        if !lost.is_empty() {
            debug!("{} pieces dropped from the have set while uploading", lost.len());
        }
        Ok(Pumped { state, lost })
    }
}
