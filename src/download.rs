//! Request scheduling.
//!
//! The [`Downloader`] keeps a [`SingleDownload`] per connection and decides
//! which chunks to ask each peer for. It pipelines requests up to a
//! rate-dependent backlog, hands chunks back to storage when a peer chokes
//! or disappears, notices peers that stop sending, and switches to endgame
//! once every remaining chunk has been requested: from then on outstanding
//! chunks are asked of every peer that has them and cancelled everywhere
//! else when the first copy arrives.
//!
//! Calls that change what is sent queue messages on an [`Outgoing`] list;
//! the engine writes them out once the handler returns.

mod guard;
mod single;

pub use guard::{BadDataGuard, PerIpStats, Verdict};
pub use single::SingleDownload;

use crate::bandwidth::TokenBucket;
use crate::config::Config;
use crate::peer::{Bitfield, Block, Chunk};
use crate::picker::{PickOptions, PiecePicker};
use crate::rate::RateMeter;
use crate::rawserver::{Outgoing, SocketId};
use crate::storage::{PieceStatus, StorageError, StorageWrapper};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// High-priority streaming requests unanswered for this long are moved to
/// another peer.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Timeouts after which a peer no longer gets high-priority streaming
/// pieces.
const STREAM_BAD_PERFORMANCE_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub chunk_size: u32,
    pub snub_time: Duration,
    pub max_rate_period: Duration,
    pub rate_fudge: Duration,
    /// Bytes per second, 0 for unlimited.
    pub max_download_rate: u64,
    pub auto_kick: bool,
}

impl From<&Config> for DownloadOptions {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.download_slice_size,
            snub_time: config.snub_time,
            max_rate_period: config.max_rate_period,
            rate_fudge: config.upload_rate_fudge,
            max_download_rate: config.max_download_rate * 1024,
            auto_kick: config.auto_kick,
        }
    }
}

/// The pieces of engine state the downloader works against.
pub struct DownloadContext<'a> {
    pub storage: &'a mut StorageWrapper,
    pub picker: &'a mut PiecePicker,
}

/// Follow-up work for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Verified; announce it with HAVE.
    PieceComplete(usize),
    /// Failed its hash check and was reset.
    PieceFailed(usize),
    /// Disconnect this address.
    Kick(IpAddr),
    /// Disconnect and ban this address.
    Ban(IpAddr),
}

pub struct Downloader {
    options: DownloadOptions,
    downloads: BTreeMap<SocketId, SingleDownload>,
    endgame: bool,
    /// Every outstanding chunk while in endgame.
    endgame_requests: BTreeSet<Chunk>,
    bucket: TokenBucket,
    guard: BadDataGuard,
    measure: RateMeter,
    discarded: u64,
}

impl Downloader {
    pub fn new(options: DownloadOptions, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new_at(options.max_download_rate, now),
            guard: BadDataGuard::new(options.auto_kick),
            measure: RateMeter::new_at(options.max_rate_period, options.rate_fudge, now),
            options,
            downloads: BTreeMap::new(),
            endgame: false,
            endgame_requests: BTreeSet::new(),
            discarded: 0,
        }
    }

    pub fn make_download(&mut self, id: SocketId, ip: IpAddr, piece_count: usize, now: Instant) {
        let download = SingleDownload::new(id, ip, piece_count, &self.options, now);
        self.downloads.insert(id, download);
    }

    pub fn get(&self, id: SocketId) -> Option<&SingleDownload> {
        self.downloads.get(&id)
    }

    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut SingleDownload> {
        self.downloads.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    pub fn endgame_requests(&self) -> impl Iterator<Item = &Chunk> {
        self.endgame_requests.iter()
    }

    /// Bytes received that nobody asked for.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn guard(&self) -> &BadDataGuard {
        &self.guard
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

    /// Requests the rate limiter still allows to be outstanding.
    fn queue_limit(&mut self, now: Instant) -> usize {
        if self.bucket.is_unlimited() {
            return usize::MAX / 4;
        }
        (self.bucket.available(now) / self.options.chunk_size as f64) as usize
    }

    pub fn is_snubbed(&self, id: SocketId, now: Instant) -> bool {
        self.downloads
            .get(&id)
            .is_some_and(|d| d.is_snubbed(now, self.options.snub_time))
    }

    // ------------------------------------------------------------------
    // Peer announcements
    // ------------------------------------------------------------------

    /// Records the peer's initial bitfield.
    pub fn got_bitfield(
        &mut self,
        id: SocketId,
        have: Bitfield,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) {
        let Some(d) = self.downloads.get_mut(&id) else {
            return;
        };
        if have.is_complete() {
            ctx.picker.got_seed();
            d.is_seed = true;
        } else {
            for piece in have.iter_set() {
                ctx.picker.got_have(piece);
            }
        }
        let interesting = have.iter_set().any(|p| wants(ctx.storage, p));
        d.have = have;
        if interesting {
            d.set_interested(true, out);
        }
        self.request_more(id, ctx, out, false, now);
    }

    /// Records a HAVE. Repeats for a piece already known are ignored.
    pub fn got_have(
        &mut self,
        id: SocketId,
        piece: usize,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) {
        let Some(d) = self.downloads.get_mut(&id) else {
            return;
        };
        if !d.have.set(piece) {
            return;
        }
        if !d.is_seed {
            ctx.picker.got_have(piece);
            if d.have.is_complete() {
                ctx.picker.became_seed(&d.have);
                d.is_seed = true;
            }
        }
        if wants(ctx.storage, piece) {
            d.set_interested(true, out);
            if !d.choked {
                self.request_more(id, ctx, out, false, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Choking
    // ------------------------------------------------------------------

    pub fn got_unchoke(
        &mut self,
        id: SocketId,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) {
        let Some(d) = self.downloads.get_mut(&id) else {
            return;
        };
        if !d.choked {
            return;
        }
        d.choked = false;
        d.last2 = now;
        if d.interested {
            self.request_more(id, ctx, out, true, now);
        }
    }

    /// The peer choked us: its outstanding requests go back to storage
    /// (outside endgame) and other peers pick them up.
    pub fn got_choke(
        &mut self,
        id: SocketId,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) {
        let Some(d) = self.downloads.get_mut(&id) else {
            return;
        };
        if d.choked {
            return;
        }
        d.choked = true;
        self.let_go(id, ctx, out, now);
    }

    fn let_go(
        &mut self,
        id: SocketId,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) {
        let Some(d) = self.downloads.get_mut(&id) else {
            return;
        };
        if d.active.is_empty() {
            return;
        }
        let lost: Vec<Chunk> = d.active.drain(..).map(|r| r.chunk).collect();
        if self.endgame {
            self.refill_endgame(id, ctx, out, now);
            return;
        }
        let mut lost_pieces = BTreeSet::new();
        for chunk in &lost {
            ctx.storage.request_lost(chunk.piece, chunk.begin, chunk.length);
            lost_pieces.insert(chunk.piece);
        }
        debug!("returned {} requests from {}", lost.len(), id);

        let mut others: Vec<SocketId> = self
            .downloads
            .iter()
            .filter(|(other, d)| **other != id && !d.choked)
            .map(|(other, _)| *other)
            .collect();
        others.shuffle(&mut rand::rng());
        for other in others {
            self.request_more(other, ctx, out, false, now);
        }

        for d in self.downloads.values_mut() {
            if d.choked && !d.interested {
                let wanted = lost_pieces
                    .iter()
                    .any(|&p| d.have.has(p) && ctx.storage.do_i_have_requests(p));
                if wanted {
                    d.set_interested(true, out);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Tops up every unchoked peer's pipeline.
    pub fn fill_all(&mut self, ctx: &mut DownloadContext<'_>, out: &mut Outgoing, now: Instant) {
        let ids: Vec<SocketId> = self.downloads.keys().copied().collect();
        for id in ids {
            self.request_more(id, ctx, out, false, now);
        }
    }

    pub fn request_more(
        &mut self,
        id: SocketId,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        just_unchoked: bool,
        now: Instant,
    ) {
        if self.endgame {
            self.fix_endgame(id, ctx, out, now);
            return;
        }
        let queue_limit = self.queue_limit(now);
        let too_many_partials = ctx.storage.partial_pieces().len() > self.downloads.len() / 2;
        let chunk_size = self.options.chunk_size;
        let DownloadContext { storage, picker } = ctx;

        let Some(d) = self.downloads.get_mut(&id) else {
            return;
        };
        if d.choked {
            return;
        }
        let backlog = d.backlog(just_unchoked, queue_limit, chunk_size, now);
        let avoid = streaming_avoid(picker, d);

        while d.active.len() < backlog {
            let storage_view: &StorageWrapper = storage;
            let Some(piece) = picker.next(
                &d.have,
                |p| storage_view.do_i_have_requests(p),
                PickOptions {
                    too_many_partials,
                    avoid: avoid.as_ref(),
                    will_request: true,
                },
            ) else {
                break;
            };
            d.set_interested(true, out);
            while d.active.len() < backlog {
                let Ok((begin, length)) = storage.new_request(piece) else {
                    break;
                };
                picker.requested(piece);
                d.push_request(Chunk::new(piece, begin, length), now, out);
                self.bucket.charge(length as usize, now);
                if !storage.do_i_have_requests(piece) {
                    break;
                }
            }
        }

        if d.active.is_empty() && !d.have.iter_set().any(|p| wants(storage, p)) {
            d.set_interested(false, out);
        }

        if storage.amount_inactive() == 0 && storage.amount_active() > 0 {
            self.start_endgame(ctx, out, now);
        }
    }

    fn start_endgame(&mut self, ctx: &mut DownloadContext<'_>, out: &mut Outgoing, now: Instant) {
        if self.endgame {
            return;
        }
        self.endgame = true;
        self.endgame_requests = self
            .downloads
            .values()
            .flat_map(|d| d.active_requests())
            .collect();
        info!(
            "entering endgame with {} outstanding requests",
            self.endgame_requests.len()
        );
        let ids: Vec<SocketId> = self.downloads.keys().copied().collect();
        for id in ids {
            self.fix_endgame(id, ctx, out, now);
        }
    }

    /// Endgame refill: ask this peer for every outstanding chunk it has and
    /// is not already fetching, up to its backlog.
    fn fix_endgame(
        &mut self,
        id: SocketId,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) {
        let queue_limit = self.queue_limit(now);
        let chunk_size = self.options.chunk_size;
        let Some(d) = self.downloads.get_mut(&id) else {
            return;
        };
        let mut want: Vec<Chunk> = self
            .endgame_requests
            .iter()
            .filter(|c| d.have.has(c.piece) && !d.holds(c))
            .copied()
            .collect();
        if d.active.is_empty() && want.is_empty() {
            let interesting = d.have.iter_set().any(|p| wants(ctx.storage, p));
            if !interesting {
                d.set_interested(false, out);
            }
            return;
        }
        if !want.is_empty() {
            d.set_interested(true, out);
        }
        if d.choked {
            return;
        }
        let backlog = d.backlog(false, queue_limit, chunk_size, now);
        want.shuffle(&mut rand::rng());
        want.truncate(backlog.saturating_sub(d.active.len()));
        for chunk in want {
            d.push_request(chunk, now, out);
            self.bucket.charge(chunk.length as usize, now);
        }
    }

    /// Another peer dropped its endgame requests; every other unchoked
    /// peer is asked again so no outstanding chunk is left unrequested.
    fn refill_endgame(
        &mut self,
        gone: SocketId,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) {
        let ids: Vec<SocketId> = self
            .downloads
            .iter()
            .filter(|(id, d)| **id != gone && !d.choked)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.fix_endgame(id, ctx, out, now);
        }

        // chunks nobody holds any more go to the least loaded unchoked
        // peer that has them, even past its backlog
        let orphans: Vec<Chunk> = self
            .endgame_requests
            .iter()
            .filter(|c| !self.downloads.values().any(|d| d.holds(c)))
            .copied()
            .collect();
        for chunk in orphans {
            let taker = self
                .downloads
                .iter_mut()
                .filter(|(id, d)| **id != gone && !d.choked && d.have.has(chunk.piece))
                .min_by_key(|(_, d)| d.active.len());
            if let Some((_, d)) = taker {
                d.set_interested(true, out);
                d.push_request(chunk, now, out);
                self.bucket.charge(chunk.length as usize, now);
            }
        }
    }

    fn reset_endgame(&mut self, ctx: &mut DownloadContext<'_>) {
        for chunk in std::mem::take(&mut self.endgame_requests) {
            ctx.storage.request_lost(chunk.piece, chunk.begin, chunk.length);
        }
        self.endgame = false;
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    /// Handles a PIECE message.
    ///
    /// Chunks that are not outstanding on this connection are discarded.
    /// Storage errors are fatal to the torrent and are returned as such.
    pub async fn got_piece(
        &mut self,
        id: SocketId,
        block: Block,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) -> Result<Vec<DownloadEvent>, StorageError> {
        let chunk = block.chunk();
        let length = block.data.len() as u64;
        let Some(d) = self.downloads.get_mut(&id) else {
            return Ok(Vec::new());
        };
        if !d.remove_active(&chunk) {
            self.discarded += length;
            return Ok(Vec::new());
        }
        d.received(length, now);
        let ip = d.ip;
        self.measure.update_at(length, now);
        if self.endgame {
            self.endgame_requests.remove(&chunk);
            for (other, od) in self.downloads.iter_mut() {
                if *other != id && od.remove_active(&chunk) {
                    od.send_cancel(chunk, out);
                }
            }
        }

        let status = ctx
            .storage
            .piece_came_in(chunk.piece, chunk.begin, block.data, Some(ip))
            .await?;

        let mut events = Vec::new();
        match status {
            PieceStatus::Incomplete | PieceStatus::Ignored => {}
            PieceStatus::Complete { good, bad } => {
                ctx.picker.complete(chunk.piece);
                events.push(DownloadEvent::PieceComplete(chunk.piece));
                for ip in good {
                    self.guard.good(ip, chunk.piece);
                }
                for ip in bad {
                    self.blame(ip, chunk.piece, &mut events);
                }
            }
            PieceStatus::Rejected { culprit } => {
                warn!("piece {} failed hash check", chunk.piece);
                events.push(DownloadEvent::PieceFailed(chunk.piece));
                if let Some(ip) = culprit {
                    self.blame(ip, chunk.piece, &mut events);
                }
                self.piece_flunked(chunk.piece, ctx, out, now);
            }
        }

        if self.endgame {
            let others: Vec<SocketId> = self
                .downloads
                .keys()
                .copied()
                .filter(|other| *other != id)
                .collect();
            for other in others {
                self.fix_endgame(other, ctx, out, now);
            }
        }

        self.request_more(id, ctx, out, false, now);
        if events
            .iter()
            .any(|e| matches!(e, DownloadEvent::PieceComplete(_)))
        {
            self.check_interests(ctx, out);
        }
        Ok(events)
    }

    fn blame(&mut self, ip: IpAddr, piece: usize, events: &mut Vec<DownloadEvent>) {
        match self.guard.failed(ip, piece) {
            Verdict::Nothing => {}
            Verdict::Kick => {
                info!("kicking {} after bad data", ip);
                events.push(DownloadEvent::Kick(ip));
            }
            Verdict::Ban => {
                warn!("banning {} after repeated bad data", ip);
                events.push(DownloadEvent::Ban(ip));
            }
        }
    }

    fn piece_flunked(
        &mut self,
        piece: usize,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) {
        ctx.picker.bump(piece);
        if self.endgame {
            if self.downloads.is_empty() {
                self.reset_endgame(ctx);
                return;
            }
            while ctx.storage.do_i_have_requests(piece) {
                let Ok((begin, length)) = ctx.storage.new_request(piece) else {
                    break;
                };
                self.endgame_requests.insert(Chunk::new(piece, begin, length));
            }
            let ids: Vec<SocketId> = self.downloads.keys().copied().collect();
            for id in ids {
                self.fix_endgame(id, ctx, out, now);
            }
            return;
        }
        let ids: Vec<SocketId> = self
            .downloads
            .iter()
            .filter(|(_, d)| !d.choked)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.request_more(id, ctx, out, false, now);
        }
    }

    /// Re-evaluates interest in every peer after our own piece set
    /// changed.
    pub fn check_interests(&mut self, ctx: &mut DownloadContext<'_>, out: &mut Outgoing) {
        for d in self.downloads.values_mut() {
            if d.interested && d.active.is_empty() {
                let interesting = d.have.iter_set().any(|p| wants(ctx.storage, p));
                if !interesting {
                    d.set_interested(false, out);
                }
            } else if !d.interested {
                let interesting = d.have.iter_set().any(|p| wants(ctx.storage, p));
                if interesting {
                    d.set_interested(true, out);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn lost_connection(
        &mut self,
        id: SocketId,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) {
        let Some(d) = self.downloads.remove(&id) else {
            return;
        };
        if d.is_seed {
            ctx.picker.lost_seed();
        } else {
            for piece in d.have.iter_set() {
                ctx.picker.lost_have(piece);
            }
        }
        if self.endgame {
            if self.downloads.is_empty() {
                self.reset_endgame(ctx);
            } else if !d.active.is_empty() {
                self.refill_endgame(id, ctx, out, now);
            }
            return;
        }
        if d.active.is_empty() {
            return;
        }
        for request in &d.active {
            let c = request.chunk;
            ctx.storage.request_lost(c.piece, c.begin, c.length);
        }
        let ids: Vec<SocketId> = self
            .downloads
            .iter()
            .filter(|(_, d)| !d.choked)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.request_more(id, ctx, out, false, now);
        }
    }

    /// Periodic check: peers that unchoked us but sent nothing for
    /// `snub_time` have their requests cancelled and are treated as choked.
    /// In streaming mode, overdue high-priority requests are moved to other
    /// peers. Returns the snubbed connections.
    pub fn check_snubs(
        &mut self,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) -> Vec<SocketId> {
        let snub_time = self.options.snub_time;
        let snubbed: Vec<SocketId> = self
            .downloads
            .values()
            .filter(|d| !d.choked && now.saturating_duration_since(d.last2) > snub_time)
            .map(|d| d.id)
            .collect();
        for &id in &snubbed {
            if let Some(d) = self.downloads.get(&id) {
                debug!("{} snubbed us; cancelling {} requests", id, d.active.len());
                for chunk in d.active_requests() {
                    d.send_cancel(chunk, out);
                }
            }
            self.got_choke(id, ctx, out, now);
        }

        if !self.endgame {
            self.expire_stream_requests(ctx, out, now);
        }
        snubbed
    }

    fn expire_stream_requests(
        &mut self,
        ctx: &mut DownloadContext<'_>,
        out: &mut Outgoing,
        now: Instant,
    ) {
        let Some(window) = stream_window(ctx.picker) else {
            return;
        };
        let mut moved = false;
        for d in self.downloads.values_mut() {
            let overdue: Vec<Chunk> = d
                .active
                .iter()
                .filter(|r| {
                    window.contains(&r.chunk.piece)
                        && now.saturating_duration_since(r.sent) > STREAM_REQUEST_TIMEOUT
                })
                .map(|r| r.chunk)
                .collect();
            if overdue.is_empty() {
                continue;
            }
            d.bad_performance += 1;
            for chunk in overdue {
                d.remove_active(&chunk);
                d.send_cancel(chunk, out);
                ctx.storage.request_lost(chunk.piece, chunk.begin, chunk.length);
                moved = true;
            }
        }
        if moved {
            self.fill_all(ctx, out, now);
        }
    }
}

/// A piece is worth asking for if we lack it and it is not blocked.
fn wants(storage: &StorageWrapper, piece: usize) -> bool {
    !storage.do_i_have(piece) && !storage.is_blocked(piece)
}

fn stream_window(picker: &PiecePicker) -> Option<HashSet<usize>> {
    let playhead = picker.playhead()?;
    let end = (playhead + picker.stream_window()).min(picker.piece_count());
    Some((playhead..end).collect())
}

/// Pieces a poorly performing peer should not be given while streaming.
fn streaming_avoid(picker: &PiecePicker, d: &SingleDownload) -> Option<HashSet<usize>> {
    if d.bad_performance < STREAM_BAD_PERFORMANCE_LIMIT {
        return None;
    }
    stream_window(picker)
}
