use crate::constants::{BACKLOG_DAMPING, BACKLOG_SOFT_CAP, SHORT_TERM_RATE_PERIOD};
use crate::peer::{Bitfield, Chunk, Message};
use crate::rate::RateMeter;
use crate::rawserver::{Outgoing, SocketId};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use super::DownloadOptions;

/// A request we sent and have not seen answered.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveRequest {
    pub(crate) chunk: Chunk,
    pub(crate) sent: Instant,
}

/// Download state for one connection.
pub struct SingleDownload {
    pub(crate) id: SocketId,
    pub(crate) ip: IpAddr,
    /// The peer is choking us.
    pub(crate) choked: bool,
    /// We told the peer we are interested.
    pub(crate) interested: bool,
    pub(crate) active: Vec<ActiveRequest>,
    pub(crate) have: Bitfield,
    /// Counted in the picker as a seed rather than piece by piece.
    pub(crate) is_seed: bool,
    measure: RateMeter,
    short_measure: RateMeter,
    /// Last chunk received.
    pub(crate) last: Instant,
    /// Last chunk received or unchoke.
    pub(crate) last2: Instant,
    pub(crate) bad_performance: u32,
}

impl SingleDownload {
    pub(crate) fn new(
        id: SocketId,
        ip: IpAddr,
        piece_count: usize,
        options: &DownloadOptions,
        now: Instant,
    ) -> Self {
        Self {
            id,
            ip,
            choked: true,
            interested: false,
            active: Vec::new(),
            have: Bitfield::new(piece_count),
            is_seed: false,
            measure: RateMeter::new_at(options.max_rate_period, options.rate_fudge, now),
            short_measure: RateMeter::new_at(SHORT_TERM_RATE_PERIOD, Duration::ZERO, now),
            last: now,
            last2: now,
            bad_performance: 0,
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

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn active_requests(&self) -> impl Iterator<Item = Chunk> + '_ {
        self.active.iter().map(|r| r.chunk)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn bad_performance(&self) -> u32 {
        self.bad_performance
    }

    pub fn rate(&mut self, now: Instant) -> f64 {
        self.measure.rate_at(now)
    }

    pub fn short_term_rate(&mut self, now: Instant) -> f64 {
        self.short_measure.rate_at(now)
    }

    pub fn total(&self) -> u64 {
        self.measure.total()
    }

    /// No data for `snub_time` while it had us unchoked.
    pub fn is_snubbed(&self, now: Instant, snub_time: Duration) -> bool {
        now.saturating_duration_since(self.last) > snub_time
    }

    pub(crate) fn received(&mut self, bytes: u64, now: Instant) {
        self.last = now;
        self.last2 = now;
        self.measure.update_at(bytes, now);
        self.short_measure.update_at(bytes, now);
    }

    /// Target number of outstanding requests.
    ///
    /// Grows with the measured rate, is capped by the rate limiter's queue
    /// allowance, and is damped once it passes the soft cap.
    pub(crate) fn backlog(
        &mut self,
        just_unchoked: bool,
        queue_limit: usize,
        chunk_size: u32,
        now: Instant,
    ) -> usize {
        let rate = self.measure.rate_at(now);
        let by_rate = 2 + (4.0 * rate / chunk_size as f64) as usize;
        let by_limit = (2 * just_unchoked as usize).saturating_add(queue_limit);
        let backlog = by_rate.min(by_limit);
        if backlog > BACKLOG_SOFT_CAP {
            BACKLOG_SOFT_CAP.max((backlog as f64 * BACKLOG_DAMPING) as usize)
        } else {
            backlog
        }
    }

    pub(crate) fn holds(&self, chunk: &Chunk) -> bool {
        self.active.iter().any(|r| r.chunk == *chunk)
    }

    pub(crate) fn remove_active(&mut self, chunk: &Chunk) -> bool {
        match self.active.iter().position(|r| r.chunk == *chunk) {
            Some(pos) => {
                self.active.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn push_request(&mut self, chunk: Chunk, now: Instant, out: &mut Outgoing) {
        self.active.push(ActiveRequest { chunk, sent: now });
        out.push((
            self.id,
            Message::Request {
                index: chunk.piece as u32,
                begin: chunk.begin,
                length: chunk.length,
            },
        ));
    }

    pub(crate) fn send_cancel(&self, chunk: Chunk, out: &mut Outgoing) {
        out.push((
            self.id,
            Message::Cancel {
                index: chunk.piece as u32,
                begin: chunk.begin,
                length: chunk.length,
            },
        ));
    }

    pub(crate) fn set_interested(&mut self, interested: bool, out: &mut Outgoing) {
        if self.interested != interested {
            self.interested = interested;
            let message = if interested {
                Message::Interested
            } else {
                Message::NotInterested
            };
            out.push((self.id, message));
        }
    }
}
