//! Piece selection.
//!
//! [`PiecePicker`] tracks how many connected peers have each piece and
//! chooses what to request next:
//!
//! 1. pieces already started are finished first;
//! 2. until `rarest_first_cutoff` pieces are held, new pieces are chosen at
//!    random so there is something to trade quickly;
//! 3. after that the rarest piece wins, ties broken by a shuffled order
//!    that is refreshed periodically.
//!
//! Streaming mode puts a window of pieces after the playhead ahead of
//! everything else. Super-seeding uses [`PiecePicker::next_have`] to decide
//! which piece to reveal to which peer.

use crate::peer::Bitfield;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::constants::SUPER_SEED_START_DELAY;

/// Offers a super-seeding peer may ignore before it is taken for a hidden
/// seed.
const SUPER_SEED_MAX_SKIPS: u32 = 3;

/// Per-call hints from the downloader.
#[derive(Debug, Default, Clone, Copy)]
pub struct PickOptions<'a> {
    /// Only continue pieces that are already started.
    pub too_many_partials: bool,
    /// Pieces to leave alone, e.g. ones a slow peer is already fetching.
    pub avoid: Option<&'a HashSet<usize>>,
    /// The returned piece will be requested; mark it started.
    pub will_request: bool,
}

/// What super-seeding should do for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperSeedAction {
    /// Nothing to announce yet.
    Wait,
    /// Send HAVE for this piece.
    Offer(usize),
    /// The peer looks like a seed in disguise; drop it.
    Close,
}

#[derive(Debug, Clone)]
struct StreamState {
    window: usize,
    playhead: Option<usize>,
}

#[derive(Debug, Default)]
struct SuperSeedState {
    started_at: Option<Instant>,
    /// HAVEs seen for each piece since it was last offered.
    got_haves: Vec<usize>,
    /// Extra weight added to a piece each time it is offered.
    offered_level: Vec<usize>,
    offered: HashMap<SocketAddr, usize>,
    past_ips: HashMap<IpAddr, usize>,
}

#[derive(Debug)]
pub struct PiecePicker {
    numhaves: Vec<usize>,
    seeds: usize,
    have: Bitfield,
    blocked: Vec<bool>,
    started: BTreeSet<usize>,
    order: Vec<usize>,
    rarest_first_cutoff: usize,
    stream: Option<StreamState>,
    super_seed: Option<SuperSeedState>,
}

impl PiecePicker {
    pub fn new(piece_count: usize, rarest_first_cutoff: usize) -> Self {
        let mut picker = Self {
            numhaves: vec![0; piece_count],
            seeds: 0,
            have: Bitfield::new(piece_count),
            blocked: vec![false; piece_count],
            started: BTreeSet::new(),
            order: (0..piece_count).collect(),
            rarest_first_cutoff,
            stream: None,
            super_seed: None,
        };
        picker.shuffle();
        picker
    }

    pub fn piece_count(&self) -> usize {
        self.numhaves.len()
    }

    /// Refreshes the random tie-break order.
    pub fn shuffle(&mut self) {
        self.order.shuffle(&mut rand::rng());
    }

    /// Enables streaming with a high-priority window of `window` pieces.
    /// Selection pauses until a playhead is known.
    pub fn set_streaming(&mut self, window: usize) {
        self.stream = (window > 0).then_some(StreamState {
            window,
            playhead: None,
        });
    }

    pub fn set_playhead(&mut self, piece: usize) {
        if let Some(stream) = &mut self.stream {
            stream.playhead = Some(piece.min(self.numhaves.len().saturating_sub(1)));
        }
    }

    pub fn playhead(&self) -> Option<usize> {
        self.stream.as_ref().and_then(|s| s.playhead)
    }

    /// Size of the high-priority window, 0 when not streaming.
    pub fn stream_window(&self) -> usize {
        self.stream.as_ref().map_or(0, |s| s.window)
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Number of connected peers (seeds included) holding `piece`.
    pub fn availability(&self, piece: usize) -> usize {
        self.numhaves.get(piece).copied().unwrap_or(0) + self.seeds
    }

    pub fn got_have(&mut self, piece: usize) {
        if let Some(n) = self.numhaves.get_mut(piece) {
            *n += 1;
        }
        if let Some(state) = &mut self.super_seed {
            if let Some(n) = state.got_haves.get_mut(piece) {
                *n += 1;
            }
        }
    }

    pub fn lost_have(&mut self, piece: usize) {
        if let Some(n) = self.numhaves.get_mut(piece) {
            *n = n.saturating_sub(1);
        }
    }

    /// A peer with every piece connected. Seeds are counted once rather
    /// than per piece.
    pub fn got_seed(&mut self) {
        self.seeds += 1;
    }

    pub fn lost_seed(&mut self) {
        self.seeds = self.seeds.saturating_sub(1);
    }

    /// A peer that had announced pieces one at a time turned out to have
    /// everything.
    pub fn became_seed(&mut self, peer_have: &Bitfield) {
        for piece in peer_have.iter_set() {
            self.lost_have(piece);
        }
        self.got_seed();
    }

    pub fn requested(&mut self, piece: usize) {
        if piece < self.piece_count() && !self.have.has(piece) {
            self.started.insert(piece);
        }
    }

    /// The piece verified.
    pub fn complete(&mut self, piece: usize) {
        self.have.set(piece);
        self.started.remove(&piece);
    }

    /// The piece was lost again (hash failure on read, live invalidation).
    pub fn invalidate(&mut self, piece: usize) {
        self.have.clear(piece);
        self.started.remove(&piece);
    }

    /// Demotes a piece in the tie-break order after it failed its hash.
    pub fn bump(&mut self, piece: usize) {
        if let Some(pos) = self.order.iter().position(|&p| p == piece) {
            self.order.remove(pos);
            self.order.push(piece);
        }
        self.started.remove(&piece);
    }

    pub fn set_blocked(&mut self, piece: usize, blocked: bool) {
        if let Some(flag) = self.blocked.get_mut(piece) {
            *flag = blocked;
        }
    }

    pub fn is_blocked(&self, piece: usize) -> bool {
        self.blocked.get(piece).copied().unwrap_or(false)
    }

    pub fn started(&self) -> impl Iterator<Item = usize> + '_ {
        self.started.iter().copied()
    }

    pub fn have_count(&self) -> usize {
        self.have.count()
    }

    /// Chooses the next piece to request from a peer holding `peer_have`.
    ///
    /// `wanted` reports whether the piece still has chunks to hand out.
    pub fn next(
        &mut self,
        peer_have: &Bitfield,
        wanted: impl Fn(usize) -> bool,
        opts: PickOptions<'_>,
    ) -> Option<usize> {
        let candidate = |piece: usize| {
            !self.have.has(piece)
                && !self.is_blocked(piece)
                && peer_have.has(piece)
                && opts.avoid.is_none_or(|avoid| !avoid.contains(&piece))
                && wanted(piece)
        };

        let picked = self.pick_streaming(&candidate).or_else(|| {
            if let Some(piece) = self.rarest(self.started.iter().copied(), &candidate) {
                return Some(piece);
            }
            if opts.too_many_partials || self.stream.as_ref().is_some_and(|s| s.playhead.is_none())
            {
                return None;
            }
            if self.have.count() < self.rarest_first_cutoff {
                self.order.iter().copied().find(|&p| candidate(p))
            } else {
                self.rarest(self.order.iter().copied(), &candidate)
            }
        });

        if let (Some(piece), true) = (picked, opts.will_request) {
            self.started.insert(piece);
        }
        picked
    }

    fn pick_streaming(&self, candidate: &impl Fn(usize) -> bool) -> Option<usize> {
        let stream = self.stream.as_ref()?;
        let playhead = stream.playhead?;
        let end = (playhead + stream.window).min(self.piece_count());
        (playhead..end).find(|&p| candidate(p))
    }

    /// Least available candidate; the first in iteration order wins ties.
    fn rarest(
        &self,
        pieces: impl Iterator<Item = usize>,
        candidate: &impl Fn(usize) -> bool,
    ) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for piece in pieces.filter(|&p| candidate(p)) {
            let count = self.numhaves[piece];
            if best.is_none_or(|(_, n)| count < n) {
                best = Some((piece, count));
            }
        }
        best.map(|(piece, _)| piece)
    }

    /// Hooks a streaming download in at the lowest piece any peer has.
    /// Returns the chosen playhead.
    pub fn hook_in(&mut self) -> Option<usize> {
        let stream = self.stream.as_ref()?;
        if let Some(playhead) = stream.playhead {
            return Some(playhead);
        }
        let first = (0..self.piece_count()).find(|&p| self.availability(p) > 0)?;
        self.set_playhead(first);
        Some(first)
    }

    // ------------------------------------------------------------------
    // Super-seeding
    // ------------------------------------------------------------------

    pub fn set_super_seed(&mut self) {
        let count = self.piece_count();
        self.super_seed = Some(SuperSeedState {
            got_haves: vec![0; count],
            offered_level: vec![0; count],
            ..SuperSeedState::default()
        });
    }

    pub fn is_super_seeding(&self) -> bool {
        self.super_seed.is_some()
    }

    /// Decides whether to reveal a new piece to `peer`.
    ///
    /// A peer gets its next piece only once the previous one has been seen
    /// elsewhere in the swarm (`looser_upload` relaxes that to one
    /// sighting). A peer that is offered pieces but never becomes
    /// interested is closed after a few tries.
    pub fn next_have(
        &mut self,
        peer: SocketAddr,
        peer_have: &Bitfield,
        ever_interested: bool,
        skipped: &mut u32,
        looser_upload: bool,
        now: Instant,
    ) -> SuperSeedAction {
        let numhaves = &self.numhaves;
        let Some(state) = &mut self.super_seed else {
            return SuperSeedAction::Wait;
        };
        let Some(started_at) = state.started_at else {
            state.started_at = Some(now);
            return SuperSeedAction::Wait;
        };
        if now.saturating_duration_since(started_at) < SUPER_SEED_START_DELAY {
            return SuperSeedAction::Wait;
        }

        let mut previous = state.offered.get(&peer).copied();
        if previous.is_none() {
            if let Some(&piece) = state.past_ips.get(&peer.ip()) {
                state.offered.insert(peer, piece);
                if !looser_upload {
                    state.got_haves[piece] = state.got_haves[piece].saturating_sub(1);
                }
                previous = Some(piece);
            }
        }
        if let Some(piece) = previous {
            let needed = if looser_upload { 1 } else { 2 };
            if state.got_haves[piece] < needed {
                return SuperSeedAction::Wait;
            }
            if !ever_interested {
                *skipped += 1;
                if *skipped >= SUPER_SEED_MAX_SKIPS {
                    return SuperSeedAction::Close;
                }
            }
        }

        let choice = (0..numhaves.len())
            .filter(|&p| !peer_have.has(p))
            .min_by_key(|&p| (numhaves[p] + state.offered_level[p], p));
        match choice {
            Some(piece) => {
                state.offered_level[piece] += 1;
                state.got_haves[piece] = 0;
                state.offered.insert(peer, piece);
                SuperSeedAction::Offer(piece)
            }
            None => SuperSeedAction::Close,
        }
    }

    /// Remembers what a departing peer was last offered, so a reconnect
    /// from the same IP does not earn a fresh piece.
    pub fn super_seed_lost_peer(&mut self, peer: SocketAddr) {
        if let Some(state) = &mut self.super_seed {
            if let Some(piece) = state.offered.remove(&peer) {
                state.past_ips.insert(peer.ip(), piece);
            }
        }
    }

    /// Time until super-seeding starts revealing pieces.
    pub fn super_seed_delay(&self, now: Instant) -> Option<Duration> {
        let started_at = self.super_seed.as_ref()?.started_at?;
        Some(SUPER_SEED_START_DELAY.saturating_sub(now.saturating_duration_since(started_at)))
    }
}
