use super::backend::{hash_bytes, StorageBackend};
use super::error::StorageError;
use super::placement::PlacementMap;
use super::snapshot::Snapshot;
use super::write_buffer::{WriteBuffer, WriteRegion};
use crate::config::{AllocType, Config};
use crate::peer::{slice_piece, Bitfield};
use bytes::{Bytes, BytesMut};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::ops::Range;
use tracing::{debug, info, warn};

/// Storage options taken from [`Config`].
#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub alloc_type: AllocType,
    pub write_buffer_bytes: usize,
    pub request_size: u32,
    pub double_check: bool,
    pub triple_check: bool,
    pub check_hashes: bool,
}

impl From<&Config> for StorageOptions {
    fn from(config: &Config) -> Self {
        Self {
            alloc_type: config.alloc_type,
            write_buffer_bytes: config.write_buffer_bytes(),
            request_size: config.download_slice_size,
            double_check: config.double_check,
            triple_check: config.triple_check,
            check_hashes: config.check_hashes,
        }
    }
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Outcome of delivering a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceStatus {
    /// More chunks are outstanding.
    Incomplete,
    /// The piece verified. `good` lists every contributing source, `bad`
    /// those whose earlier bytes differed after a failed attempt.
    Complete { good: Vec<IpAddr>, bad: Vec<IpAddr> },
    /// The piece failed its hash and was reset. `culprit` is set when a
    /// single source supplied every chunk.
    Rejected { culprit: Option<IpAddr> },
    /// The piece was already verified; the data was dropped.
    Ignored,
}

/// Piece-level view of a torrent's storage.
///
/// Slices pieces into requests, maps pieces to physical slots, buffers
/// writes, verifies hashes and keeps the resume state. Byte counters obey
///
/// ```text
/// inactive + active + received + verified == desired
/// ```
///
/// where `received` is unverified data already written and blocked pieces
/// are excluded from every term.
pub struct StorageWrapper {
    backend: StorageBackend,
    options: StorageOptions,
    hashes: Vec<[u8; 20]>,
    piece_length: u64,
    total_length: u64,

    placement: PlacementMap,
    have: Bitfield,
    blocked: Vec<bool>,
    /// `None` until the piece is first requested from.
    inactive: Vec<Option<Vec<(u32, u32)>>>,
    numactive: Vec<usize>,
    /// Received but unverified ranges, sorted by offset.
    dirty: HashMap<usize, Vec<(u32, u32)>>,
    write_buffer: WriteBuffer,

    download_history: HashMap<usize, HashMap<u32, Option<IpAddr>>>,
    failed_pieces: HashMap<usize, HashSet<IpAddr>>,
    double_checked: Vec<bool>,
    cloaked: Option<(Bitfield, Vec<usize>)>,

    amount_desired: u64,
    amount_inactive: u64,
    amount_active: u64,
    amount_received: u64,
    amount_verified: u64,
    num_flunked: usize,
}

impl StorageWrapper {
    /// Opens storage over `backend`.
    ///
    /// With a snapshot whose piece count matches, verified pieces and
    /// partial ranges are restored from it (re-hashing the verified ones if
    /// `check_hashes` is set). Otherwise every slot that already exists on
    /// disk is hashed, and matching data is adopted wherever it lies.
    /// `progress` receives the fraction of the check completed.
    pub async fn open(
        mut backend: StorageBackend,
        hashes: Vec<[u8; 20]>,
        piece_length: u64,
        options: StorageOptions,
        snapshot: Option<Snapshot>,
        mut progress: impl FnMut(f64),
    ) -> Result<Self, StorageError> {
        let count = hashes.len();
        let total_length = backend.total_length();

        let mut placement = PlacementMap::new(count);
        for slot in 0..count {
            let offset = slot as u64 * piece_length;
            let size = total_length.saturating_sub(offset).min(piece_length);
            if backend.was_preallocated(offset, size) {
                placement.mark_allocated(slot);
            }
        }
        if options.alloc_type == AllocType::PreAllocate {
            backend.preallocate().await?;
        }

        let mut wrapper = Self {
            backend,
            write_buffer: WriteBuffer::new(options.write_buffer_bytes),
            options,
            hashes,
            piece_length,
            total_length,
            placement,
            have: Bitfield::new(count),
            blocked: vec![false; count],
            inactive: vec![None; count],
            numactive: vec![0; count],
            dirty: HashMap::new(),
            download_history: HashMap::new(),
            failed_pieces: HashMap::new(),
            double_checked: vec![false; count],
            cloaked: None,
            amount_desired: total_length,
            amount_inactive: total_length,
            amount_active: 0,
            amount_received: 0,
            amount_verified: 0,
            num_flunked: 0,
        };

        match snapshot {
            Some(snapshot) if snapshot.have.len() == count => {
                wrapper.restore(snapshot).await?;
                progress(1.0);
            }
            Some(_) => {
                warn!("resume snapshot has wrong piece count, rechecking");
                wrapper.check_existing(&mut progress).await?;
            }
            None => wrapper.check_existing(&mut progress).await?,
        }

        info!(
            have = wrapper.have.count(),
            pieces = count,
            out_of_place = wrapper.placement.out_of_place(),
            "storage opened"
        );
        Ok(wrapper)
    }

    // ------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_size(&self, piece: usize) -> u64 {
        let start = piece as u64 * self.piece_length;
        self.total_length.saturating_sub(start).min(self.piece_length)
    }

    fn slot_offset(&self, slot: usize) -> u64 {
        slot as u64 * self.piece_length
    }

    fn check_piece(&self, piece: usize) -> Result<(), StorageError> {
        if piece >= self.piece_count() {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        Ok(())
    }

    fn check_range(&self, piece: usize, begin: u32, length: u64) -> Result<(), StorageError> {
        self.check_piece(piece)?;
        if begin as u64 + length > self.piece_size(piece) {
            return Err(StorageError::InvalidBlockOffset {
                piece,
                offset: begin,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Predicates and counters
    // ------------------------------------------------------------------

    pub fn do_i_have(&self, piece: usize) -> bool {
        self.have.has(piece)
    }

    /// True if the piece still has chunks nobody has been asked for.
    pub fn do_i_have_requests(&self, piece: usize) -> bool {
        if piece >= self.piece_count() || self.have.has(piece) || self.blocked[piece] {
            return false;
        }
        match &self.inactive[piece] {
            None => true,
            Some(list) => !list.is_empty(),
        }
    }

    /// True if nothing of the piece has been requested or received.
    pub fn is_unstarted(&self, piece: usize) -> bool {
        piece < self.piece_count()
            && !self.have.has(piece)
            && self.inactive[piece].is_none()
            && self.numactive[piece] == 0
            && !self.dirty.contains_key(&piece)
    }

    pub fn is_blocked(&self, piece: usize) -> bool {
        self.blocked.get(piece).copied().unwrap_or(false)
    }

    /// Pieces with received but unverified data.
    pub fn partial_pieces(&self) -> Vec<usize> {
        let mut pieces: Vec<usize> = self.dirty.keys().copied().collect();
        pieces.sort_unstable();
        pieces
    }

    pub fn have_list(&self) -> &Bitfield {
        &self.have
    }

    /// The have bitfield with a few held pieces masked, plus the masked
    /// pieces so the caller can announce them with HAVE afterwards.
    ///
    /// The choice is made once and reused for the rest of the session.
    pub fn have_list_cloaked(&mut self) -> (Bitfield, Vec<usize>) {
        if let Some(cloaked) = &self.cloaked {
            return cloaked.clone();
        }

        let mut rng = rand::rng();
        let mut candidates: Vec<usize> = self
            .have
            .iter_set()
            .take_while(|&p| p < 32)
            .collect();
        candidates.shuffle(&mut rng);
        let wanted = rng.random_range(2..=4usize).min(candidates.len());
        candidates.truncate(wanted);
        candidates.sort_unstable();

        let mut masked = self.have.clone();
        for &piece in &candidates {
            masked.clear(piece);
        }
        self.cloaked = Some((masked.clone(), candidates.clone()));
        (masked, candidates)
    }

    /// Every desired piece is verified.
    pub fn is_complete(&self) -> bool {
        self.amount_verified == self.amount_desired
    }

    /// Desired bytes not yet received.
    pub fn amount_left(&self) -> u64 {
        self.amount_desired - self.amount_verified - self.amount_received
    }

    pub fn amount_inactive(&self) -> u64 {
        self.amount_inactive
    }

    pub fn amount_active(&self) -> u64 {
        self.amount_active
    }

    pub fn amount_received(&self) -> u64 {
        self.amount_received
    }

    pub fn amount_verified(&self) -> u64 {
        self.amount_verified
    }

    pub fn amount_desired(&self) -> u64 {
        self.amount_desired
    }

    pub fn num_flunked(&self) -> usize {
        self.num_flunked
    }

    pub fn out_of_place(&self) -> usize {
        self.placement.out_of_place()
    }

    pub fn slot_of(&self, piece: usize) -> Option<usize> {
        self.placement.slot_of(piece)
    }

    /// Remaining inactive chunks of a piece, or `None` if it was never
    /// sliced.
    pub fn inactive_requests(&self, piece: usize) -> Option<&[(u32, u32)]> {
        self.inactive.get(piece)?.as_deref()
    }

    fn inactive_bytes(&self, piece: usize) -> u64 {
        match &self.inactive[piece] {
            None => self.piece_size(piece),
            Some(list) => list.iter().map(|&(_, l)| l as u64).sum(),
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Pops the next inactive chunk of `piece`.
    pub fn new_request(&mut self, piece: usize) -> Result<(u32, u32), StorageError> {
        self.check_piece(piece)?;
        if self.have.has(piece) || self.blocked[piece] {
            return Err(StorageError::NoRequest(piece));
        }

        let size = self.piece_size(piece);
        let request_size = self.options.request_size;
        let list = self.inactive[piece].get_or_insert_with(|| slice_piece(size, request_size));
        if list.is_empty() {
            return Err(StorageError::NoRequest(piece));
        }

        let (begin, length) = list.remove(0);
        self.numactive[piece] += 1;
        self.amount_inactive -= length as u64;
        self.amount_active += length as u64;
        Ok((begin, length))
    }

    /// Returns an outstanding chunk to the inactive list.
    pub fn request_lost(&mut self, piece: usize, begin: u32, length: u32) {
        if piece >= self.piece_count() || self.have.has(piece) || self.numactive[piece] == 0 {
            return;
        }
        let list = self.inactive[piece].get_or_insert_with(Vec::new);
        match list.binary_search(&(begin, length)) {
            Ok(_) => return,
            Err(pos) => list.insert(pos, (begin, length)),
        }
        self.numactive[piece] -= 1;
        self.amount_active -= length as u64;
        self.amount_inactive += length as u64;
    }

    /// Excludes a piece from (or returns it to) the set this session wants.
    ///
    /// Only pieces that are verified or untouched can change state; returns
    /// false otherwise.
    pub fn set_blocked(&mut self, piece: usize, blocked: bool) -> bool {
        if piece >= self.piece_count() {
            return false;
        }
        if self.blocked[piece] == blocked {
            return true;
        }
        let held = self.have.has(piece);
        if !held && !self.is_unstarted(piece) {
            return false;
        }

        let size = self.piece_size(piece);
        self.blocked[piece] = blocked;
        if blocked {
            self.amount_desired -= size;
            if held {
                self.amount_verified -= size;
            } else {
                self.amount_inactive -= size;
            }
        } else {
            self.amount_desired += size;
            if held {
                self.amount_verified += size;
            } else {
                self.amount_inactive += size;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Data in
    // ------------------------------------------------------------------

    /// Stores a received chunk and verifies the piece once every chunk is
    /// in.
    ///
    /// After a multi-source failure the previous bytes of each chunk are
    /// compared with the new ones, and the sources whose bytes changed are
    /// reported as `bad` when the piece finally verifies.
    pub async fn piece_came_in(
        &mut self,
        piece: usize,
        begin: u32,
        data: Bytes,
        source: Option<IpAddr>,
    ) -> Result<PieceStatus, StorageError> {
        self.check_range(piece, begin, data.len() as u64)?;
        if self.have.has(piece) {
            return Ok(PieceStatus::Ignored);
        }

        let slot = self.claim_slot(piece).await?;
        let length = data.len() as u32;

        if self.failed_pieces.contains_key(&piece) {
            self.flush_piece(piece).await?;
            let old = self
                .backend
                .read_padded(self.slot_offset(slot) + begin as u64, data.len())
                .await?;
            if old != data {
                let previous = self
                    .download_history
                    .get(&piece)
                    .and_then(|h| h.get(&begin))
                    .copied()
                    .flatten();
                if let (Some(ip), Some(failed)) = (previous, self.failed_pieces.get_mut(&piece)) {
                    failed.insert(ip);
                }
            }
        }
        self.download_history
            .entry(piece)
            .or_default()
            .insert(begin, source);

        self.write_chunk(piece, slot, begin, data).await?;

        let ranges = self.dirty.entry(piece).or_default();
        if let Err(pos) = ranges.binary_search(&(begin, length)) {
            ranges.insert(pos, (begin, length));
            self.amount_received += length as u64;
        }
        if self.numactive[piece] > 0 {
            self.numactive[piece] -= 1;
            self.amount_active = self.amount_active.saturating_sub(length as u64);
        }

        let finished = self.numactive[piece] == 0
            && self.inactive[piece].as_ref().is_some_and(|l| l.is_empty());
        if !finished {
            return Ok(PieceStatus::Incomplete);
        }

        let data = self.piece_bytes(piece, self.options.triple_check).await?;
        let received = self.take_dirty(piece);
        if hash_bytes(data).await? == self.hashes[piece] {
            self.mark_have(piece);
            self.double_checked[piece] = self.options.triple_check;
            self.amount_received -= received;

            let mut good: Vec<IpAddr> = self
                .download_history
                .remove(&piece)
                .into_iter()
                .flat_map(|h| h.into_values().flatten())
                .collect();
            good.sort_unstable();
            good.dedup();
            let mut bad: Vec<IpAddr> = self
                .failed_pieces
                .remove(&piece)
                .into_iter()
                .flatten()
                .collect();
            bad.sort_unstable();

            self.move_home(piece).await?;
            debug!(piece, "piece verified");
            Ok(PieceStatus::Complete { good, bad })
        } else {
            self.amount_received -= received;
            self.amount_inactive += self.piece_size(piece);
            self.inactive[piece] = None;
            self.num_flunked += 1;
            self.flush_piece(piece).await?;

            let senders: HashSet<Option<IpAddr>> = self
                .download_history
                .get(&piece)
                .map(|h| h.values().copied().collect())
                .unwrap_or_default();
            let culprit = if senders.len() == 1 {
                self.failed_pieces.remove(&piece);
                senders.into_iter().next().flatten()
            } else {
                self.failed_pieces.insert(piece, HashSet::new());
                None
            };

            warn!(piece, culprit = ?culprit, "piece failed hash check");
            Ok(PieceStatus::Rejected { culprit })
        }
    }

    fn take_dirty(&mut self, piece: usize) -> u64 {
        self.dirty
            .remove(&piece)
            .map(|ranges| ranges.iter().map(|&(_, l)| l as u64).sum())
            .unwrap_or(0)
    }

    fn mark_have(&mut self, piece: usize) {
        self.have.set(piece);
        self.inactive[piece] = Some(Vec::new());
        if !self.blocked[piece] {
            self.amount_verified += self.piece_size(piece);
        }
        self.cloaked = None;
    }

    async fn write_chunk(
        &mut self,
        piece: usize,
        slot: usize,
        begin: u32,
        data: Bytes,
    ) -> Result<(), StorageError> {
        if !self.write_buffer.is_enabled() {
            let offset = self.slot_offset(slot) + begin as u64;
            return self.backend.write(offset, &data).await;
        }

        self.write_buffer.insert(piece, begin, data);
        while self.write_buffer.is_over_quota() {
            let Some((oldest, regions)) = self.write_buffer.pop_oldest() else {
                break;
            };
            self.write_regions(oldest, regions).await?;
        }
        Ok(())
    }

    async fn write_regions(
        &mut self,
        piece: usize,
        regions: Vec<WriteRegion>,
    ) -> Result<(), StorageError> {
        if regions.is_empty() {
            return Ok(());
        }
        let slot = self
            .placement
            .slot_of(piece)
            .ok_or(StorageError::InvalidPieceIndex(piece))?;
        let base = self.slot_offset(slot);
        for region in regions {
            self.backend
                .write(base + region.begin as u64, &region.data)
                .await?;
        }
        Ok(())
    }

    async fn flush_piece(&mut self, piece: usize) -> Result<(), StorageError> {
        let regions = self.write_buffer.take(piece);
        self.write_regions(piece, regions).await
    }

    /// The whole piece as currently stored. Unless `disk_only`, buffered
    /// chunks are overlaid on the disk contents instead of being flushed.
    async fn piece_bytes(&mut self, piece: usize, disk_only: bool) -> Result<Bytes, StorageError> {
        let slot = self
            .placement
            .slot_of(piece)
            .ok_or(StorageError::NotHeld(piece))?;
        let offset = self.slot_offset(slot);
        let size = self.piece_size(piece) as usize;

        if disk_only {
            self.flush_piece(piece).await?;
            return self.backend.read(offset, size).await;
        }

        let mut data = BytesMut::from(&self.backend.read_padded(offset, size).await?[..]);
        self.write_buffer.overlay(piece, &mut data);
        Ok(data.freeze())
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Finds the slot a piece is written to, choosing one on first use.
    ///
    /// Without holes every piece lives at its natural slot. With holes the
    /// lowest free slot is used so files grow front to back; if the piece
    /// that belongs in that slot is stored elsewhere it is moved home
    /// first and its old slot is reused.
    async fn claim_slot(&mut self, piece: usize) -> Result<usize, StorageError> {
        if let Some(slot) = self.placement.slot_of(piece) {
            return Ok(slot);
        }

        if !self.options.alloc_type.uses_holes() {
            if !self.placement.place(piece, piece) {
                return Err(StorageError::InvalidPieceIndex(piece));
            }
            return Ok(piece);
        }

        let hole = self
            .placement
            .lowest_hole_for(piece)
            .ok_or(StorageError::InvalidPieceIndex(piece))?;

        let slot = if hole == piece {
            hole
        } else if self.placement.slot_of(hole).is_some() {
            let old = self.move_piece(hole, hole).await?;
            debug!(moved = hole, from = old, "cleared space");
            old
        } else {
            hole
        };

        if !self.placement.place(piece, slot) {
            return Err(StorageError::InvalidPieceIndex(piece));
        }
        Ok(slot)
    }

    /// Copies `piece` into the free slot `to`. Returns the slot it left.
    async fn move_piece(&mut self, piece: usize, to: usize) -> Result<usize, StorageError> {
        let from = self
            .placement
            .slot_of(piece)
            .ok_or(StorageError::InvalidPieceIndex(piece))?;
        self.flush_piece(piece).await?;
        let data = self
            .backend
            .read_padded(self.slot_offset(from), self.piece_size(piece) as usize)
            .await?;
        self.backend.write(self.slot_offset(to), &data).await?;
        self.placement.unplace(piece);
        self.placement.place(piece, to);
        Ok(from)
    }

    /// Moves a verified out-of-place piece to its natural slot if that slot
    /// is free and already exists on disk.
    async fn move_home(&mut self, piece: usize) -> Result<(), StorageError> {
        if !self.options.alloc_type.uses_holes() {
            return Ok(());
        }
        match self.placement.slot_of(piece) {
            Some(slot)
                if slot != piece
                    && self.placement.is_hole(piece)
                    && self.placement.is_allocated(piece) =>
            {
                self.move_piece(piece, piece).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Zero-fills never-written holes, about `budget` bytes per call.
    /// Returns true while work remains.
    pub async fn allocate_step(&mut self, budget: u64) -> Result<bool, StorageError> {
        if self.options.alloc_type != AllocType::Background {
            return Ok(false);
        }
        let mut spent = 0u64;
        while spent < budget.max(1) {
            let Some(slot) = self.placement.next_unallocated_hole() else {
                return Ok(false);
            };
            let size = self.piece_size(slot);
            self.backend.write_zeros(self.slot_offset(slot), size).await?;
            self.placement.mark_allocated(slot);
            spent += size;
        }
        Ok(self.placement.next_unallocated_hole().is_some())
    }

    // ------------------------------------------------------------------
    // Data out
    // ------------------------------------------------------------------

    /// Reads part of a verified piece.
    ///
    /// With `double_check` each piece is re-hashed the first time it is
    /// read this session; with `triple_check` on every read. A piece that
    /// no longer matches is dropped from the have set.
    pub async fn get_piece(
        &mut self,
        piece: usize,
        begin: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        self.check_range(piece, begin, length as u64)?;
        if !self.have.has(piece) {
            return Err(StorageError::NotHeld(piece));
        }
        self.flush_piece(piece).await?;

        let slot = self
            .placement
            .slot_of(piece)
            .ok_or(StorageError::NotHeld(piece))?;
        let offset = self.slot_offset(slot);

        if self.options.triple_check || (self.options.double_check && !self.double_checked[piece])
        {
            let data = self
                .backend
                .read(offset, self.piece_size(piece) as usize)
                .await?;
            if hash_bytes(data.clone()).await? != self.hashes[piece] {
                warn!(piece, "stored piece no longer matches its hash");
                self.reset_piece(piece);
                return Err(StorageError::HashMismatch(piece));
            }
            self.double_checked[piece] = true;
            let start = begin as usize;
            return Ok(data.slice(start..start + length as usize));
        }

        self.backend
            .read(offset + begin as u64, length as usize)
            .await
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Forgets a piece entirely so it is downloaded again.
    ///
    /// Outstanding requests for the piece should be returned with
    /// [`request_lost`](Self::request_lost) first. Returns true if the
    /// piece had been verified.
    pub fn live_invalidate(&mut self, piece: usize) -> bool {
        if piece >= self.piece_count() {
            return false;
        }
        self.reset_piece(piece)
    }

    /// Invalidates every piece in each of `ranges`.
    pub fn live_invalidate_ranges(&mut self, ranges: &[Range<usize>]) -> Vec<usize> {
        let mut dropped = Vec::new();
        for range in ranges {
            for piece in range.clone() {
                if self.live_invalidate(piece) {
                    dropped.push(piece);
                }
            }
        }
        dropped
    }

    fn reset_piece(&mut self, piece: usize) -> bool {
        let size = self.piece_size(piece);
        let was_held = self.have.clear(piece);
        let blocked = self.blocked[piece];

        if was_held && !blocked {
            self.amount_verified -= size;
        }
        let received = self.take_dirty(piece);
        if !blocked {
            self.amount_received -= received;
            self.amount_inactive -= self.inactive_bytes(piece);
            self.amount_inactive += size;
        }
        self.inactive[piece] = None;
        if self.numactive[piece] > 0 {
            debug!(piece, active = self.numactive[piece], "invalidated piece with requests out");
        }

        self.write_buffer.discard(piece);
        self.placement.unplace(piece);
        self.download_history.remove(&piece);
        self.failed_pieces.remove(&piece);
        self.double_checked[piece] = false;
        if was_held {
            self.cloaked = None;
        }
        was_held
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Writes every buffered chunk and syncs the files.
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        while let Some((piece, regions)) = self.write_buffer.pop_oldest() {
            self.write_regions(piece, regions).await?;
        }
        self.backend.flush().await
    }

    pub async fn close(&mut self) -> Result<(), StorageError> {
        self.flush().await?;
        self.backend.close().await
    }

    /// Captures the resume state.
    ///
    /// Chunks still sitting in the write buffer are left out, so call
    /// [`flush`](Self::flush) first to keep them.
    pub fn pickle(&self) -> Snapshot {
        let mut snapshot = Snapshot::new(self.piece_count());
        snapshot.have = self.have.clone();

        let mut partials = Vec::new();
        for piece in self.partial_pieces() {
            let ranges: Vec<(u32, u32)> = self.dirty[&piece]
                .iter()
                .copied()
                .filter(|&(begin, _)| !self.write_buffer.contains(piece, begin))
                .collect();
            if !ranges.is_empty() {
                partials.push((piece, ranges));
            }
        }

        let persisted: HashSet<usize> = partials.iter().map(|(p, _)| *p).collect();
        snapshot.places = self
            .placement
            .nontrivial()
            .filter(|(piece, _)| self.have.has(*piece) || persisted.contains(piece))
            .collect();
        snapshot.partials = partials;
        snapshot
    }

    /// Applies a snapshot to freshly opened storage. Entries that do not
    /// fit the torrent or the files on disk are dropped.
    async fn restore(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        let count = self.piece_count();
        let last = count.saturating_sub(1);
        let holes = self.options.alloc_type.uses_holes();

        let mut places = HashMap::new();
        for (piece, slot) in snapshot.places {
            let valid = holes
                && piece < count
                && slot < count
                && (piece == last) == (slot == last)
                && self.placement.is_allocated(slot);
            if valid {
                places.insert(piece, slot);
            }
        }

        let mut dropped = 0usize;
        for piece in snapshot.have.iter_set() {
            let slot = places.get(&piece).copied().unwrap_or(piece);
            if !self.placement.is_allocated(slot) || !self.placement.place(piece, slot) {
                dropped += 1;
                continue;
            }
            if self.options.check_hashes {
                let data = self
                    .backend
                    .read(self.slot_offset(slot), self.piece_size(piece) as usize)
                    .await?;
                if hash_bytes(data).await? != self.hashes[piece] {
                    self.placement.unplace(piece);
                    dropped += 1;
                    continue;
                }
            }
            self.amount_inactive -= self.piece_size(piece);
            self.mark_have(piece);
            self.double_checked[piece] = self.options.check_hashes;
        }

        for (piece, ranges) in snapshot.partials {
            if piece >= count || self.have.has(piece) || self.dirty.contains_key(&piece) {
                continue;
            }
            let slot = places.get(&piece).copied().unwrap_or(piece);
            let base = self.slot_offset(slot);
            let mut inactive = slice_piece(self.piece_size(piece), self.options.request_size);
            let mut received = Vec::new();
            for range in ranges {
                let on_disk = self.backend.was_preallocated(base + range.0 as u64, range.1 as u64);
                if let (true, Ok(pos)) = (on_disk, inactive.binary_search(&range)) {
                    inactive.remove(pos);
                    received.push(range);
                }
            }
            if received.is_empty() || !self.placement.place(piece, slot) {
                continue;
            }
            let bytes: u64 = received.iter().map(|&(_, l)| l as u64).sum();
            self.amount_inactive -= bytes;
            self.amount_received += bytes;
            self.inactive[piece] = Some(inactive);
            self.dirty.insert(piece, received);
        }

        if dropped > 0 {
            warn!(dropped, "resume snapshot entries did not check out");
        }
        Ok(())
    }

    /// Hashes every slot that already exists on disk.
    async fn check_existing(&mut self, progress: &mut impl FnMut(f64)) -> Result<(), StorageError> {
        let count = self.piece_count();
        if count == 0 {
            progress(1.0);
            return Ok(());
        }

        let mut digests: Vec<Option<[u8; 20]>> = vec![None; count];
        for (slot, digest) in digests.iter_mut().enumerate() {
            if self.placement.is_allocated(slot) {
                let data = self
                    .backend
                    .read(self.slot_offset(slot), self.piece_size(slot) as usize)
                    .await?;
                *digest = Some(hash_bytes(data).await?);
            }
            progress((slot + 1) as f64 / count as f64);
        }

        for slot in 0..count {
            if digests[slot] == Some(self.hashes[slot]) && self.placement.place(slot, slot) {
                self.amount_inactive -= self.piece_size(slot);
                self.mark_have(slot);
                self.double_checked[slot] = true;
            }
        }

        if self.options.alloc_type.uses_holes() {
            let last = count - 1;
            let mut by_hash: HashMap<[u8; 20], Vec<usize>> = HashMap::new();
            for (piece, hash) in self.hashes.iter().enumerate() {
                by_hash.entry(*hash).or_default().push(piece);
            }
            for slot in 0..count {
                let Some(digest) = digests[slot] else {
                    continue;
                };
                if self.placement.piece_at(slot).is_some() {
                    continue;
                }
                let adopt = by_hash.get(&digest).and_then(|pieces| {
                    pieces
                        .iter()
                        .copied()
                        .find(|&p| !self.have.has(p) && (p == last) == (slot == last))
                });
                if let Some(piece) = adopt {
                    if self.placement.place(piece, slot) {
                        debug!(piece, slot, "adopted out-of-place piece");
                        self.amount_inactive -= self.piece_size(piece);
                        self.mark_have(piece);
                        self.double_checked[piece] = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Byte offset where `piece` is stored, for tests that corrupt data.
    #[cfg(test)]
    pub(crate) fn stored_offset(&self, piece: usize) -> Option<u64> {
        Some(self.slot_offset(self.placement.slot_of(piece)?))
    }
}
