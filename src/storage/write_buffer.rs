use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// A contiguous run of buffered bytes inside one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRegion {
    pub begin: u32,
    pub data: Bytes,
}

/// Chunks waiting to be written, grouped per piece.
///
/// Pieces are kept in least-recently-written order; when the buffer goes
/// over quota the caller drains the oldest piece with
/// [`WriteBuffer::pop_oldest`] and writes its regions in one pass.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    max_bytes: usize,
    size: usize,
    pieces: HashMap<usize, BTreeMap<u32, Bytes>>,
    order: VecDeque<usize>,
}

impl WriteBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    /// A zero quota means every chunk is written straight through.
    pub fn is_enabled(&self) -> bool {
        self.max_bytes > 0
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_over_quota(&self) -> bool {
        self.size > self.max_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn contains_piece(&self, piece: usize) -> bool {
        self.pieces.contains_key(&piece)
    }

    pub fn contains(&self, piece: usize, begin: u32) -> bool {
        self.pieces
            .get(&piece)
            .is_some_and(|chunks| chunks.contains_key(&begin))
    }

    /// Buffers a chunk and marks its piece as most recently written.
    pub fn insert(&mut self, piece: usize, begin: u32, data: Bytes) {
        let chunks = self.pieces.entry(piece).or_default();
        self.size += data.len();
        if let Some(old) = chunks.insert(begin, data) {
            self.size -= old.len();
        }
        self.touch(piece);
    }

    fn touch(&mut self, piece: usize) {
        if let Some(pos) = self.order.iter().position(|&p| p == piece) {
            self.order.remove(pos);
        }
        self.order.push_back(piece);
    }

    /// Copies any buffered bytes of `piece` over `dest`, which holds the
    /// piece's on-disk contents starting at offset 0.
    pub fn overlay(&self, piece: usize, dest: &mut [u8]) {
        let Some(chunks) = self.pieces.get(&piece) else {
            return;
        };
        for (&begin, data) in chunks {
            let start = begin as usize;
            let end = (start + data.len()).min(dest.len());
            if start < end {
                dest[start..end].copy_from_slice(&data[..end - start]);
            }
        }
    }

    /// Removes the buffered chunks of `piece`, coalesced by offset.
    pub fn take(&mut self, piece: usize) -> Vec<WriteRegion> {
        let Some(chunks) = self.pieces.remove(&piece) else {
            return Vec::new();
        };
        if let Some(pos) = self.order.iter().position(|&p| p == piece) {
            self.order.remove(pos);
        }
        self.size -= chunks.values().map(Bytes::len).sum::<usize>();
        coalesce(chunks)
    }

    /// Removes the least recently written piece.
    pub fn pop_oldest(&mut self) -> Option<(usize, Vec<WriteRegion>)> {
        let piece = *self.order.front()?;
        Some((piece, self.take(piece)))
    }

    /// Drops the buffered chunks of `piece` without writing them.
    pub fn discard(&mut self, piece: usize) {
        self.take(piece);
    }

    /// Pieces currently holding buffered data, oldest first.
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.iter().copied()
    }
}

fn coalesce(chunks: BTreeMap<u32, Bytes>) -> Vec<WriteRegion> {
    let mut regions = Vec::new();
    let mut current_begin = 0u32;
    let mut current: Vec<Bytes> = Vec::new();
    let mut current_len = 0usize;

    for (begin, data) in chunks {
        let contiguous = !current.is_empty() && begin as usize == current_begin as usize + current_len;
        if !contiguous {
            if !current.is_empty() {
                regions.push(join(current_begin, std::mem::take(&mut current)));
            }
            current_begin = begin;
            current_len = 0;
        }
        current_len += data.len();
        current.push(data);
    }

    if !current.is_empty() {
        regions.push(join(current_begin, current));
    }
    regions
}

fn join(begin: u32, parts: Vec<Bytes>) -> WriteRegion {
    let data = if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        Bytes::from(parts.concat())
    };
    WriteRegion { begin, data }
}
