use bytes::Bytes;

/// A contiguous byte range within a piece; the unit of REQUEST and PIECE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chunk {
    pub piece: usize,
    pub begin: u32,
    pub length: u32,
}

impl Chunk {
    pub fn new(piece: usize, begin: u32, length: u32) -> Self {
        Self {
            piece,
            begin,
            length,
        }
    }

    /// One past the last byte of the chunk within its piece.
    pub fn end(&self) -> u64 {
        self.begin as u64 + self.length as u64
    }
}

/// A received chunk with its data.
#[derive(Debug, Clone)]
pub struct Block {
    pub piece: usize,
    pub begin: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(piece: usize, begin: u32, data: Bytes) -> Self {
        Self { piece, begin, data }
    }

    pub fn chunk(&self) -> Chunk {
        Chunk::new(self.piece, self.begin, self.data.len() as u32)
    }
}

pub fn chunk_count(piece_length: u64, chunk_size: u32) -> usize {
    piece_length.div_ceil(chunk_size as u64) as usize
}

/// Slices a piece into consecutive `(begin, length)` ranges of
/// `chunk_size`, the last one short if the size does not divide evenly.
pub fn slice_piece(piece_length: u64, chunk_size: u32) -> Vec<(u32, u32)> {
    let size = chunk_size as u64;
    (0..chunk_count(piece_length, chunk_size) as u64)
        .map(|i| {
            let begin = i * size;
            (begin as u32, (piece_length - begin).min(size) as u32)
        })
        .collect()
}
