use std::ops::Range;
use std::path::PathBuf;

use crate::metainfo;

/// One backing file and its place in the torrent's byte space.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

/// The part of a byte range that falls inside one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
        }
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

impl From<&metainfo::File> for FileEntry {
    fn from(file: &metainfo::File) -> Self {
        Self::new(file.path.clone(), file.length, file.offset)
    }
}

/// Splits `[offset, offset + length)` into per-file spans.
///
/// Zero-length files never produce a span. Bytes past the last file are
/// silently dropped, so callers check the range first.
pub fn file_spans(files: &[FileEntry], offset: u64, length: u64) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    let mut remaining = length;
    let mut current = offset;

    for (file_index, file) in files.iter().enumerate() {
        if remaining == 0 {
            break;
        }

        let range = file.byte_range();
        if range.contains(&current) {
            let take = remaining.min(range.end - current);
            spans.push(FileSpan {
                file_index,
                file_offset: current - file.offset,
                length: take,
            });
            current += take;
            remaining -= take;
        }
    }

    spans
}
