//! Piece storage on disk.
//!
//! Torrents split data into fixed-size pieces, and pieces may span multiple
//! files. This module maps pieces onto the file set, verifies them and
//! remembers enough to resume a download.
//!
//! # Components
//!
//! - [`StorageBackend`] - Byte-addressed reads and writes over the file set
//! - [`StorageWrapper`] - Request slicing, placement, hashing and resume
//! - [`WriteBuffer`] - Per-piece write coalescing, flushed oldest first
//! - [`PlacementMap`] - Which physical slot holds which piece
//! - [`Snapshot`] - Bencoded resume state
//!
//! # Allocation
//!
//! With [`AllocType::Sparse`](crate::config::AllocType::Sparse) and
//! `PreAllocate` a piece always lives at its natural offset. With `Normal`
//! and `Background` new pieces take the lowest free slot, so files grow
//! from the front; pieces are moved home as space frees up.
//!
//! # Examples
//!
//! ```no_run
//! use swarmcore::storage::{FileEntry, StorageBackend, StorageOptions, StorageWrapper};
//! use std::path::PathBuf;
//!
//! # async fn example(hashes: Vec<[u8; 20]>) -> Result<(), Box<dyn std::error::Error>> {
//! let files = vec![
//!     FileEntry::new(PathBuf::from("album/a.flac"), 1000, 0),
//!     FileEntry::new(PathBuf::from("album/b.flac"), 500, 1000),
//! ];
//! let backend = StorageBackend::open(PathBuf::from("./downloads"), files).await?;
//! let mut storage =
//!     StorageWrapper::open(backend, hashes, 512, StorageOptions::default(), None, |_| {}).await?;
//!
//! let (begin, length) = storage.new_request(0)?;
//! # let _ = (begin, length);
//! # Ok(())
//! # }
//! ```

mod backend;
mod error;
mod file;
mod placement;
mod snapshot;
mod write_buffer;
mod wrapper;

pub use backend::{hash_bytes, StorageBackend};
pub use error::StorageError;
pub use file::{file_spans, FileEntry, FileSpan};
pub use placement::PlacementMap;
pub use snapshot::Snapshot;
pub use write_buffer::{WriteBuffer, WriteRegion};
pub use wrapper::{PieceStatus, StorageOptions, StorageWrapper};

#[cfg(test)]
mod tests;
