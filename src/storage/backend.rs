use super::error::StorageError;
use super::file::{file_spans, FileEntry};
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Zero-fill granularity of [`StorageBackend::preallocate`] and background
/// allocation writes.
const ZERO_CHUNK: usize = 256 * 1024;

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

struct FileHandle {
    file: File,
    dirty: bool,
}

/// Byte-addressed access to a torrent's file set.
///
/// Offsets are positions in the concatenation of all files. Handles are
/// opened lazily and kept for the backend's lifetime. The backend is owned
/// by a single engine, so methods take `&mut self` and never race.
pub struct StorageBackend {
    base_path: PathBuf,
    files: Vec<FileEntry>,
    total_length: u64,
    handles: HashMap<usize, FileHandle>,
    /// File lengths found on disk when the backend was opened.
    initial_lengths: Vec<u64>,
}

impl StorageBackend {
    /// Opens the file set under `base_path`, recording how much of each file
    /// already exists. Nothing is created until the first write.
    pub async fn open(base_path: PathBuf, files: Vec<FileEntry>) -> Result<Self, StorageError> {
        for file in &files {
            validate_file_path(&file.path)?;
        }

        let mut initial_lengths = Vec::with_capacity(files.len());
        for file in &files {
            let len = match tokio::fs::metadata(base_path.join(&file.path)).await {
                Ok(meta) if meta.is_file() => meta.len().min(file.length),
                _ => 0,
            };
            initial_lengths.push(len);
        }

        let total_length = files.iter().map(|f| f.length).sum();
        Ok(Self {
            base_path,
            files,
            total_length,
            handles: HashMap::new(),
            initial_lengths,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Returns true if every byte of the range existed on disk at open time.
    pub fn was_preallocated(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        file_spans(&self.files, offset, length)
            .iter()
            .all(|span| span.file_offset + span.length <= self.initial_lengths[span.file_index])
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<(), StorageError> {
        if offset + length > self.total_length {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("range {offset}+{length} beyond end of storage"),
            )));
        }
        Ok(())
    }

    async fn handle(&mut self, file_index: usize) -> Result<&mut FileHandle, StorageError> {
        if !self.handles.contains_key(&file_index) {
            let path = self.base_path.join(&self.files[file_index].path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;
            self.handles
                .insert(file_index, FileHandle { file, dirty: false });
        }
        self.handles
            .get_mut(&file_index)
            .ok_or_else(|| StorageError::Io(std::io::Error::other("file handle vanished")))
    }

    /// Reads exactly `length` bytes. Fails if any part is missing on disk.
    pub async fn read(&mut self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        self.read_inner(offset, length, false).await
    }

    /// Reads `length` bytes, treating anything past the end of a file as
    /// zeros.
    pub async fn read_padded(&mut self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        self.read_inner(offset, length, true).await
    }

    async fn read_inner(
        &mut self,
        offset: u64,
        length: usize,
        padded: bool,
    ) -> Result<Bytes, StorageError> {
        self.check_range(offset, length as u64)?;
        let mut data = BytesMut::zeroed(length);
        let mut pos = 0usize;

        for span in file_spans(&self.files, offset, length as u64) {
            let len = span.length as usize;
            let handle = self.handle(span.file_index).await?;
            let on_disk = handle.file.metadata().await?.len();
            let available = on_disk.saturating_sub(span.file_offset).min(span.length) as usize;
            if available < len && !padded {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("file {} is shorter than requested", span.file_index),
                )));
            }
            if available > 0 {
                handle.file.seek(SeekFrom::Start(span.file_offset)).await?;
                handle.file.read_exact(&mut data[pos..pos + available]).await?;
            }
            pos += len;
        }

        Ok(data.freeze())
    }

    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.check_range(offset, data.len() as u64)?;
        let mut pos = 0usize;

        for span in file_spans(&self.files, offset, data.len() as u64) {
            let len = span.length as usize;
            let handle = self.handle(span.file_index).await?;
            handle.file.seek(SeekFrom::Start(span.file_offset)).await?;
            handle.file.write_all(&data[pos..pos + len]).await?;
            handle.file.flush().await?;
            handle.dirty = true;
            pos += len;
        }

        Ok(())
    }

    /// Writes zeros over `[offset, offset + length)`.
    pub async fn write_zeros(&mut self, offset: u64, length: u64) -> Result<(), StorageError> {
        let zeros = vec![0u8; ZERO_CHUNK];
        let mut done = 0u64;
        while done < length {
            let step = (length - done).min(ZERO_CHUNK as u64) as usize;
            self.write(offset + done, &zeros[..step]).await?;
            done += step as u64;
        }
        Ok(())
    }

    /// Extends every file to its full length.
    pub async fn preallocate(&mut self) -> Result<(), StorageError> {
        for index in 0..self.files.len() {
            let length = self.files[index].length;
            let handle = self.handle(index).await?;
            if handle.file.metadata().await?.len() < length {
                handle.file.set_len(length).await?;
                handle.dirty = true;
            }
        }
        Ok(())
    }

    /// Pushes buffered file data to the OS and syncs files written since
    /// the last flush.
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        for handle in self.handles.values_mut() {
            if handle.dirty {
                handle.file.sync_data().await?;
                handle.dirty = false;
            }
        }
        Ok(())
    }

    /// Flushes and drops every open handle.
    pub async fn close(&mut self) -> Result<(), StorageError> {
        self.flush().await?;
        self.handles.clear();
        Ok(())
    }
}

/// SHA-1 of `data`, computed off the event loop.
pub async fn hash_bytes(data: Bytes) -> Result<[u8; 20], StorageError> {
    tokio::task::spawn_blocking(move || {
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let digest: [u8; 20] = hasher.finalize().into();
        digest
    })
    .await
    .map_err(|e| StorageError::Io(std::io::Error::other(e)))
}
