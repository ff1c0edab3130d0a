use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, BencodeError, DictReader, Value};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::path::{Component, Path, PathBuf};

/// A parsed torrent file.
///
/// Contains all metadata from a `.torrent` file, including file information,
/// piece hashes, and tracker URLs.
///
/// # Examples
///
/// ```no_run
/// use swarmcore::metainfo::Metainfo;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let data = std::fs::read("example.torrent")?;
/// let metainfo = Metainfo::from_bytes(&data)?;
///
/// println!("Torrent: {}", metainfo.info.name);
/// println!("Size: {} bytes", metainfo.info.total_length);
/// println!("Info hash: {}", metainfo.info_hash);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The info dictionary containing file and piece information.
    pub info: Info,
    /// The unique identifier for this torrent (hash of the info dictionary).
    pub info_hash: InfoHash,
    /// Primary tracker URL.
    pub announce: Option<String>,
    /// Multi-tier tracker list ([BEP-12](http://bittorrent.org/beps/bep_0012.html)).
    pub announce_list: Vec<Vec<String>>,
    /// Unix timestamp when the torrent was created.
    pub creation_date: Option<i64>,
    /// Optional comment about the torrent.
    pub comment: Option<String>,
    /// Name/version of the program that created the torrent.
    pub created_by: Option<String>,
    raw_info: Bytes,
}

/// The info dictionary from a torrent file.
///
/// The SHA1 hash of this dictionary (in bencode format) is the info hash.
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or directory.
    pub name: String,
    /// Number of bytes per piece.
    pub piece_length: u64,
    /// SHA1 hash of each piece (20 bytes each).
    pub pieces: Vec<[u8; 20]>,
    /// List of files in the torrent.
    pub files: Vec<File>,
    /// Total size of all files combined.
    pub total_length: u64,
    /// If true, clients should only use trackers in the metainfo (no PEX).
    pub private: bool,
}

impl Info {
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`; the last piece may be short.
    pub fn piece_size(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.total_length.saturating_sub(start).min(self.piece_length)
    }
}

/// A file within a torrent.
///
/// For single-file torrents, there is one file with the torrent name.
/// For multi-file torrents, paths are relative to the torrent's root directory.
#[derive(Debug, Clone)]
pub struct File {
    /// Path to the file (relative to the download directory).
    pub path: PathBuf,
    /// Size of the file in bytes.
    pub length: u64,
    /// Byte offset within the torrent's piece data.
    pub offset: u64,
}

impl Metainfo {
    /// Parses a torrent file from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The data is not valid bencode
    /// - Required fields are missing (info, name, pieces, etc.)
    /// - The pieces field length does not match the content length
    /// - A file path would escape the download directory
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let value = decode(data)?;
        let dict = DictReader::new(&value, "torrent")?;

        let info_value = dict
            .raw("info")
            .ok_or(BencodeError::MissingKey("info"))?;

        let raw_info = Bytes::from(encode(info_value));
        let info_hash = compute_info_hash(&raw_info);
        let info = parse_info(info_value)?;

        let announce_list = match dict.opt_list("announce-list")? {
            Some(tiers) => tiers
                .iter()
                .filter_map(|tier| {
                    let urls: Vec<String> = tier
                        .as_list()?
                        .iter()
                        .filter_map(|u| u.as_str().map(String::from))
                        .collect();
                    (!urls.is_empty()).then_some(urls)
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(Self {
            info,
            info_hash,
            announce: dict.opt_str("announce")?.map(String::from),
            announce_list,
            creation_date: dict.opt_int("creation date")?,
            comment: dict.opt_str("comment")?.map(String::from),
            created_by: dict.opt_str("created by")?.map(String::from),
            raw_info,
        })
    }

    /// Reads and parses a torrent file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Returns the raw bencoded info dictionary.
    pub fn raw_info(&self) -> &Bytes {
        &self.raw_info
    }

    /// Returns the tracker tiers to announce to.
    ///
    /// `announce-list` wins when present ([BEP-12]); otherwise the single
    /// `announce` URL forms one tier.
    ///
    /// [BEP-12]: http://bittorrent.org/beps/bep_0012.html
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            return self.announce_list.clone();
        }
        self.announce.iter().map(|url| vec![url.clone()]).collect()
    }
}

fn parse_info(value: &Value) -> Result<Info, MetainfoError> {
    let dict = DictReader::new(value, "info")?;

    let name = dict.str("name")?.to_string();
    check_component(&name)?;

    let piece_length: u64 = dict.uint("piece length")?;
    if piece_length == 0 {
        return Err(MetainfoError::InvalidField("piece length"));
    }

    let pieces_bytes = dict.bytes("pieces")?;
    if pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::InvalidField("pieces"));
    }

    let pieces: Vec<[u8; 20]> = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut arr = [0u8; 20];
            arr.copy_from_slice(chunk);
            arr
        })
        .collect();

    let private = dict.opt_int("private")?.is_some_and(|v| v == 1);

    let (files, total_length) = if let Some(length) = dict.opt_uint::<u64>("length")? {
        let file = File {
            path: PathBuf::from(&name),
            length,
            offset: 0,
        };
        (vec![file], length)
    } else {
        let mut files = Vec::new();
        let mut offset = 0u64;

        for file_value in dict.list("files")? {
            let file_dict = DictReader::new(file_value, "files")?;
            let length: u64 = file_dict.uint("length")?;

            let mut path = PathBuf::from(&name);
            let components = file_dict.list("path")?;
            if components.is_empty() {
                return Err(MetainfoError::InvalidField("path"));
            }
            for component in components {
                let part = component.as_str().ok_or(MetainfoError::InvalidField("path"))?;
                check_component(part)?;
                path.push(part);
            }

            files.push(File {
                path,
                length,
                offset,
            });
            offset += length;
        }

        (files, offset)
    };

    if total_length.div_ceil(piece_length) != pieces.len() as u64 {
        return Err(MetainfoError::InvalidField("pieces"));
    }

    Ok(Info {
        name,
        piece_length,
        pieces,
        files,
        total_length,
        private,
    })
}

fn check_component(part: &str) -> Result<(), MetainfoError> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(MetainfoError::PathTraversal(part.to_string())),
    }
}

fn compute_info_hash(raw_info: &[u8]) -> InfoHash {
    let mut hasher = Sha1::new();
    hasher.update(raw_info);
    InfoHash(hasher.finalize().into())
}
