use crate::bencode::{BencodeError, DictReader, FromBencode, Value};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

/// A successful announce reply.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
    pub peers6: Vec<SocketAddr>,
    pub warning_message: Option<String>,
    pub tracker_id: Option<String>,
}

impl AnnounceResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            min_interval: None,
            complete: None,
            incomplete: None,
            peers: Vec::new(),
            peers6: Vec::new(),
            warning_message: None,
            tracker_id: None,
        }
    }

    pub fn all_peers(&self) -> impl Iterator<Item = &SocketAddr> {
        self.peers.iter().chain(self.peers6.iter())
    }
}

impl FromBencode for AnnounceResponse {
    fn from_bencode(value: &Value) -> Result<Self, BencodeError> {
        let dict = DictReader::new(value, "tracker response")?;

        let mut response = AnnounceResponse::new(dict.uint("interval")?);
        response.min_interval = dict.opt_uint("min interval")?;
        response.complete = dict.opt_uint("complete")?;
        response.incomplete = dict.opt_uint("incomplete")?;
        response.warning_message = dict.opt_str("warning message")?.map(String::from);
        response.tracker_id = dict.opt_str("tracker id")?.map(String::from);

        match dict.raw("peers") {
            Some(Value::Bytes(compact)) => response.peers = parse_compact_peers(compact),
            Some(Value::List(list)) => response.peers = parse_peer_dicts(list)?,
            Some(_) => {
                return Err(BencodeError::WrongType {
                    key: "peers",
                    expected: "string or list",
                })
            }
            None => {}
        }
        if let Some(compact) = dict.opt_bytes("peers6")? {
            response.peers6 = parse_compact_peers6(compact);
        }
        Ok(response)
    }
}

/// The non-compact peer list: dictionaries with `ip` and `port`. Entries
/// with an unparseable IP are skipped.
fn parse_peer_dicts(list: &[Value]) -> Result<Vec<SocketAddr>, BencodeError> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let peer = DictReader::new(entry, "peer")?;
        let port: u16 = peer.uint("port")?;
        if let Ok(ip) = peer.str("ip")?.parse::<IpAddr>() {
            peers.push(SocketAddr::new(ip, port));
        }
    }
    Ok(peers)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeFile {
    pub info_hash: [u8; 20],
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeResponse {
    pub files: Vec<ScrapeFile>,
}

impl ScrapeResponse {
    pub fn get(&self, info_hash: &[u8; 20]) -> Option<&ScrapeFile> {
        self.files.iter().find(|f| &f.info_hash == info_hash)
    }
}

impl FromBencode for ScrapeResponse {
    fn from_bencode(value: &Value) -> Result<Self, BencodeError> {
        let dict = DictReader::new(value, "scrape response")?;
        let mut files = Vec::new();
        for (hash, stats) in dict.dict("files")?.inner() {
            let Ok(info_hash) = <[u8; 20]>::try_from(hash.as_ref()) else {
                continue;
            };
            let stats = DictReader::new(stats, "scrape entry")?;
            files.push(ScrapeFile {
                info_hash,
                complete: stats.opt_uint("complete")?.unwrap_or(0),
                incomplete: stats.opt_uint("incomplete")?.unwrap_or(0),
                downloaded: stats.opt_uint("downloaded")?.unwrap_or(0),
            });
        }
        Ok(Self { files })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompactPeer {
    pub ip: IpAddr,
    pub port: u16,
}

impl CompactPeer {
    pub fn from_v4_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 6 {
            return None;
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Some(Self {
            ip: IpAddr::V4(ip),
            port,
        })
    }

    pub fn from_v6_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 18 {
            return None;
        }
        let mut ip_bytes = [0u8; 16];
        ip_bytes.copy_from_slice(&bytes[..16]);
        let ip = Ipv6Addr::from(ip_bytes);
        let port = u16::from_be_bytes([bytes[16], bytes[17]]);
        Some(Self {
            ip: IpAddr::V6(ip),
            port,
        })
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .filter_map(CompactPeer::from_v4_bytes)
        .map(|p| p.to_socket_addr())
        .collect()
}

pub fn parse_compact_peers6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .filter_map(CompactPeer::from_v6_bytes)
        .map(|p| p.to_socket_addr())
        .collect()
}
