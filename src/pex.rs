//! Peer Exchange (BEP-11)
//!
//! Connected peers gossip the addresses of other swarm members through the
//! `ut_pex` extension. Each message is a bencoded dictionary carrying compact
//! `added` / `dropped` lists (and their IPv6 twins) plus one flag byte per
//! added peer. [`PexState`] turns the current peer set into periodic deltas.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::bencode::{encode, BencodeError, DictReader, FromBencode, Value};
use crate::constants::PEX_MAX_PEERS_PER_MESSAGE;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub flags: PexFlags,
}

impl PexPeer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            flags: PexFlags::default(),
        }
    }

    pub fn with_flags(addr: SocketAddr, flags: PexFlags) -> Self {
        Self { addr, flags }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PexFlags {
    pub encryption: bool,
    pub seed: bool,
    pub connectable: bool,
}

impl PexFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: (b & 0x01) != 0,
            seed: (b & 0x02) != 0,
            connectable: (b & 0x10) != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.encryption {
            b |= 0x01;
        }
        if self.seed {
            b |= 0x02;
        }
        if self.connectable {
            b |= 0x10;
        }
        b
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }

    /// Keeps at most `max` added peers. Zero discards them all.
    pub fn truncate_added(&mut self, max: usize) {
        self.added.truncate(max);
    }

    pub fn encode(&self) -> Bytes {
        let (v4, v6): (Vec<&PexPeer>, Vec<&PexPeer>) =
            self.added.iter().partition(|p| p.addr.is_ipv4());

        let mut dict = BTreeMap::new();
        let mut put = |key: &'static [u8], value: Bytes| {
            dict.insert(Bytes::from_static(key), Value::Bytes(value));
        };

        put(b"added", compact(v4.iter().map(|p| p.addr)));
        put(b"added.f", v4.iter().map(|p| p.flags.to_byte()).collect::<Vec<_>>().into());
        put(b"dropped", compact(self.dropped.iter().copied().filter(SocketAddr::is_ipv4)));
        if !v6.is_empty() {
            put(b"added6", compact(v6.iter().map(|p| p.addr)));
            put(b"added6.f", v6.iter().map(|p| p.flags.to_byte()).collect::<Vec<_>>().into());
        }
        let dropped6: Vec<_> = self.dropped.iter().copied().filter(SocketAddr::is_ipv6).collect();
        if !dropped6.is_empty() {
            put(b"dropped6", compact(dropped6));
        }

        Bytes::from(encode(&Value::Dict(dict)))
    }
}

impl FromBencode for PexMessage {
    fn from_bencode(value: &Value) -> Result<Self, BencodeError> {
        let dict = DictReader::new(value, "ut_pex")?;
        let mut msg = PexMessage::new();

        let empty = Bytes::new();
        for (list_key, flag_key, width) in [("added", "added.f", 6), ("added6", "added6.f", 18)] {
            let Some(data) = dict.opt_bytes(list_key)? else {
                continue;
            };
            let flags = dict.opt_bytes(flag_key)?.unwrap_or(&empty);
            let addrs = decode_compact(data, width, list_key)?;
            msg.added.extend(addrs.into_iter().enumerate().map(|(i, addr)| {
                let flags = flags.get(i).copied().map(PexFlags::from_byte).unwrap_or_default();
                PexPeer::with_flags(addr, flags)
            }));
        }

        for (key, width) in [("dropped", 6), ("dropped6", 18)] {
            if let Some(data) = dict.opt_bytes(key)? {
                msg.dropped.extend(decode_compact(data, width, key)?);
            }
        }

        Ok(msg)
    }
}

fn compact(addrs: impl IntoIterator<Item = SocketAddr>) -> Bytes {
    let mut buf = BytesMut::new();
    for addr in addrs {
        match addr {
            SocketAddr::V4(a) => buf.put_slice(&a.ip().octets()),
            SocketAddr::V6(a) => buf.put_slice(&a.ip().octets()),
        }
        buf.put_u16(addr.port());
    }
    buf.freeze()
}

fn decode_compact(
    data: &[u8],
    width: usize,
    key: &'static str,
) -> Result<Vec<SocketAddr>, BencodeError> {
    if data.len() % width != 0 {
        return Err(BencodeError::InvalidValue {
            key,
            reason: format!("length {} is not a multiple of {width}", data.len()),
        });
    }

    Ok(data
        .chunks_exact(width)
        .map(|entry| {
            let port = u16::from_be_bytes([entry[width - 2], entry[width - 1]]);
            if width == 6 {
                let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            } else {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&entry[..16]);
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
            }
        })
        .collect())
}

/// Per-connection record of what we last told a peer, used to build deltas.
#[derive(Debug, Default)]
pub struct PexState {
    sent: HashSet<SocketAddr>,
}

impl PexState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the next delta message against `current`, the listen addresses
    /// of our other connected peers. Returns `None` when nothing changed.
    pub fn next_delta(&mut self, current: &[PexPeer]) -> Option<PexMessage> {
        let now: HashSet<SocketAddr> = current.iter().map(|p| p.addr).collect();

        let mut msg = PexMessage::new();
        msg.added = current
            .iter()
            .filter(|p| !self.sent.contains(&p.addr))
            .take(PEX_MAX_PEERS_PER_MESSAGE)
            .cloned()
            .collect();
        msg.dropped = self
            .sent
            .iter()
            .filter(|addr| !now.contains(addr))
            .take(PEX_MAX_PEERS_PER_MESSAGE)
            .copied()
            .collect();

        if msg.is_empty() {
            return None;
        }

        for peer in &msg.added {
            self.sent.insert(peer.addr);
        }
        for addr in &msg.dropped {
            self.sent.remove(addr);
        }
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, a), port))
    }

    #[test]
    fn test_pex_flags() {
        let flags = PexFlags {
            encryption: true,
            seed: false,
            connectable: true,
        };

        let byte = flags.to_byte();
        assert_eq!(byte, 0x11);
        assert_eq!(PexFlags::from_byte(byte), flags);
    }

    #[test]
    fn test_pex_encode_decode_v4() {
        let mut msg = PexMessage::new();
        msg.added.push(PexPeer::with_flags(
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 6881)),
            PexFlags {
                encryption: true,
                ..Default::default()
            },
        ));
        msg.added.push(PexPeer::with_flags(
            v4(1, 51413),
            PexFlags {
                seed: true,
                ..Default::default()
            },
        ));
        msg.dropped.push(v4(9, 6881));

        let decoded = PexMessage::from_bencode_bytes(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_pex_v6_entries() {
        let addr: SocketAddr = "[2001:db8::1]:6881".parse().unwrap();
        let mut msg = PexMessage::new();
        msg.added.push(PexPeer::new(addr));
        msg.added.push(PexPeer::new(v4(2, 7000)));

        let decoded = PexMessage::from_bencode_bytes(&msg.encode()).unwrap();
        assert_eq!(decoded.added.len(), 2);
        assert!(decoded.added.iter().any(|p| p.addr == addr));
    }

    #[test]
    fn test_pex_rejects_ragged_compact_list() {
        assert!(PexMessage::from_bencode_bytes(b"d5:added5:abcdee").is_err());
        assert!(PexMessage::from_bencode_bytes(b"li1ee").is_err());
    }

    #[test]
    fn test_pex_missing_flags_default() {
        let decoded = PexMessage::from_bencode_bytes(b"d5:added6:\x0a\x00\x00\x01\x1a\xe1e").unwrap();
        assert_eq!(decoded.added, vec![PexPeer::new(v4(1, 6881))]);
    }

    #[test]
    fn test_truncate_added() {
        let mut msg = PexMessage::new();
        for i in 0..10 {
            msg.added.push(PexPeer::new(v4(i, 6881)));
        }
        msg.truncate_added(3);
        assert_eq!(msg.added.len(), 3);
        msg.truncate_added(0);
        assert!(msg.added.is_empty());
    }

    #[test]
    fn test_pex_state_deltas() {
        let mut state = PexState::new();
        let a = PexPeer::new(v4(1, 6881));
        let b = PexPeer::new(v4(2, 6881));

        let first = state.next_delta(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(first.added.len(), 2);
        assert!(first.dropped.is_empty());

        assert!(state.next_delta(&[a.clone(), b.clone()]).is_none());

        let second = state.next_delta(&[a.clone()]).unwrap();
        assert!(second.added.is_empty());
        assert_eq!(second.dropped, vec![b.addr]);
    }
}
