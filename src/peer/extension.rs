use super::error::PeerError;
use crate::bencode::{encode, BencodeError, DictReader, FromBencode, Value};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::IpAddr;

pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// Peer exchange.
pub const UT_PEX: &str = "ut_pex";
/// Overlay-swarm capability signal.
pub const OVERLAY_SWARM: &str = "Tr_OVERLAYSWARM";

/// Message ids we assign to the extensions we speak.
pub const LOCAL_EXTENSIONS: &[(&str, u8)] = &[(UT_PEX, 1), (OVERLAY_SWARM, 2)];

/// The BEP-10 extension handshake dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to the message id the sender wants to receive it on.
    pub extensions: BTreeMap<String, u8>,
    /// `v`: client name and version.
    pub client: Option<String>,
    /// `yourip`: our address as the sender sees it.
    pub yourip: Option<IpAddr>,
    /// `reqq`: outstanding requests the sender will queue.
    pub reqq: Option<u32>,
    /// `p`: the sender's listen port.
    pub listen_port: Option<u16>,
    /// `e`: the sender prefers encrypted connections.
    pub prefers_encryption: bool,
}

impl ExtensionHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extensions(extensions: &[(&str, u8)]) -> Self {
        let mut hs = Self::new();
        for (name, id) in extensions {
            hs.extensions.insert((*name).to_string(), *id);
        }
        hs
    }

    pub fn encode(&self) -> Bytes {
        let m = Value::dict(
            self.extensions
                .iter()
                .map(|(name, id)| (name.as_bytes(), Value::Integer(i64::from(*id)))),
        );

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), m);

        if let Some(ref client) = self.client {
            dict.insert(Bytes::from_static(b"v"), Value::string(client));
        }

        if let Some(ip) = self.yourip {
            let raw = match ip {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            };
            dict.insert(Bytes::from_static(b"yourip"), Value::from(raw));
        }

        if let Some(reqq) = self.reqq {
            dict.insert(Bytes::from_static(b"reqq"), Value::from(reqq));
        }

        if let Some(port) = self.listen_port {
            dict.insert(Bytes::from_static(b"p"), Value::from(u32::from(port)));
        }

        if self.prefers_encryption {
            dict.insert(Bytes::from_static(b"e"), Value::Integer(1));
        }

        Bytes::from(encode(&Value::Dict(dict)))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        Ok(Self::from_bencode_bytes(data)?)
    }

    pub fn get_extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }

    /// Reverse lookup: the extension name a local message id stands for.
    pub fn name_of(&self, id: u8) -> Option<&str> {
        self.extensions
            .iter()
            .find(|(_, ext_id)| **ext_id == id)
            .map(|(name, _)| name.as_str())
    }
}

impl FromBencode for ExtensionHandshake {
    fn from_bencode(value: &Value) -> Result<Self, BencodeError> {
        let dict = DictReader::new(value, "extension handshake")?;
        let mut hs = Self::new();

        if let Some(m) = dict.opt_dict("m")? {
            for (key, val) in m.inner() {
                let id = val
                    .as_integer()
                    .and_then(|i| u8::try_from(i).ok())
                    .ok_or(BencodeError::InvalidValue {
                        key: "m",
                        reason: "extension id is not a byte".into(),
                    })?;
                // id 0 means the extension is disabled
                if let (Ok(name), true) = (std::str::from_utf8(key), id > 0) {
                    hs.extensions.insert(name.to_string(), id);
                }
            }
        }

        hs.client = dict.opt_bytes("v")?.map(|v| String::from_utf8_lossy(v).into_owned());

        hs.yourip = dict.opt_bytes("yourip")?.and_then(|raw| match raw.len() {
            4 => <[u8; 4]>::try_from(raw.as_ref()).ok().map(IpAddr::from),
            16 => <[u8; 16]>::try_from(raw.as_ref()).ok().map(IpAddr::from),
            _ => None,
        });

        // advisory fields: out-of-range or mistyped values are dropped
        let int = |key: &str| dict.raw(key).and_then(Value::as_integer);
        hs.reqq = int("reqq").and_then(|n| u32::try_from(n).ok());
        hs.listen_port = int("p").and_then(|n| u16::try_from(n).ok());
        hs.prefers_encryption = int("e").is_some_and(|e| e != 0);

        Ok(hs)
    }
}

#[derive(Debug, Clone)]
pub enum ExtensionMessage {
    Handshake(ExtensionHandshake),
    Pex(Bytes),
    Overlay(Bytes),
    Unknown { id: u8, payload: Bytes },
}

impl ExtensionMessage {
    /// Classifies an incoming EXTEND message. `id` is one of our local ids.
    pub fn decode(id: u8, payload: Bytes) -> Result<Self, PeerError> {
        if id == EXTENSION_HANDSHAKE_ID {
            return Ok(ExtensionMessage::Handshake(ExtensionHandshake::decode(&payload)?));
        }
        let name = LOCAL_EXTENSIONS
            .iter()
            .find(|(_, local)| *local == id)
            .map(|(name, _)| *name);
        Ok(match name {
            Some(UT_PEX) => ExtensionMessage::Pex(payload),
            Some(OVERLAY_SWARM) => ExtensionMessage::Overlay(payload),
            _ => ExtensionMessage::Unknown { id, payload },
        })
    }
}
