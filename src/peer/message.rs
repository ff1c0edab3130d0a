use super::error::PeerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Bytes of the handshake before the info hash: pstrlen, pstr, reserved.
pub const HANDSHAKE_PREFIX_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extended),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10; // Extension protocol (BEP-10)
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        (self.reserved[5] & 0x10) != 0
    }

    /// The part of the handshake that does not depend on the remote side.
    pub fn encode_prefix(reserved: &[u8; 8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_PREFIX_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(reserved);
        buf.freeze()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_slice(&Self::encode_prefix(&self.reserved));
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }

        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    // Extension protocol
    Extended { id: u8, payload: Bytes },
    /// A message type we do not speak; ignored.
    Unknown { id: u8 },
}

impl Message {
    /// Bytes this message occupies on the wire, length prefix included.
    pub fn wire_len(&self) -> usize {
        4 + match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::Unknown { .. } => 1,
            Message::Have { .. } => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { data, .. } => 9 + data.len(),
            Message::Port(_) => 3,
            Message::Extended { payload, .. } => 2 + payload.len(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32((self.wire_len() - 4) as u32);

        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::Have { piece } => {
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port(port) => {
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
            Message::Extended { id, payload } => {
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            Message::Unknown { id } => buf.put_u8(*id),
        }
    }

    /// Decodes a complete frame body (the bytes after the length prefix).
    ///
    /// Fixed-size messages must have exactly their size; anything else is a
    /// protocol violation.
    pub fn decode_body(mut body: Bytes) -> Result<Self, PeerError> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let raw_id = body.get_u8();
        let id = match MessageId::try_from(raw_id) {
            Ok(id) => id,
            Err(other) => return Ok(Message::Unknown { id: other }),
        };

        let payload = body.remaining();
        let expect = |len: usize| -> Result<(), PeerError> {
            if payload == len {
                Ok(())
            } else {
                Err(PeerError::BadLength {
                    id: raw_id,
                    length: payload + 1,
                })
            }
        };

        match id {
            MessageId::Choke => expect(0).map(|_| Message::Choke),
            MessageId::Unchoke => expect(0).map(|_| Message::Unchoke),
            MessageId::Interested => expect(0).map(|_| Message::Interested),
            MessageId::NotInterested => expect(0).map(|_| Message::NotInterested),
            MessageId::Have => {
                expect(4)?;
                Ok(Message::Have {
                    piece: body.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(body)),
            MessageId::Request => {
                expect(12)?;
                Ok(Message::Request {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    length: body.get_u32(),
                })
            }
            MessageId::Piece => {
                if payload < 8 {
                    return Err(PeerError::BadLength {
                        id: raw_id,
                        length: payload + 1,
                    });
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: body,
                })
            }
            MessageId::Cancel => {
                expect(12)?;
                Ok(Message::Cancel {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    length: body.get_u32(),
                })
            }
            MessageId::Port => {
                expect(2)?;
                Ok(Message::Port(body.get_u16()))
            }
            MessageId::Extended => {
                if payload < 1 {
                    return Err(PeerError::BadLength {
                        id: raw_id,
                        length: payload + 1,
                    });
                }
                let ext_id = body.get_u8();
                Ok(Message::Extended {
                    id: ext_id,
                    payload: body,
                })
            }
        }
    }

    /// Decodes a whole frame including its length prefix.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::Protocol("frame too short".into()));
        }

        let length = data.get_u32() as usize;
        if data.len() != length {
            return Err(PeerError::Protocol(format!(
                "frame declares {length} bytes, has {}",
                data.len()
            )));
        }

        Self::decode_body(data)
    }
}
