//! Resume snapshot.
//!
//! A snapshot is a bencoded dictionary:
//!
//! | key          | value                                                    |
//! |--------------|----------------------------------------------------------|
//! | `version`    | format version                                           |
//! | `pieces`     | piece count the bitfield was written for                 |
//! | `have`       | verified pieces, as a wire bitfield                      |
//! | `places`     | flat `[piece, slot, ...]` list of out-of-place pieces    |
//! | `partials`   | `[[piece, begin, length, begin, length, ...], ...]`      |
//! | `uploaded`   | session upload total                                     |
//! | `downloaded` | session download total                                   |
//!
//! Unknown keys are ignored so later versions can add fields.

use crate::bencode::{encode, BencodeError, DictReader, FromBencode, Value};
use crate::constants::SNAPSHOT_VERSION;
use crate::peer::Bitfield;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub have: Bitfield,
    /// `(piece, slot)` for pieces not at their natural slot.
    pub places: Vec<(usize, usize)>,
    /// Received `(begin, length)` ranges of unverified pieces.
    pub partials: Vec<(usize, Vec<(u32, u32)>)>,
    pub uploaded: u64,
    pub downloaded: u64,
}

impl Snapshot {
    pub fn new(piece_count: usize) -> Self {
        Self {
            have: Bitfield::new(piece_count),
            places: Vec::new(),
            partials: Vec::new(),
            uploaded: 0,
            downloaded: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let places = self
            .places
            .iter()
            .flat_map(|&(piece, slot)| [int(piece), int(slot)])
            .collect::<Vec<_>>();

        let partials = self
            .partials
            .iter()
            .map(|(piece, ranges)| {
                let mut entry = vec![int(*piece)];
                for &(begin, length) in ranges {
                    entry.push(Value::from(begin));
                    entry.push(Value::from(length));
                }
                Value::List(entry)
            })
            .collect::<Vec<_>>();

        let dict = Value::dict([
            ("version", Value::Integer(SNAPSHOT_VERSION)),
            ("pieces", int(self.have.len())),
            ("have", Value::Bytes(self.have.to_bytes())),
            ("places", Value::List(places)),
            ("partials", Value::List(partials)),
            ("uploaded", Value::Integer(self.uploaded as i64)),
            ("downloaded", Value::Integer(self.downloaded as i64)),
        ]);
        Bytes::from(encode(&dict))
    }
}

fn int(n: usize) -> Value {
    Value::Integer(n as i64)
}

fn uint<T: TryFrom<i64>>(value: &Value, key: &'static str) -> Result<T, BencodeError> {
    let i = value.as_integer().ok_or(BencodeError::WrongType {
        key,
        expected: "integer",
    })?;
    T::try_from(i).map_err(|_| BencodeError::InvalidValue {
        key,
        reason: format!("{i} is out of range"),
    })
}

impl FromBencode for Snapshot {
    fn from_bencode(value: &Value) -> Result<Self, BencodeError> {
        let dict = DictReader::new(value, "resume snapshot")?;
        let version = dict.int("version")?;
        if version < 1 {
            return Err(BencodeError::InvalidValue {
                key: "version",
                reason: format!("unsupported version {version}"),
            });
        }

        let piece_count: usize = dict.uint("pieces")?;
        let have = Bitfield::from_bytes(dict.bytes("have")?, piece_count).map_err(|e| {
            BencodeError::InvalidValue {
                key: "have",
                reason: e.to_string(),
            }
        })?;

        let flat = dict.opt_list("places")?.unwrap_or_default();
        if flat.len() % 2 != 0 {
            return Err(BencodeError::InvalidValue {
                key: "places",
                reason: "odd number of entries".into(),
            });
        }
        let places = flat
            .chunks_exact(2)
            .map(|pair| -> Result<(usize, usize), BencodeError> {
                Ok((uint(&pair[0], "places")?, uint(&pair[1], "places")?))
            })
            .collect::<Result<Vec<_>, BencodeError>>()?;

        let mut partials = Vec::new();
        for entry in dict.opt_list("partials")?.unwrap_or_default() {
            let items = entry.as_list().ok_or(BencodeError::WrongType {
                key: "partials",
                expected: "list",
            })?;
            let Some((piece, ranges)) = items.split_first() else {
                continue;
            };
            if ranges.len() % 2 != 0 {
                return Err(BencodeError::InvalidValue {
                    key: "partials",
                    reason: "odd number of range values".into(),
                });
            }
            let ranges = ranges
                .chunks_exact(2)
                .map(|pair| -> Result<(u32, u32), BencodeError> {
                    Ok((uint(&pair[0], "partials")?, uint(&pair[1], "partials")?))
                })
                .collect::<Result<Vec<_>, BencodeError>>()?;
            partials.push((uint(piece, "partials")?, ranges));
        }

        Ok(Self {
            have,
            places,
            partials,
            uploaded: dict.opt_uint("uploaded")?.unwrap_or(0),
            downloaded: dict.opt_uint("downloaded")?.unwrap_or(0),
        })
    }
}
