use super::decode::decode;
use super::error::BencodeError;
use super::value::Value;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Types that can be built from a decoded bencode value.
///
/// Implementations validate the shape they expect and ignore keys they do
/// not know, so newer peers and snapshots stay readable.
pub trait FromBencode: Sized {
    fn from_bencode(value: &Value) -> Result<Self, BencodeError>;

    /// Decodes `data` and converts the result.
    fn from_bencode_bytes(data: &[u8]) -> Result<Self, BencodeError> {
        Self::from_bencode(&decode(data)?)
    }
}

/// Typed access to the keys of a bencoded dictionary.
///
/// Required getters fail with [`BencodeError::MissingKey`]; every getter
/// fails with [`BencodeError::WrongType`] when the key is present with the
/// wrong type.
///
/// # Examples
///
/// ```
/// use swarmcore::bencode::{decode, DictReader};
///
/// let value = decode(b"d8:intervali1800e5:peers0:e").unwrap();
/// let reader = DictReader::new(&value, "tracker response").unwrap();
///
/// assert_eq!(reader.int("interval").unwrap(), 1800);
/// assert!(reader.opt_int("min interval").unwrap().is_none());
/// assert!(reader.str("failure reason").is_err());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DictReader<'a> {
    dict: &'a BTreeMap<Bytes, Value>,
}

impl<'a> DictReader<'a> {
    /// Wraps `value`, which must be a dictionary. `what` names it in errors.
    pub fn new(value: &'a Value, what: &'static str) -> Result<Self, BencodeError> {
        match value {
            Value::Dict(dict) => Ok(Self { dict }),
            _ => Err(BencodeError::WrongType {
                key: what,
                expected: "dictionary",
            }),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.dict.contains_key(key.as_bytes())
    }

    /// Returns the raw value under `key`.
    pub fn raw(&self, key: &str) -> Option<&'a Value> {
        self.dict.get(key.as_bytes())
    }

    pub fn inner(&self) -> &'a BTreeMap<Bytes, Value> {
        self.dict
    }

    fn typed<T>(
        &self,
        key: &'static str,
        expected: &'static str,
        get: impl Fn(&'a Value) -> Option<T>,
    ) -> Result<Option<T>, BencodeError> {
        match self.raw(key) {
            None => Ok(None),
            Some(value) => get(value)
                .map(Some)
                .ok_or(BencodeError::WrongType { key, expected }),
        }
    }

    pub fn opt_int(&self, key: &'static str) -> Result<Option<i64>, BencodeError> {
        self.typed(key, "integer", Value::as_integer)
    }

    pub fn int(&self, key: &'static str) -> Result<i64, BencodeError> {
        self.opt_int(key)?.ok_or(BencodeError::MissingKey(key))
    }

    /// Reads a non-negative integer that must fit in `T`.
    pub fn opt_uint<T: TryFrom<i64>>(&self, key: &'static str) -> Result<Option<T>, BencodeError> {
        self.opt_int(key)?
            .map(|i| {
                T::try_from(i).map_err(|_| BencodeError::InvalidValue {
                    key,
                    reason: format!("{i} is out of range"),
                })
            })
            .transpose()
    }

    pub fn uint<T: TryFrom<i64>>(&self, key: &'static str) -> Result<T, BencodeError> {
        self.opt_uint(key)?.ok_or(BencodeError::MissingKey(key))
    }

    pub fn opt_bytes(&self, key: &'static str) -> Result<Option<&'a Bytes>, BencodeError> {
        self.typed(key, "string", Value::as_bytes)
    }

    pub fn bytes(&self, key: &'static str) -> Result<&'a Bytes, BencodeError> {
        self.opt_bytes(key)?.ok_or(BencodeError::MissingKey(key))
    }

    pub fn opt_str(&self, key: &'static str) -> Result<Option<&'a str>, BencodeError> {
        self.typed(key, "utf-8 string", Value::as_str)
    }

    pub fn str(&self, key: &'static str) -> Result<&'a str, BencodeError> {
        self.opt_str(key)?.ok_or(BencodeError::MissingKey(key))
    }

    pub fn opt_list(&self, key: &'static str) -> Result<Option<&'a [Value]>, BencodeError> {
        self.typed(key, "list", |v| v.as_list().map(Vec::as_slice))
    }

    pub fn list(&self, key: &'static str) -> Result<&'a [Value], BencodeError> {
        self.opt_list(key)?.ok_or(BencodeError::MissingKey(key))
    }

    pub fn opt_dict(&self, key: &'static str) -> Result<Option<DictReader<'a>>, BencodeError> {
        self.typed(key, "dictionary", |v| v.as_dict().map(|dict| DictReader { dict }))
    }

    pub fn dict(&self, key: &'static str) -> Result<DictReader<'a>, BencodeError> {
        self.opt_dict(key)?.ok_or(BencodeError::MissingKey(key))
    }
}
