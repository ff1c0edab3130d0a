use thiserror::Error;

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid string length at byte {0}")]
    InvalidStringLength(usize),

    #[error("unexpected character {ch:?} at byte {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("dictionary keys out of order at byte {0}")]
    UnsortedKeys(usize),

    #[error("trailing data after value")]
    TrailingData,

    #[error("nesting too deep")]
    NestingTooDeep,

    #[error("missing key: {0}")]
    MissingKey(&'static str),

    #[error("key {key} should be {expected}")]
    WrongType {
        key: &'static str,
        expected: &'static str,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}
