use thiserror::Error;

/// Errors that can occur during bencode decoding.
///
/// # Examples
///
/// ```
/// use rdht::bencode::{decode, BencodeError};
///
/// assert!(matches!(decode(b"i42"), Err(BencodeError::UnexpectedEof)));
/// assert!(matches!(decode(b"i007e"), Err(BencodeError::InvalidInteger(_))));
/// assert!(matches!(decode(b"i42eextra"), Err(BencodeError::TrailingData)));
/// ```
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Integer is malformed (leading zeros, empty, or overflow).
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Byte string length prefix is not a valid number.
    #[error("invalid string length")]
    InvalidStringLength,

    /// Encountered an unexpected character while parsing.
    #[error("unexpected character: {0}")]
    UnexpectedChar(char),

    /// Dictionary key is not a byte string.
    #[error("dictionary key is not a string")]
    InvalidDictKey,

    /// The same dictionary key appeared twice.
    #[error("duplicate dictionary key: {0}")]
    DuplicateKey(String),

    /// Extra data exists after the bencode value.
    #[error("trailing data after value")]
    TrailingData,

    /// Nesting limit exceeded.
    #[error("nesting too deep")]
    NestingTooDeep,
}
