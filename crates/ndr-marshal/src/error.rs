//! NDR error types

use thiserror::Error;

use crate::syntax::NdrDataRepresentation;

/// Upper bound on a single decoded allocation, in bytes.
///
/// Counts on the wire are attacker-controlled; a decoder must not allocate
/// unbounded memory before it has seen the bytes to back it.
pub const MAX_NDR_ALLOCATION_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on the element count of a single decoded array.
pub const MAX_NDR_ARRAY_ELEMENTS: usize = 1024 * 1024;

/// NDR encoding/decoding errors
#[derive(Debug, Error)]
pub enum NdrError {
    /// Decoder ran past the end of the supplied buffer
    #[error("unexpected end of data: needed {needed} bytes, have {have}")]
    UnexpectedEndOfData { needed: usize, have: usize },

    /// Buffer declared with a non-default endianness/float/char format
    #[error("unsupported data representation: {0:?}")]
    UnsupportedDataRepresentation(NdrDataRepresentation),

    /// No encoding rule for the requested type/shape
    #[error("unsupported type: {0}")]
    UnsupportedType(&'static str),

    /// Invalid count or argument passed to a write call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid string - bad offset or malformed encoding
    #[error("invalid string: {0}")]
    InvalidString(String),

    /// Invalid pointer - unexpected referent ID
    #[error("invalid pointer: referent ID {0:#x}")]
    InvalidPointer(u64),

    /// Invalid discriminant for union
    #[error("invalid union discriminant: {0}")]
    InvalidDiscriminant(i64),

    /// Invalid enum value
    #[error("invalid enum value: {0}")]
    InvalidEnumValue(i64),

    /// System handle index out of range of the supplied handle list
    #[error("invalid system handle index: {0}")]
    InvalidHandleIndex(u32),

    /// Conformance mismatch
    #[error("conformance mismatch: max_count={max_count}, actual_count={actual_count}")]
    ConformanceMismatch { max_count: u64, actual_count: u64 },

    /// Decoded size exceeds the allocation guard
    #[error("allocation limit exceeded: requested {requested}, limit {limit}")]
    AllocationLimitExceeded { requested: usize, limit: usize },

    /// Integer overflow in a size computation
    #[error("integer overflow in size computation")]
    IntegerOverflow,

    /// System handle duplication failed
    #[error("handle duplication failed: {0}")]
    HandleDuplication(#[from] std::io::Error),

    /// UTF-8 decoding error
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    /// UTF-16 decoding error
    #[error("UTF-16 error: {0}")]
    Utf16Error(#[from] std::char::DecodeUtf16Error),
}

/// Result type for NDR operations
pub type Result<T> = std::result::Result<T, NdrError>;
