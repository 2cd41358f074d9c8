//! Binary codec for input batch serialization.
//!
//! Every peer must encode an [`InputBatch`](crate::InputBatch) to the same bytes, so the
//! bincode configuration lives here and nowhere else.
//!
//! # Examples
//!
//! ```
//! use lockstep_rollback::network::codec::{decode, encode};
//!
//! let data: (i32, u8) = (42, 7);
//! let bytes = encode(&data).expect("encoding should succeed");
//! let (decoded, bytes_read): ((i32, u8), _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(data, decoded);
//! assert_eq!(bytes_read, bytes.len());
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::RollbackError;

// Fixed-size integers keep the encoding independent of the values carried, so a batch
// for frame 3 and one for frame 3_000_000 have the same layout.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What was being encoded or decoded when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding an input batch.
    EncodeBatch,
    /// Decoding an input batch.
    DecodeBatch,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeBatch => write!(f, "encoding input batch"),
            Self::DecodeBatch => write!(f, "decoding input batch"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors are opaque (they only implement `Display`), so their message is kept
/// as a `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The value decoded fine but did not use every byte of the message.
    TrailingBytes {
        /// Bytes consumed by the decoded value.
        consumed: usize,
        /// Total length of the message.
        total: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::TrailingBytes { consumed, total } => {
                write!(
                    f,
                    "message has {} trailing bytes after the decoded value",
                    total.saturating_sub(*consumed)
                )
            },
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for RollbackError {
    fn from(err: CodecError) -> Self {
        RollbackError::SerializationError {
            context: err.to_string(),
        }
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Decodes a value from a byte slice. Returns the value and the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value that must span the whole byte slice.
pub fn decode_exact<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let (value, consumed) = decode(bytes)?;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes {
            consumed,
            total: bytes.len(),
        });
    }
    Ok(value)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::Frame;

    #[test]
    fn fixed_int_encoding_has_stable_width() {
        let small = encode(&Frame::new(3)).unwrap();
        let large = encode(&Frame::new(3_000_000)).unwrap();
        assert_eq!(small.len(), 4);
        assert_eq!(small.len(), large.len());
    }

    #[test]
    fn truncated_input_is_a_decode_error() {
        let bytes = encode(&(1u32, 2u32)).unwrap();
        let result: CodecResult<((u32, u32), usize)> = decode(&bytes[..5]);
        assert!(matches!(result, Err(CodecError::DecodeError { .. })));
    }

    #[test]
    fn decode_exact_rejects_trailing_bytes() {
        let mut bytes = encode(&7u32).unwrap();
        bytes.push(0);
        let result: CodecResult<u32> = decode_exact(&bytes);
        assert_eq!(
            result,
            Err(CodecError::TrailingBytes {
                consumed: 4,
                total: 5
            })
        );
    }

    #[test]
    fn codec_error_converts_to_serialization_error() {
        let err: RollbackError =
            CodecError::decode("unexpected end", CodecOperation::DecodeBatch).into();
        match err {
            RollbackError::SerializationError { context } => {
                assert!(context.contains("decoding input batch"));
                assert!(context.contains("unexpected end"));
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
