//! Binary codec for envelopes and snapshots.
//!
//! Every byte that leaves the process goes through here, so all peers agree on one
//! bincode configuration: `standard()` with fixed-size integers. Fixed-size integers
//! keep the size of an envelope independent of the values it carries.
//!
//! ```
//! use lockstep_rollback::network::codec::{decode, encode, encode_into};
//!
//! let bytes = encode(&42u32).expect("encoding should succeed");
//! let (value, read): (u32, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(value, 42);
//! assert_eq!(read, bytes.len());
//!
//! let mut buffer = [0u8; 16];
//! let len = encode_into(&7u16, &mut buffer).expect("encoding should succeed");
//! assert_eq!(len, 2);
//! ```

use crate::RollbackError;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What the codec was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecOperation {
    /// Encoding into a fresh vector.
    Encode,
    /// Encoding into a caller-provided buffer.
    EncodeIntoBuffer,
    /// Decoding from a byte slice.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode => write!(f, "encoding"),
            Self::EncodeIntoBuffer => write!(f, "encoding into buffer"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// bincode errors carry no structured reason, so the message is kept as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// bincode refused to encode the value.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The bytes are not a valid encoding of the requested type.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The provided buffer was too small for encoding.
    BufferTooSmall {
        /// The actual buffer size provided.
        provided: usize,
    },
}

impl CodecError {
    /// Creates an encode error.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a decode error.
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
            Self::BufferTooSmall { provided } => {
                write!(f, "buffer too small: only {provided} bytes provided")
            },
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for RollbackError {
    fn from(err: CodecError) -> Self {
        RollbackError::Serialization {
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

/// Encodes a value into an existing buffer and returns the number of bytes written.
///
/// # Errors
/// Returns [`CodecError::BufferTooSmall`] if the value does not fit.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|e| match e {
        bincode::error::EncodeError::UnexpectedEnd => CodecError::BufferTooSmall {
            provided: buffer.len(),
        },
        other => CodecError::encode(other.to_string(), CodecOperation::EncodeIntoBuffer),
    })
}

/// Decodes a value and returns it together with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value, ignoring how many bytes were consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
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
    use crate::network::messages::{Message, MessageBody};
    use crate::{Frame, ParticipantIndex};

    fn envelope(body: MessageBody) -> Message {
        Message {
            from: ParticipantIndex::new(1),
            sequence: 7,
            magic: 0xABCD,
            body,
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let original = envelope(MessageBody::FrameReply {
            frame: Frame::new(42),
            state: vec![1, 2, 3, 4],
        });
        let bytes = encode(&original).unwrap();
        let (decoded, len): (Message, _) = decode(&bytes).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn test_fixed_int_encoding_keeps_sizes_stable() {
        let small = encode(&envelope(MessageBody::Input {
            frame: Frame::new(0),
            data: 0,
            connect_status: Vec::new(),
        }))
        .unwrap();
        let large = encode(&envelope(MessageBody::Input {
            frame: Frame::new(i32::MAX),
            data: u32::MAX,
            connect_status: Vec::new(),
        }))
        .unwrap();
        assert_eq!(small.len(), large.len());
    }

    #[test]
    fn test_encode_into_buffer_too_small() {
        let mut buffer = [0u8; 1];
        assert_eq!(
            encode_into(&0x1234_5678_9ABC_DEF0u64, &mut buffer),
            Err(CodecError::BufferTooSmall { provided: 1 })
        );
    }

    #[test]
    fn test_decode_invalid_data() {
        let result: CodecResult<Message> = decode_value(&[0xFF, 0xFF, 0xFF]);
        let err = result.unwrap_err();
        assert!(matches!(err, CodecError::DecodeError { .. }));
        assert!(matches!(
            RollbackError::from(err),
            RollbackError::Serialization { .. }
        ));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let msg = envelope(MessageBody::KeepAlive);
        assert_eq!(encode(&msg).unwrap(), encode(&msg).unwrap());
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::decode("unexpected end", CodecOperation::Decode);
        assert!(err.to_string().contains("decoding failed while decoding"));
        let err = CodecError::BufferTooSmall { provided: 10 };
        assert!(err.to_string().contains("10"));
    }
}
