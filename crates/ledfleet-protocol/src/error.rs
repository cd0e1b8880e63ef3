//! Codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input is not a valid zlib stream
    #[error("Corrupt compressed stream: {0}")]
    CorruptStream(String),

    /// The compressor itself failed
    #[error("Compression failed: {0}")]
    Compress(String),

    /// Not enough bytes for the structure being decoded
    #[error("Truncated input: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Header carries a command this codec does not know
    #[error("Unknown command: {0}")]
    UnknownCommand(u16),

    /// Compression envelope tags or lengths are inconsistent
    #[error("Bad compression envelope: {0}")]
    BadEnvelope(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
