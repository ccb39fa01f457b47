//! Error types for codec and container collaborators.
//!
//! Codec and container implementations report failures with these types; the
//! pipeline decides what each failure means for the run.

use thiserror::Error;

/// Main error type for core media operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Container format errors (demuxing/muxing).
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    /// Codec errors (encoding/decoding).
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid parameter provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Unsupported feature or format.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Container format errors.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// Invalid or corrupted container structure.
    #[error("Invalid container structure: {0}")]
    InvalidStructure(String),

    /// Unknown or unsupported container format.
    #[error("Unknown container format")]
    UnknownFormat,

    /// The container ended before its trailer.
    #[error("Container truncated: {0}")]
    Truncated(String),

    /// Stream not found in container.
    #[error("Stream {index} not found")]
    StreamNotFound { index: u32 },

    /// Track configuration error.
    #[error("Track configuration error: {0}")]
    TrackConfig(String),
}

/// Codec errors.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Payload does not match what the codec expects.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Input frame does not match the negotiated format.
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    /// Encoder configuration error.
    #[error("Encoder configuration error: {0}")]
    EncoderConfig(String),

    /// Decoder configuration error.
    #[error("Decoder configuration error: {0}")]
    DecoderConfig(String),

    /// Data submitted after end of input was signalled.
    #[error("Codec already flushed")]
    AlreadyFlushed,
}

impl From<String> for CodecError {
    fn from(s: String) -> Self {
        CodecError::MalformedPayload(s)
    }
}

/// Result type alias using the core error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid parameter error.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    /// Create an unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Check if this error only affects the unit being processed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Codec(CodecError::MalformedPayload(_))
                | Error::Codec(CodecError::FormatMismatch(_))
        )
    }
}
