//! Pipeline error types.

use std::fmt;

use thiserror::Error;
use transcode_core::error::{ContainerError, Error as CoreError};

use crate::pipeline::PipelineState;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Open,
    Input,
    StreamInfo,
    CodecNotFound,
    CodecOpen,
    FilterGraph,
    FilterFrame,
    Decode,
    Encode,
    UnsupportedContainer,
    Mux,
    InvalidState,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Pipeline error type.
///
/// Errors carry rendered messages rather than their sources so the first
/// fatal error can be retained in the run report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The transcode configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The input could not be opened or no container was recognized.
    #[error("Cannot open input '{locator}': {reason}")]
    Open { locator: String, reason: String },

    /// Reading from an opened input failed.
    #[error("Input read error: {0}")]
    Input(String),

    /// Stream metadata could not be resolved.
    #[error("Stream info error: {0}")]
    StreamInfo(String),

    /// No registered codec matches the requested name or identifier.
    #[error("Codec not found: {0}")]
    CodecNotFound(String),

    /// A codec was found but rejected its parameters.
    #[error("Cannot open codec '{codec}': {reason}")]
    CodecOpen { codec: String, reason: String },

    /// The filter graph is invalid or failed internally.
    #[error("Filter graph error: {0}")]
    FilterGraph(String),

    /// A single frame was rejected by the filter graph.
    #[error("Filter rejected frame on stream {stream}: {reason}")]
    FilterFrame { stream: u32, reason: String },

    /// A packet could not be decoded.
    #[error("Decode error on stream {stream}: {reason}")]
    Decode { stream: u32, reason: String },

    /// A frame could not be encoded.
    #[error("Encode error on stream {stream}: {reason}")]
    Encode { stream: u32, reason: String },

    /// No muxer is registered for the requested container.
    #[error("Unsupported container: {0}")]
    UnsupportedContainer(String),

    /// Muxer contract violation or write failure.
    #[error("Mux error: {0}")]
    Mux(String),

    /// The operation is not allowed in the pipeline's current state.
    #[error("Operation '{operation}' not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PipelineState,
    },

    /// The run was cancelled.
    #[error("Pipeline cancelled")]
    Cancelled,
}

/// Pipeline result type.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Open { .. } => ErrorKind::Open,
            Self::Input(_) => ErrorKind::Input,
            Self::StreamInfo(_) => ErrorKind::StreamInfo,
            Self::CodecNotFound(_) => ErrorKind::CodecNotFound,
            Self::CodecOpen { .. } => ErrorKind::CodecOpen,
            Self::FilterGraph(_) => ErrorKind::FilterGraph,
            Self::FilterFrame { .. } => ErrorKind::FilterFrame,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Encode { .. } => ErrorKind::Encode,
            Self::UnsupportedContainer(_) => ErrorKind::UnsupportedContainer,
            Self::Mux(_) => ErrorKind::Mux,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the run can continue after dropping the offending unit.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. } | Self::Encode { .. } | Self::FilterFrame { .. }
        )
    }

    pub(crate) fn open(locator: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::Open {
            locator: locator.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn codec_open(codec: impl Into<String>, err: CoreError) -> Self {
        Self::CodecOpen {
            codec: codec.into(),
            reason: err.to_string(),
        }
    }

    /// Map a decoder failure. Payload problems only cost the packet.
    pub(crate) fn decode(stream: u32, err: CoreError) -> Self {
        if err.is_recoverable() {
            Self::Decode {
                stream,
                reason: err.to_string(),
            }
        } else {
            Self::CodecOpen {
                codec: format!("decoder for stream {}", stream),
                reason: err.to_string(),
            }
        }
    }

    /// Map an encoder failure. Rejected frames only cost the frame.
    pub(crate) fn encode(stream: u32, err: CoreError) -> Self {
        if err.is_recoverable() {
            Self::Encode {
                stream,
                reason: err.to_string(),
            }
        } else {
            Self::CodecOpen {
                codec: format!("encoder for stream {}", stream),
                reason: err.to_string(),
            }
        }
    }

    /// Map a demuxer failure at open time.
    pub(crate) fn probe(locator: impl fmt::Display, err: CoreError) -> Self {
        match err {
            CoreError::Io(e) => Self::open(locator, e),
            CoreError::Container(ContainerError::UnknownFormat) => {
                Self::open(locator, "no container format recognized")
            }
            other => Self::StreamInfo(format!("{}: {}", locator, other)),
        }
    }

    pub(crate) fn mux(err: impl fmt::Display) -> Self {
        Self::Mux(err.to_string())
    }
}
