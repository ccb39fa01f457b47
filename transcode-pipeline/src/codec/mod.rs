//! Codec abstractions and the codec registry.
//!
//! Decoders and encoders are pull-based: input is submitted with
//! `send_*`, output is drained with `receive_*` until it reports
//! [`Pull::NotReady`]. Signalling end of input makes the codec emit
//! whatever it buffered, followed by [`Pull::Finished`].

mod pcm;
mod raw;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use transcode_core::{CodecId, Packet, PixelFormat, SampleFormat, StreamDescriptor, TimeBase};

use crate::error::{PipelineError, Result};
use crate::media::{FrameFormat, MediaFrame};
use crate::pull::Pull;

pub use pcm::{PcmDecoderFactory, PcmEncoderFactory, PCM_FRAME_SAMPLES};
pub use raw::{RawVideoDecoderFactory, RawVideoEncoderFactory};

/// A decoder turning packets of one stream into frames.
pub trait Decoder: Send {
    /// Decoder name.
    fn name(&self) -> &str;

    /// Submit one packet. Ownership moves into the decoder.
    fn send_packet(&mut self, packet: Packet) -> transcode_core::Result<()>;

    /// Signal end of input.
    fn send_eof(&mut self) -> transcode_core::Result<()>;

    /// Pull the next decoded frame.
    fn receive_frame(&mut self) -> transcode_core::Result<Pull<MediaFrame>>;

    /// Format of the frames produced, when it differs from what the
    /// stream descriptor advertises.
    fn output_format(&self) -> Option<FrameFormat> {
        None
    }
}

/// An encoder turning frames into packets of one stream.
pub trait Encoder: Send {
    /// Encoder name.
    fn name(&self) -> &str;

    /// Time base of the packets this encoder produces.
    fn time_base(&self) -> TimeBase;

    /// Submit one frame. Ownership moves into the encoder.
    fn send_frame(&mut self, frame: MediaFrame) -> transcode_core::Result<()>;

    /// Signal end of input.
    fn send_eof(&mut self) -> transcode_core::Result<()>;

    /// Pull the next encoded packet.
    fn receive_packet(&mut self) -> transcode_core::Result<Pull<Packet>>;

    /// Codec-specific extra data for the output stream.
    fn extra_data(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Creates decoders for one coding.
pub trait DecoderFactory: Send + Sync {
    /// Name used to select this decoder explicitly.
    fn name(&self) -> &str;

    /// Coding this decoder understands.
    fn codec(&self) -> CodecId;

    /// Open a decoder for `stream`.
    fn create(&self, stream: &StreamDescriptor) -> transcode_core::Result<Box<dyn Decoder>>;
}

/// Creates encoders for one coding.
pub trait EncoderFactory: Send + Sync {
    /// Name used to select this encoder.
    fn name(&self) -> &str;

    /// Coding this encoder produces.
    fn codec(&self) -> CodecId;

    /// Pixel formats accepted, in order of preference.
    fn pixel_formats(&self) -> &[PixelFormat] {
        &[]
    }

    /// Sample formats accepted, in order of preference.
    fn sample_formats(&self) -> &[SampleFormat] {
        &[]
    }

    /// Open an encoder.
    fn create(&self, params: &EncoderParams) -> transcode_core::Result<Box<dyn Encoder>>;
}

/// How an encoder spends bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateControl {
    /// Codec default.
    #[default]
    Default,
    /// Constant quality; lower is better.
    Crf(u8),
    /// Target average bitrate in bits per second.
    Bitrate(u64),
}

impl RateControl {
    /// Resolve the configured knobs. An explicit bitrate wins over CRF.
    pub fn resolve(crf: Option<u8>, bitrate: Option<u64>) -> Self {
        match (bitrate, crf) {
            (Some(b), _) => Self::Bitrate(b),
            (None, Some(q)) => Self::Crf(q),
            (None, None) => Self::Default,
        }
    }

    /// Target bitrate, if one was set.
    pub fn bitrate(&self) -> Option<u64> {
        match self {
            Self::Bitrate(b) => Some(*b),
            _ => None,
        }
    }
}

/// Speed/quality trade-off hint, 0 (slowest) to 8 (fastest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodeEffort(u8);

impl EncodeEffort {
    /// Fastest setting.
    pub const MAX: u8 = 8;

    /// Create an effort hint, rejecting out-of-range values.
    pub fn new(level: u8) -> Option<Self> {
        (level <= Self::MAX).then_some(Self(level))
    }

    /// Fastest setting, suited to live use.
    pub fn realtime() -> Self {
        Self(Self::MAX)
    }

    /// Slowest, best-compressing setting.
    pub fn best() -> Self {
        Self(0)
    }

    pub fn level(&self) -> u8 {
        self.0
    }
}

impl Default for EncodeEffort {
    fn default() -> Self {
        Self(4)
    }
}

impl fmt::Display for EncodeEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters an encoder is opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    /// Output stream index the encoder feeds.
    pub stream_index: u32,
    /// Negotiated input format.
    pub format: FrameFormat,
    /// Time base of produced packets.
    pub time_base: TimeBase,
    pub rate_control: RateControl,
    pub effort: EncodeEffort,
    /// Worker thread hint; 0 lets the encoder decide.
    pub threads: usize,
    /// Maximum distance between keyframes, in frames.
    pub keyframe_interval: Option<u32>,
}

impl EncoderParams {
    /// Parameters for encoding `format`, using its natural time base.
    pub fn new(stream_index: u32, format: FrameFormat) -> Self {
        let time_base = match &format {
            FrameFormat::Video(v) if v.frame_rate.is_positive() => {
                TimeBase::from_rate(v.frame_rate)
            }
            FrameFormat::Video(v) => v.time_base,
            FrameFormat::Audio(a) => TimeBase::from_sample_rate(a.sample_rate.max(1)),
        };
        Self {
            stream_index,
            format,
            time_base,
            rate_control: RateControl::Default,
            effort: EncodeEffort::default(),
            threads: 0,
            keyframe_interval: None,
        }
    }

    pub fn with_rate_control(mut self, rate_control: RateControl) -> Self {
        self.rate_control = rate_control;
        self
    }

    pub fn with_effort(mut self, effort: EncodeEffort) -> Self {
        self.effort = effort;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_keyframe_interval(mut self, interval: Option<u32>) -> Self {
        self.keyframe_interval = interval;
        self
    }
}

/// Registry of decoder and encoder factories.
#[derive(Default, Clone)]
pub struct CodecRegistry {
    decoders: Vec<Arc<dyn DecoderFactory>>,
    encoders: Vec<Arc<dyn EncoderFactory>>,
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in codecs.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_decoder(Arc::new(RawVideoDecoderFactory));
        registry.register_decoder(Arc::new(PcmDecoderFactory));
        registry.register_encoder(Arc::new(RawVideoEncoderFactory));
        registry.register_encoder(Arc::new(PcmEncoderFactory));
        registry
    }

    /// Register a decoder. Later registrations take precedence.
    pub fn register_decoder(&mut self, factory: Arc<dyn DecoderFactory>) {
        self.decoders.insert(0, factory);
    }

    /// Register an encoder. Later registrations take precedence.
    pub fn register_encoder(&mut self, factory: Arc<dyn EncoderFactory>) {
        self.encoders.insert(0, factory);
    }

    /// Find a decoder for a coding.
    pub fn find_decoder(&self, codec: CodecId) -> Result<Arc<dyn DecoderFactory>> {
        self.decoders
            .iter()
            .find(|f| f.codec() == codec)
            .cloned()
            .ok_or_else(|| PipelineError::CodecNotFound(format!("no decoder for {}", codec)))
    }

    /// Find a decoder by name.
    pub fn find_decoder_by_name(&self, name: &str) -> Result<Arc<dyn DecoderFactory>> {
        self.decoders
            .iter()
            .find(|f| f.name() == name)
            .cloned()
            .ok_or_else(|| PipelineError::CodecNotFound(format!("decoder '{}'", name)))
    }

    /// Find an encoder by name.
    pub fn find_encoder(&self, name: &str) -> Result<Arc<dyn EncoderFactory>> {
        self.encoders
            .iter()
            .find(|f| f.name() == name)
            .cloned()
            .ok_or_else(|| PipelineError::CodecNotFound(format!("encoder '{}'", name)))
    }

    /// Names of the registered encoders.
    pub fn encoder_names(&self) -> Vec<&str> {
        self.encoders.iter().map(|f| f.name()).collect()
    }

    /// Names of the registered decoders.
    pub fn decoder_names(&self) -> Vec<&str> {
        self.decoders.iter().map(|f| f.name()).collect()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("decoders", &self.decoder_names())
            .field("encoders", &self.encoder_names())
            .finish()
    }
}
