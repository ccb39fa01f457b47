//! Elementary stream descriptions.

use crate::format::{CodecId, MediaKind};
use crate::frame::PixelFormat;
use crate::rational::Rational;
use crate::sample::{ChannelLayout, SampleFormat};
use crate::timestamp::TimeBase;

/// Geometry and timing of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoParams {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub pixel_format: PixelFormat,
    /// Sample (pixel) aspect ratio.
    pub sample_aspect_ratio: Rational,
    /// Frames per second.
    pub frame_rate: Rational,
}

/// Sampling parameters of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel layout.
    pub channel_layout: ChannelLayout,
    /// Sample format.
    pub sample_format: SampleFormat,
}

/// Kind-specific stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamParams {
    /// Video parameters.
    Video(VideoParams),
    /// Audio parameters.
    Audio(AudioParams),
}

/// Immutable description of one elementary stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    /// Index of the stream in its container.
    pub index: u32,
    /// Coding of the stream's packets.
    pub codec: CodecId,
    /// Time base of the stream's timestamps.
    pub time_base: TimeBase,
    /// Kind-specific parameters.
    pub params: StreamParams,
    /// Average bitrate in bits per second, if known.
    pub bit_rate: Option<u64>,
    /// First timestamp in `time_base` units, if known.
    pub start_time: Option<i64>,
    /// Duration in `time_base` units, if known.
    pub duration: Option<i64>,
    /// Codec-specific extra data.
    pub extra_data: Vec<u8>,
}

impl StreamDescriptor {
    /// Describe a video stream.
    pub fn video(index: u32, codec: CodecId, time_base: TimeBase, params: VideoParams) -> Self {
        Self {
            index,
            codec,
            time_base,
            params: StreamParams::Video(params),
            bit_rate: None,
            start_time: None,
            duration: None,
            extra_data: Vec::new(),
        }
    }

    /// Describe an audio stream.
    pub fn audio(index: u32, codec: CodecId, time_base: TimeBase, params: AudioParams) -> Self {
        Self {
            index,
            codec,
            time_base,
            params: StreamParams::Audio(params),
            bit_rate: None,
            start_time: None,
            duration: None,
            extra_data: Vec::new(),
        }
    }

    /// Kind of the stream.
    pub fn kind(&self) -> MediaKind {
        match self.params {
            StreamParams::Video(_) => MediaKind::Video,
            StreamParams::Audio(_) => MediaKind::Audio,
        }
    }

    /// Video parameters, if this is a video stream.
    pub fn video_params(&self) -> Option<&VideoParams> {
        match &self.params {
            StreamParams::Video(v) => Some(v),
            StreamParams::Audio(_) => None,
        }
    }

    /// Audio parameters, if this is an audio stream.
    pub fn audio_params(&self) -> Option<&AudioParams> {
        match &self.params {
            StreamParams::Audio(a) => Some(a),
            StreamParams::Video(_) => None,
        }
    }

    /// Duration in seconds, if known.
    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration.map(|d| self.time_base.to_seconds(d))
    }

    /// Start time in microseconds, if known.
    pub fn start_time_us(&self) -> Option<i64> {
        self.start_time
            .map(|t| self.time_base.convert_rounded(t, TimeBase::MICROSECONDS))
    }

    /// Builder: set the bitrate.
    pub fn with_bit_rate(mut self, bit_rate: u64) -> Self {
        self.bit_rate = Some(bit_rate);
        self
    }

    /// Builder: set start time and duration.
    pub fn with_timing(mut self, start_time: i64, duration: i64) -> Self {
        self.start_time = Some(start_time);
        self.duration = Some(duration);
        self
    }

    /// Check that the descriptor carries everything a muxer needs.
    pub fn missing_parameters(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.time_base.is_valid() {
            missing.push("time_base");
        }
        match &self.params {
            StreamParams::Video(v) => {
                if v.width == 0 {
                    missing.push("width");
                }
                if v.height == 0 {
                    missing.push("height");
                }
                if !v.frame_rate.is_positive() {
                    missing.push("frame_rate");
                }
            }
            StreamParams::Audio(a) => {
                if a.sample_rate == 0 {
                    missing.push("sample_rate");
                }
                if a.channel_layout.channels() == 0 {
                    missing.push("channel_layout");
                }
            }
        }
        missing
    }
}
