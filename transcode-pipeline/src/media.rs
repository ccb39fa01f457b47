//! Decoded media units and their format descriptors.

use std::fmt;

use transcode_core::{
    AudioParams, ChannelLayout, Duration, Frame, MediaKind, PixelFormat, Rational, Sample,
    SampleFormat, StreamDescriptor, StreamParams, TimeBase, Timestamp, VideoParams,
};

/// A decoded unit of media travelling between decode, filter and encode.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaFrame {
    /// A video picture.
    Video(Frame),
    /// A buffer of audio samples.
    Audio(Sample),
}

impl MediaFrame {
    /// Kind of media carried.
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Video(_) => MediaKind::Video,
            Self::Audio(_) => MediaKind::Audio,
        }
    }

    /// Stream the unit belongs to.
    pub fn stream_index(&self) -> u32 {
        match self {
            Self::Video(f) => f.stream_index,
            Self::Audio(s) => s.stream_index,
        }
    }

    /// Re-tag the unit with a stream index.
    pub fn set_stream_index(&mut self, index: u32) {
        match self {
            Self::Video(f) => f.stream_index = index,
            Self::Audio(s) => s.stream_index = index,
        }
    }

    /// Presentation timestamp.
    pub fn pts(&self) -> Timestamp {
        match self {
            Self::Video(f) => f.pts,
            Self::Audio(s) => s.pts,
        }
    }

    /// Replace the presentation timestamp.
    pub fn set_pts(&mut self, pts: Timestamp) {
        match self {
            Self::Video(f) => f.pts = pts,
            Self::Audio(s) => s.pts = pts,
        }
    }

    /// Duration of the unit.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Video(f) => f.duration,
            Self::Audio(s) => s.duration,
        }
    }

    /// Replace the duration.
    pub fn set_duration(&mut self, duration: Duration) {
        match self {
            Self::Video(f) => f.duration = duration,
            Self::Audio(s) => s.duration = duration,
        }
    }

    /// Timestamp just past the end of the unit.
    pub fn end_ts(&self) -> Timestamp {
        self.pts() + self.duration()
    }

    /// Borrow the video frame, if this is one.
    pub fn as_video(&self) -> Option<&Frame> {
        match self {
            Self::Video(f) => Some(f),
            Self::Audio(_) => None,
        }
    }

    /// Borrow the audio samples, if this is one.
    pub fn as_audio(&self) -> Option<&Sample> {
        match self {
            Self::Audio(s) => Some(s),
            Self::Video(_) => None,
        }
    }
}

impl From<Frame> for MediaFrame {
    fn from(frame: Frame) -> Self {
        Self::Video(frame)
    }
}

impl From<Sample> for MediaFrame {
    fn from(sample: Sample) -> Self {
        Self::Audio(sample)
    }
}

/// Format of the video frames flowing through a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub sample_aspect_ratio: Rational,
    pub frame_rate: Rational,
    /// Time base of frame timestamps.
    pub time_base: TimeBase,
}

/// Format of the audio buffers flowing through a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
    /// Time base of buffer timestamps.
    pub time_base: TimeBase,
}

/// Format descriptor negotiated between adjacent stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl FrameFormat {
    /// The format a decoder for `stream` produces.
    pub fn from_stream(stream: &StreamDescriptor) -> Self {
        match stream.params {
            StreamParams::Video(v) => Self::Video(VideoFormat {
                width: v.width,
                height: v.height,
                pixel_format: v.pixel_format,
                sample_aspect_ratio: v.sample_aspect_ratio,
                frame_rate: v.frame_rate,
                time_base: stream.time_base,
            }),
            StreamParams::Audio(a) => Self::Audio(AudioFormat {
                sample_rate: a.sample_rate,
                channel_layout: a.channel_layout,
                sample_format: a.sample_format,
                time_base: stream.time_base,
            }),
        }
    }

    /// Kind of media described.
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Video(_) => MediaKind::Video,
            Self::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn video(&self) -> Option<&VideoFormat> {
        match self {
            Self::Video(v) => Some(v),
            Self::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioFormat> {
        match self {
            Self::Audio(a) => Some(a),
            Self::Video(_) => None,
        }
    }

    /// Time base of frame timestamps.
    pub fn time_base(&self) -> TimeBase {
        match self {
            Self::Video(v) => v.time_base,
            Self::Audio(a) => a.time_base,
        }
    }

    /// Stream parameters equivalent to this format.
    pub fn to_params(&self) -> StreamParams {
        match *self {
            Self::Video(v) => StreamParams::Video(VideoParams {
                width: v.width,
                height: v.height,
                pixel_format: v.pixel_format,
                sample_aspect_ratio: v.sample_aspect_ratio,
                frame_rate: v.frame_rate,
            }),
            Self::Audio(a) => StreamParams::Audio(AudioParams {
                sample_rate: a.sample_rate,
                channel_layout: a.channel_layout,
                sample_format: a.sample_format,
            }),
        }
    }

    /// Names of the attributes that are unset or out of range.
    pub fn invalid_attributes(&self) -> Vec<&'static str> {
        let mut invalid = Vec::new();
        if !self.time_base().is_valid() {
            invalid.push("time_base");
        }
        match self {
            Self::Video(v) => {
                if v.width == 0 {
                    invalid.push("width");
                }
                if v.height == 0 {
                    invalid.push("height");
                }
                if !v.frame_rate.is_positive() {
                    invalid.push("frame_rate");
                }
                if !v.sample_aspect_ratio.is_positive() {
                    invalid.push("sample_aspect_ratio");
                }
            }
            Self::Audio(a) => {
                if a.sample_rate == 0 {
                    invalid.push("sample_rate");
                }
                if a.channel_layout.channels() == 0 {
                    invalid.push("channel_layout");
                }
            }
        }
        invalid
    }

    /// Check that `frame` has this format's geometry or sampling.
    pub fn check(&self, frame: &MediaFrame) -> std::result::Result<(), String> {
        match (self, frame) {
            (Self::Video(v), MediaFrame::Video(f)) => {
                if f.width() != v.width || f.height() != v.height || f.format() != v.pixel_format
                {
                    return Err(format!(
                        "expected {}x{} {}, got {}x{} {}",
                        v.width,
                        v.height,
                        v.pixel_format,
                        f.width(),
                        f.height(),
                        f.format()
                    ));
                }
                Ok(())
            }
            (Self::Audio(a), MediaFrame::Audio(s)) => {
                if s.format() != a.sample_format
                    || s.sample_rate() != a.sample_rate
                    || s.channels() != a.channel_layout.channels()
                {
                    return Err(format!(
                        "expected {} Hz {} {}, got {} Hz {} {}",
                        a.sample_rate,
                        a.channel_layout,
                        a.sample_format,
                        s.sample_rate(),
                        s.channel_layout(),
                        s.format()
                    ));
                }
                Ok(())
            }
            _ => Err(format!("expected {} frame, got {}", self.kind(), frame.kind())),
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video(v) => write!(
                f,
                "{}x{} {} @ {} fps (tb {})",
                v.width, v.height, v.pixel_format, v.frame_rate, v.time_base
            ),
            Self::Audio(a) => write!(
                f,
                "{} Hz {} {} (tb {})",
                a.sample_rate, a.channel_layout, a.sample_format, a.time_base
            ),
        }
    }
}
