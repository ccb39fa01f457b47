//! Audio sample buffer abstractions.
//!
//! Provides types for representing decoded audio samples in various formats.
//! Multi-byte samples are stored little-endian.

use crate::error::Error;
use crate::timestamp::{Duration, TimeBase, Timestamp};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sample format for audio data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Unsigned 8-bit.
    U8,
    /// Signed 16-bit.
    S16,
    /// Signed 32-bit.
    S32,
    /// 32-bit float.
    F32,
    /// Signed 16-bit planar.
    S16p,
    /// 32-bit float planar.
    F32p,
}

impl SampleFormat {
    /// All formats, in the order encoders usually advertise them.
    pub const ALL: [SampleFormat; 6] = [
        Self::S16,
        Self::F32,
        Self::S32,
        Self::U8,
        Self::S16p,
        Self::F32p,
    ];

    /// Get the number of bytes per sample.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 | Self::S16p => 2,
            Self::S32 | Self::F32 | Self::F32p => 4,
        }
    }

    /// Check if this is a planar format.
    pub fn is_planar(&self) -> bool {
        matches!(self, Self::S16p | Self::F32p)
    }

    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::F32 => "f32",
            Self::S16p => "s16p",
            Self::F32p => "f32p",
        }
    }

    /// Stable numeric identifier used in container headers.
    pub fn id(&self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::S16 => 1,
            Self::S32 => 2,
            Self::F32 => 3,
            Self::S16p => 4,
            Self::F32p => 5,
        }
    }

    /// Inverse of [`SampleFormat::id`].
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.id() == id)
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::unsupported(format!("sample format '{}'", s)))
    }
}

/// Channel layout for audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelLayout {
    /// Mono (1 channel).
    Mono,
    /// Stereo (2 channels: left, right).
    #[default]
    Stereo,
    /// 5.1 (6 channels: FL, FR, FC, LFE, BL, BR).
    Surround51,
    /// 7.1 (8 channels: FL, FR, FC, LFE, BL, BR, SL, SR).
    Surround71,
    /// Custom layout with specified channel count.
    Custom(u32),
}

impl ChannelLayout {
    /// Get the number of channels.
    pub fn channels(&self) -> u32 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::Surround51 => 6,
            Self::Surround71 => 8,
            Self::Custom(n) => *n,
        }
    }

    /// Create a layout from channel count.
    pub fn from_channels(channels: u32) -> Self {
        match channels {
            1 => Self::Mono,
            2 => Self::Stereo,
            6 => Self::Surround51,
            8 => Self::Surround71,
            n => Self::Custom(n),
        }
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mono => write!(f, "mono"),
            Self::Stereo => write!(f, "stereo"),
            Self::Surround51 => write!(f, "5.1"),
            Self::Surround71 => write!(f, "7.1"),
            Self::Custom(n) => write!(f, "{}ch", n),
        }
    }
}

/// A decoded audio sample buffer.
#[derive(Clone, PartialEq)]
pub struct Sample {
    buffer: SampleBuffer,
    /// Stream this buffer was decoded from.
    pub stream_index: u32,
    /// Presentation timestamp.
    pub pts: Timestamp,
    /// Duration of this sample buffer.
    pub duration: Duration,
}

impl Sample {
    /// Create a new silent sample buffer.
    pub fn new(
        num_samples: usize,
        format: SampleFormat,
        layout: ChannelLayout,
        sample_rate: u32,
    ) -> Self {
        Self::from_buffer(SampleBuffer::new(num_samples, format, layout, sample_rate))
    }

    /// Create from an existing buffer; the duration follows the sample count.
    pub fn from_buffer(buffer: SampleBuffer) -> Self {
        let duration = buffer.duration();
        Self {
            pts: Timestamp::new(Timestamp::NONE, duration.time_base),
            buffer,
            stream_index: 0,
            duration,
        }
    }

    /// Get the number of samples per channel.
    pub fn num_samples(&self) -> usize {
        self.buffer.num_samples
    }

    /// Get the sample format.
    pub fn format(&self) -> SampleFormat {
        self.buffer.format
    }

    /// Get the channel layout.
    pub fn channel_layout(&self) -> ChannelLayout {
        self.buffer.layout
    }

    /// Get the sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.buffer.sample_rate
    }

    /// Get the number of channels.
    pub fn channels(&self) -> u32 {
        self.buffer.layout.channels()
    }

    /// Get the underlying buffer.
    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Get a mutable reference to the buffer.
    pub fn buffer_mut(&mut self) -> &mut SampleBuffer {
        &mut self.buffer
    }
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("stream_index", &self.stream_index)
            .field("num_samples", &self.num_samples())
            .field("format", &self.format())
            .field("layout", &self.channel_layout())
            .field("sample_rate", &self.sample_rate())
            .field("pts", &self.pts)
            .finish()
    }
}

/// Buffer for storing audio sample data.
#[derive(Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    /// Number of samples per channel.
    pub num_samples: usize,
    /// Sample format.
    pub format: SampleFormat,
    /// Channel layout.
    pub layout: ChannelLayout,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Planar: one Vec per channel. Packed: a single interleaved Vec.
    data: Vec<Vec<u8>>,
}

impl SampleBuffer {
    /// Create a new silent sample buffer.
    pub fn new(
        num_samples: usize,
        format: SampleFormat,
        layout: ChannelLayout,
        sample_rate: u32,
    ) -> Self {
        let bytes_per_sample = format.bytes_per_sample();
        let channels = layout.channels() as usize;

        let data = if format.is_planar() {
            (0..channels)
                .map(|_| vec![0u8; num_samples * bytes_per_sample])
                .collect()
        } else {
            vec![vec![0u8; num_samples * channels * bytes_per_sample]]
        };

        let mut buffer = Self {
            num_samples,
            format,
            layout,
            sample_rate,
            data,
        };
        buffer.silence();
        buffer
    }

    /// Build a packed buffer from interleaved bytes.
    pub fn from_interleaved(
        format: SampleFormat,
        layout: ChannelLayout,
        sample_rate: u32,
        data: Vec<u8>,
    ) -> Option<Self> {
        let frame_bytes = format.bytes_per_sample() * layout.channels() as usize;
        if format.is_planar() || frame_bytes == 0 || data.len() % frame_bytes != 0 {
            return None;
        }
        Some(Self {
            num_samples: data.len() / frame_bytes,
            format,
            layout,
            sample_rate,
            data: vec![data],
        })
    }

    /// Get the duration of this buffer in a `1/sample_rate` time base.
    pub fn duration(&self) -> Duration {
        Duration::new(
            self.num_samples as i64,
            TimeBase::from_sample_rate(self.sample_rate.max(1)),
        )
    }

    /// Get the total size in bytes.
    pub fn size(&self) -> usize {
        self.data.iter().map(|d| d.len()).sum()
    }

    /// Get a channel's data (planar formats only).
    pub fn channel(&self, index: u32) -> Option<&[u8]> {
        if self.format.is_planar() {
            self.data.get(index as usize).map(|v| v.as_slice())
        } else {
            None
        }
    }

    /// Get interleaved data (packed formats), or the first channel.
    pub fn data(&self) -> &[u8] {
        &self.data[0]
    }

    /// Get mutable interleaved data (packed formats), or the first channel.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[0]
    }

    /// Mutable access to every plane (a single one for packed formats).
    pub fn planes_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.data.iter_mut().map(|d| d.as_mut_slice())
    }

    /// Read packed S16 samples.
    ///
    /// Returns `None` if the format is not S16.
    pub fn to_s16(&self) -> Option<Vec<i16>> {
        if self.format != SampleFormat::S16 {
            return None;
        }
        let bytes = &self.data[0];
        let mut out = vec![0i16; bytes.len() / 2];
        LittleEndian::read_i16_into(bytes, &mut out);
        Some(out)
    }

    /// Overwrite packed S16 samples.
    ///
    /// Returns `false` if the format is not S16 or the length differs.
    pub fn write_s16(&mut self, samples: &[i16]) -> bool {
        if self.format != SampleFormat::S16 || samples.len() * 2 != self.data[0].len() {
            return false;
        }
        LittleEndian::write_i16_into(samples, &mut self.data[0]);
        true
    }

    /// Fill all channels with silence.
    pub fn silence(&mut self) {
        let silence_value = match self.format {
            SampleFormat::U8 => 128,
            _ => 0,
        };
        for channel in &mut self.data {
            channel.fill(silence_value);
        }
    }
}

impl fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("num_samples", &self.num_samples)
            .field("format", &self.format)
            .field("layout", &self.layout)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}
