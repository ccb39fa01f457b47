//! Transcode configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use transcode_core::{MediaKind, PixelFormat, Rational, SampleFormat};

use crate::codec::{EncodeEffort, RateControl};
use crate::error::{PipelineError, Result};
use crate::filter::{FilterSpec, FilterStep};

/// Highest accepted CRF value.
pub const MAX_CRF: u8 = 63;

/// How a run is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One cooperative pull loop on the calling thread.
    #[default]
    Sequential,
    /// Demux+decode, filter+encode and mux on three threads.
    Threaded,
}

/// Immutable description of one transcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranscodeConfig {
    /// Video encoder name.
    pub video_codec: Option<String>,
    /// Constant quality for video; ignored when a bitrate is set.
    pub video_crf: Option<u8>,
    /// Video bitrate in bits per second.
    #[serde(with = "bitrate")]
    pub video_bitrate: Option<u64>,
    /// Audio encoder name.
    pub audio_codec: Option<String>,
    /// Audio bitrate in bits per second.
    #[serde(with = "bitrate")]
    pub audio_bitrate: Option<u64>,
    pub video_filters: FilterSpec,
    pub audio_filters: FilterSpec,
    /// Speed/quality trade-off, 0-8.
    pub effort: EncodeEffort,
    /// Encoder thread hint.
    pub threads: usize,
    /// Output container override; derived from the extension otherwise.
    pub container: Option<String>,
    pub video_decoder: Option<String>,
    pub audio_decoder: Option<String>,
    /// Output pixel format; negotiated with the encoder otherwise.
    #[serde(with = "parsed")]
    pub pixel_format: Option<PixelFormat>,
    /// Output sample format; negotiated with the encoder otherwise.
    #[serde(with = "parsed")]
    pub sample_format: Option<SampleFormat>,
    /// Output frame rate; appended to the video filters as `fps`.
    pub frame_rate: Option<Rational>,
    /// Maximum frames between video keyframes.
    pub keyframe_interval: Option<u32>,
    pub execution: ExecutionMode,
    /// Frames or packets buffered per stream between threads.
    pub queue_capacity: usize,
    /// Packets between progress reports; 0 disables them.
    pub progress_interval: u64,
    pub drop_audio: bool,
    pub drop_video: bool,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscodeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            video_codec: None,
            video_crf: None,
            video_bitrate: None,
            audio_codec: None,
            audio_bitrate: None,
            video_filters: FilterSpec::new(),
            audio_filters: FilterSpec::new(),
            effort: EncodeEffort::default(),
            threads: 1,
            container: None,
            video_decoder: None,
            audio_decoder: None,
            pixel_format: None,
            sample_format: None,
            frame_rate: None,
            keyframe_interval: None,
            execution: ExecutionMode::Sequential,
            queue_capacity: 8,
            progress_interval: 100,
            drop_audio: false,
            drop_video: false,
        }
    }

    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| PipelineError::Configuration(e.to_string()))
    }

    #[must_use]
    pub fn video_codec(mut self, name: impl Into<String>) -> Self {
        self.video_codec = Some(name.into());
        self
    }

    #[must_use]
    pub fn video_crf(mut self, crf: u8) -> Self {
        self.video_crf = Some(crf);
        self
    }

    #[must_use]
    pub fn video_bitrate(mut self, bitrate: u64) -> Self {
        self.video_bitrate = Some(bitrate);
        self
    }

    #[must_use]
    pub fn audio_codec(mut self, name: impl Into<String>) -> Self {
        self.audio_codec = Some(name.into());
        self
    }

    #[must_use]
    pub fn audio_bitrate(mut self, bitrate: u64) -> Self {
        self.audio_bitrate = Some(bitrate);
        self
    }

    #[must_use]
    pub fn video_filters(mut self, spec: FilterSpec) -> Self {
        self.video_filters = spec;
        self
    }

    #[must_use]
    pub fn audio_filters(mut self, spec: FilterSpec) -> Self {
        self.audio_filters = spec;
        self
    }

    #[must_use]
    pub fn effort(mut self, effort: EncodeEffort) -> Self {
        self.effort = effort;
        self
    }

    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container = Some(name.into());
        self
    }

    #[must_use]
    pub fn video_decoder(mut self, name: impl Into<String>) -> Self {
        self.video_decoder = Some(name.into());
        self
    }

    #[must_use]
    pub fn audio_decoder(mut self, name: impl Into<String>) -> Self {
        self.audio_decoder = Some(name.into());
        self
    }

    #[must_use]
    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = Some(format);
        self
    }

    #[must_use]
    pub fn sample_format(mut self, format: SampleFormat) -> Self {
        self.sample_format = Some(format);
        self
    }

    #[must_use]
    pub fn frame_rate(mut self, rate: Rational) -> Self {
        self.frame_rate = Some(rate);
        self
    }

    #[must_use]
    pub fn keyframe_interval(mut self, frames: u32) -> Self {
        self.keyframe_interval = Some(frames);
        self
    }

    #[must_use]
    pub fn execution(mut self, mode: ExecutionMode) -> Self {
        self.execution = mode;
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn progress_interval(mut self, packets: u64) -> Self {
        self.progress_interval = packets;
        self
    }

    #[must_use]
    pub fn drop_audio(mut self, drop: bool) -> Self {
        self.drop_audio = drop;
        self
    }

    #[must_use]
    pub fn drop_video(mut self, drop: bool) -> Self {
        self.drop_video = drop;
        self
    }

    /// Check every field once, before any resource is opened.
    ///
    /// Codec names are optional here: a missing encoder only fails
    /// configuration when a stream of that kind is selected.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(PipelineError::Configuration(msg));

        if self.drop_audio && self.drop_video {
            return fail("both audio and video are dropped".into());
        }
        check_name("video_codec", self.video_codec.as_deref())?;
        check_name("audio_codec", self.audio_codec.as_deref())?;
        check_name("video_decoder", self.video_decoder.as_deref())?;
        check_name("audio_decoder", self.audio_decoder.as_deref())?;
        check_name("container", self.container.as_deref())?;

        if let Some(crf) = self.video_crf {
            if crf > MAX_CRF {
                return fail(format!("video_crf {} outside 0-{}", crf, MAX_CRF));
            }
        }
        if self.video_bitrate == Some(0) {
            return fail("video_bitrate must be positive".into());
        }
        if self.audio_bitrate == Some(0) {
            return fail("audio_bitrate must be positive".into());
        }
        if self.effort.level() > EncodeEffort::MAX {
            return fail(format!(
                "effort {} outside 0-{}",
                self.effort,
                EncodeEffort::MAX
            ));
        }
        if self.threads == 0 {
            return fail("threads must be at least 1".into());
        }
        if self.queue_capacity == 0 {
            return fail("queue_capacity must be at least 1".into());
        }
        if let Some(rate) = self.frame_rate {
            if !rate.is_positive() {
                return fail(format!("frame_rate {} must be positive", rate));
            }
        }
        if self.keyframe_interval == Some(0) {
            return fail("keyframe_interval must be at least 1".into());
        }
        Ok(())
    }

    /// Whether streams of `kind` are transcoded.
    pub fn keeps(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => !self.drop_video,
            MediaKind::Audio => !self.drop_audio,
        }
    }

    /// Encoder name for streams of `kind`.
    pub fn encoder_name(&self, kind: MediaKind) -> Result<&str> {
        let name = match kind {
            MediaKind::Video => self.video_codec.as_deref(),
            MediaKind::Audio => self.audio_codec.as_deref(),
        };
        name.ok_or_else(|| PipelineError::Configuration(format!("no {} codec configured", kind)))
    }

    /// Decoder override for streams of `kind`.
    pub fn decoder_name(&self, kind: MediaKind) -> Option<&str> {
        match kind {
            MediaKind::Video => self.video_decoder.as_deref(),
            MediaKind::Audio => self.audio_decoder.as_deref(),
        }
    }

    /// Rate control for streams of `kind`. A bitrate wins over CRF.
    pub fn rate_control(&self, kind: MediaKind) -> RateControl {
        match kind {
            MediaKind::Video => RateControl::resolve(self.video_crf, self.video_bitrate),
            MediaKind::Audio => RateControl::resolve(None, self.audio_bitrate),
        }
    }

    /// Filter chain for streams of `kind`, including the frame rate override.
    pub fn filters(&self, kind: MediaKind) -> FilterSpec {
        match kind {
            MediaKind::Video => match self.frame_rate {
                Some(rate) => self.video_filters.clone().then(FilterStep::new("fps", [rate])),
                None => self.video_filters.clone(),
            },
            MediaKind::Audio => self.audio_filters.clone(),
        }
    }
}

fn check_name(field: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(name) if name.trim().is_empty() => Err(PipelineError::Configuration(format!(
            "{} must not be empty",
            field
        ))),
        _ => Ok(()),
    }
}

/// Parse a bitrate such as `"128000"`, `"1000k"` or `"1.5M"`.
pub fn parse_bitrate(text: &str) -> Result<u64> {
    let invalid = || PipelineError::Configuration(format!("invalid bitrate '{}'", text));
    let trimmed = text.trim();
    let (number, scale) = match trimmed.char_indices().last() {
        Some((i, 'k' | 'K')) => (&trimmed[..i], 1e3),
        Some((i, 'm' | 'M')) => (&trimmed[..i], 1e6),
        Some((i, 'g' | 'G')) => (&trimmed[..i], 1e9),
        Some(_) => (trimmed, 1.0),
        None => return Err(invalid()),
    };
    if let Ok(value) = number.parse::<u64>() {
        return value.checked_mul(scale as u64).ok_or_else(invalid);
    }
    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    let bits = (value * scale).round();
    if !bits.is_finite() || bits < 0.0 || bits > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bits as u64)
}

/// Bitrates as a number or a suffixed string.
mod bitrate {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Number(n)) => Ok(Some(n)),
            Some(Raw::Text(s)) => super::parse_bitrate(&s).map(Some).map_err(D::Error::custom),
        }
    }
}

/// Optional values stored as their display strings.
mod parsed {
    use super::{fmt, FromStr};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: fmt::Display,
        S: Serializer,
    {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: fmt::Display,
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| s.parse().map_err(D::Error::custom))
            .transpose()
    }
}
