//! Stream kinds and codec identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Video stream.
    Video,
    /// Audio stream.
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Video codec type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VideoCodec {
    /// Raw video (uncompressed planes).
    Raw,
    /// H.264 / AVC.
    H264,
    /// H.265 / HEVC.
    H265,
    /// VP8.
    Vp8,
    /// VP9.
    Vp9,
    /// AV1.
    Av1,
}

/// Audio codec type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AudioCodec {
    /// Signed 16-bit little-endian PCM.
    PcmS16le,
    /// AAC (Advanced Audio Coding).
    Aac,
    /// MP3 (MPEG Layer 3).
    Mp3,
    /// Opus.
    Opus,
    /// Vorbis.
    Vorbis,
    /// FLAC (Free Lossless Audio Codec).
    Flac,
}

/// Identifier of an elementary stream's coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    /// A video coding.
    Video(VideoCodec),
    /// An audio coding.
    Audio(AudioCodec),
}

impl CodecId {
    /// Every known coding.
    pub const ALL: [CodecId; 12] = [
        Self::Video(VideoCodec::Raw),
        Self::Video(VideoCodec::H264),
        Self::Video(VideoCodec::H265),
        Self::Video(VideoCodec::Vp8),
        Self::Video(VideoCodec::Vp9),
        Self::Video(VideoCodec::Av1),
        Self::Audio(AudioCodec::PcmS16le),
        Self::Audio(AudioCodec::Aac),
        Self::Audio(AudioCodec::Mp3),
        Self::Audio(AudioCodec::Opus),
        Self::Audio(AudioCodec::Vorbis),
        Self::Audio(AudioCodec::Flac),
    ];

    /// Kind of media this coding carries.
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Video(_) => MediaKind::Video,
            Self::Audio(_) => MediaKind::Audio,
        }
    }

    /// Canonical short name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Video(VideoCodec::Raw) => "rawvideo",
            Self::Video(VideoCodec::H264) => "h264",
            Self::Video(VideoCodec::H265) => "hevc",
            Self::Video(VideoCodec::Vp8) => "vp8",
            Self::Video(VideoCodec::Vp9) => "vp9",
            Self::Video(VideoCodec::Av1) => "av1",
            Self::Audio(AudioCodec::PcmS16le) => "pcm_s16le",
            Self::Audio(AudioCodec::Aac) => "aac",
            Self::Audio(AudioCodec::Mp3) => "mp3",
            Self::Audio(AudioCodec::Opus) => "opus",
            Self::Audio(AudioCodec::Vorbis) => "vorbis",
            Self::Audio(AudioCodec::Flac) => "flac",
        }
    }

    /// Look a coding up by canonical name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_names_roundtrip() {
        for codec in CodecId::ALL {
            assert_eq!(CodecId::from_name(codec.name()), Some(codec));
        }
        assert_eq!(CodecId::Audio(AudioCodec::Opus).kind(), MediaKind::Audio);
    }
}
