//! # Transcode Core
//!
//! Core media types shared by every stage of the transcode pipeline:
//! - Error types for codec and container collaborators
//! - Rational numbers, time bases and timestamps
//! - Compressed packets and decoded video frames / audio samples
//! - Codec, container and stream descriptions

pub mod error;
pub mod format;
pub mod frame;
pub mod packet;
pub mod rational;
pub mod sample;
pub mod stream;
pub mod timestamp;

pub use error::{CodecError, ContainerError, Error, Result};
pub use format::{AudioCodec, CodecId, MediaKind, VideoCodec};
pub use frame::{Frame, FrameBuffer, FrameFlags, PixelFormat};
pub use packet::{Packet, PacketFlags};
pub use rational::Rational;
pub use sample::{ChannelLayout, Sample, SampleBuffer, SampleFormat};
pub use stream::{AudioParams, StreamDescriptor, StreamParams, VideoParams};
pub use timestamp::{Duration, TimeBase, Timestamp};
