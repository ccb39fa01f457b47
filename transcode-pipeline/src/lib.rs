//! Transcode pipeline orchestration.
//!
//! Drives one input through demux, decode, filter, encode and mux:
//! stage setup and format negotiation, the pull loop with drain
//! semantics, timestamp rebasing and interleaving, cancellation, and an
//! optional three-thread executor.
//!
//! ```no_run
//! use transcode_pipeline::{runtime, transcode, FilterSpec, TranscodeConfig};
//!
//! let registry = runtime::init()?;
//! let config = TranscodeConfig::new()
//!     .video_codec("rawvideo")
//!     .audio_codec("pcm_s16le")
//!     .video_filters(FilterSpec::parse("scale=1080:-1, crop=1080:1920, fps=29")?);
//! let report = transcode(registry, "input.tps", "output.tps", config)?;
//! println!("{:?}", report.outcome);
//! # Ok::<(), transcode_pipeline::PipelineError>(())
//! ```

mod cancel;
pub mod codec;
mod config;
pub mod container;
mod demux;
mod error;
pub mod filter;
mod lane;
mod media;
mod mux;
mod pipeline;
mod pull;
mod report;
pub mod runtime;
pub mod stage;
mod sync;
mod threaded;

pub use cancel::CancellationToken;
pub use codec::{
    CodecRegistry, Decoder, DecoderFactory, EncodeEffort, Encoder, EncoderFactory, EncoderParams,
    RateControl,
};
pub use config::{parse_bitrate, ExecutionMode, TranscodeConfig, MAX_CRF};
pub use container::{ContainerRegistry, InputFormat, OutputFormat};
pub use demux::{DemuxSource, Demuxer};
pub use error::{ErrorKind, PipelineError, Result};
pub use filter::{FilterGraph, FilterSpec, FilterStep};
pub use media::{AudioFormat, FrameFormat, MediaFrame, VideoFormat};
pub use mux::{MuxSink, Muxer, StreamHandle};
pub use pipeline::{
    transcode, Pipeline, PipelineState, Progress, ProgressCallback, StreamSelector,
};
pub use pull::Pull;
pub use report::{Outcome, PipelineStats, StreamStats, TranscodeReport};
pub use runtime::Registry;
pub use sync::{Interleaver, TimestampGuard, TimestampRebaser};
