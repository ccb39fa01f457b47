//! Linear filter graph: one source, a chain of nodes, one sink.

use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, warn};

use super::audio::{ANull, Resample, Volume};
use super::video::{Convert, Crop, Null, Rate, Scale};
use super::{FilterNode, FilterSpec, FilterStep};
use crate::error::{PipelineError, Result};
use crate::media::{FrameFormat, MediaFrame};
use crate::pull::Pull;

const VIDEO_OPS: [&str; 7] = ["scale", "crop", "fps", "rate", "framerate", "format", "null"];
const AUDIO_OPS: [&str; 3] = ["volume", "aformat", "anull"];

fn build_node(step: &FilterStep, format: &FrameFormat) -> Result<Box<dyn FilterNode>> {
    let node: Box<dyn FilterNode> = match (step.name.as_str(), format) {
        ("scale", FrameFormat::Video(v)) => Box::new(Scale::from_step(step, v)?),
        ("crop", FrameFormat::Video(v)) => Box::new(Crop::from_step(step, v)?),
        ("fps" | "rate" | "framerate", FrameFormat::Video(v)) => {
            Box::new(Rate::from_step(step, v)?)
        }
        ("format", FrameFormat::Video(v)) => Box::new(Convert::from_step(step, v)?),
        ("null", FrameFormat::Video(v)) => Box::new(Null::new(v)),
        ("volume", FrameFormat::Audio(a)) => Box::new(Volume::from_step(step, a)?),
        ("aformat", FrameFormat::Audio(a)) => Box::new(Resample::from_step(step, a)?),
        ("anull", FrameFormat::Audio(a)) => Box::new(ANull::new(a)),
        (name, FrameFormat::Audio(_)) if VIDEO_OPS.contains(&name) => {
            return Err(PipelineError::FilterGraph(format!(
                "'{}' is a video filter but the stream is audio",
                name
            )))
        }
        (name, FrameFormat::Video(_)) if AUDIO_OPS.contains(&name) => {
            return Err(PipelineError::FilterGraph(format!(
                "'{}' is an audio filter but the stream is video",
                name
            )))
        }
        (name, _) => {
            return Err(PipelineError::FilterGraph(format!(
                "unknown filter '{}'",
                name
            )))
        }
    };
    Ok(node)
}

/// A configured chain of filter nodes for one stream.
///
/// Frames are pushed in and pulled out; a single push may yield zero or
/// more output frames. An empty chain passes frames through unchanged.
pub struct FilterGraph {
    stream_index: u32,
    input: FrameFormat,
    nodes: Vec<Box<dyn FilterNode>>,
    pending: VecDeque<MediaFrame>,
    rejected: u64,
    eof: bool,
}

impl FilterGraph {
    /// Build the graph described by `spec` for frames of `input` format.
    pub fn new(stream_index: u32, spec: &FilterSpec, input: FrameFormat) -> Result<Self> {
        let invalid = input.invalid_attributes();
        if !invalid.is_empty() {
            return Err(PipelineError::FilterGraph(format!(
                "stream {} input format has invalid {}",
                stream_index,
                invalid.join(", ")
            )));
        }
        let mut graph = Self {
            stream_index,
            input,
            nodes: Vec::new(),
            pending: VecDeque::new(),
            rejected: 0,
            eof: false,
        };
        for step in spec.steps() {
            graph.append(step)?;
        }
        debug!("Stream {} filter graph: {}", stream_index, graph);
        Ok(graph)
    }

    /// Append one operation after the current sink.
    pub fn append(&mut self, step: &FilterStep) -> Result<()> {
        if self.eof {
            return Err(PipelineError::FilterGraph(
                "cannot extend a flushed filter graph".into(),
            ));
        }
        let node = build_node(step, &self.output_format())?;
        self.nodes.push(node);
        Ok(())
    }

    /// Format frames must have when pushed.
    pub fn input_format(&self) -> &FrameFormat {
        &self.input
    }

    /// Format of the frames pulled from the sink.
    pub fn output_format(&self) -> FrameFormat {
        self.nodes
            .last()
            .map(|n| n.output_format())
            .unwrap_or(self.input)
    }

    /// Whether frames pass through untouched.
    pub fn is_identity(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Push one frame through the chain.
    ///
    /// A frame that does not match the input format, or that a node
    /// rejects, fails with a recoverable error and leaves the graph usable.
    pub fn push(&mut self, frame: MediaFrame) -> Result<()> {
        if self.eof {
            return Err(PipelineError::FilterGraph(format!(
                "stream {}: frame pushed after end of input",
                self.stream_index
            )));
        }
        self.input
            .check(&frame)
            .map_err(|reason| PipelineError::FilterFrame {
                stream: self.stream_index,
                reason,
            })?;

        let mut frames = vec![frame];
        for node in &mut self.nodes {
            let mut next = Vec::with_capacity(frames.len());
            for frame in frames {
                node.process(frame, &mut next)
                    .map_err(|reason| PipelineError::FilterFrame {
                        stream: self.stream_index,
                        reason: format!("{}: {}", node.name(), reason),
                    })?;
            }
            frames = next;
        }
        self.pending.extend(frames);
        Ok(())
    }

    /// Signal end of input and flush every node in order.
    pub fn push_eof(&mut self) {
        if self.eof {
            return;
        }
        let mut carry = Vec::new();
        for node in &mut self.nodes {
            let mut next = Vec::with_capacity(carry.len());
            for frame in carry {
                if let Err(reason) = node.process(frame, &mut next) {
                    warn!(
                        "Stream {}: {} rejected a frame while flushing: {}",
                        self.stream_index,
                        node.name(),
                        reason
                    );
                    self.rejected += 1;
                }
            }
            node.flush(&mut next);
            carry = next;
        }
        self.pending.extend(carry);
        self.eof = true;
    }

    /// Pull the next output frame.
    pub fn pull(&mut self) -> Pull<MediaFrame> {
        match self.pending.pop_front() {
            Some(frame) => Pull::Value(frame),
            None if self.eof => Pull::Finished,
            None => Pull::NotReady,
        }
    }

    /// Frames the nodes deliberately discarded.
    pub fn discarded(&self) -> u64 {
        self.nodes.iter().map(|n| n.discarded()).sum()
    }

    /// Frames rejected while flushing.
    pub fn rejected_on_flush(&self) -> u64 {
        self.rejected
    }
}

impl fmt::Display for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.input)?;
        for node in &self.nodes {
            write!(f, " -> {}", node.name())?;
        }
        write!(f, " -> [{}]", self.output_format())
    }
}

impl fmt::Debug for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterGraph")
            .field("stream_index", &self.stream_index)
            .field("graph", &self.to_string())
            .field("pending", &self.pending.len())
            .field("eof", &self.eof)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::media::{AudioFormat, VideoFormat};
    use transcode_core::{
        ChannelLayout, Duration, Frame, PixelFormat, Rational, SampleFormat, TimeBase, Timestamp,
    };

    fn hd_format() -> FrameFormat {
        FrameFormat::Video(VideoFormat {
            width: 1920,
            height: 1080,
            pixel_format: PixelFormat::Yuv420p,
            sample_aspect_ratio: Rational::from_int(1),
            frame_rate: Rational::from_int(30),
            time_base: TimeBase::new(1, 30),
        })
    }

    fn small_format() -> FrameFormat {
        FrameFormat::Video(VideoFormat {
            width: 8,
            height: 8,
            pixel_format: PixelFormat::Gray8,
            sample_aspect_ratio: Rational::from_int(1),
            frame_rate: Rational::from_int(30),
            time_base: TimeBase::new(1, 30),
        })
    }

    fn audio_format() -> FrameFormat {
        FrameFormat::Audio(AudioFormat {
            sample_rate: 48000,
            channel_layout: ChannelLayout::Stereo,
            sample_format: SampleFormat::S16,
            time_base: TimeBase::new(1, 48000),
        })
    }

    fn small_frame(pts: i64) -> MediaFrame {
        let tb = TimeBase::new(1, 30);
        let mut frame = Frame::new(8, 8, PixelFormat::Gray8, tb);
        frame.pts = Timestamp::new(pts, tb);
        frame.duration = Duration::new(1, tb);
        MediaFrame::Video(frame)
    }

    #[test]
    fn test_vertical_reframe_output_format() {
        let spec = FilterSpec::parse("scale=1080:-1, crop=1080:1920, fps=29").unwrap();
        let graph = FilterGraph::new(0, &spec, hd_format()).unwrap();
        let out = graph.output_format();
        let video = out.video().unwrap();
        assert_eq!((video.width, video.height), (1080, 1920));
        assert_eq!(video.frame_rate, Rational::from_int(29));
        assert_eq!(video.time_base, TimeBase::new(1, 29));
        assert_eq!(video.pixel_format, PixelFormat::Yuv420p);
    }

    #[test]
    fn test_configuration_errors() {
        let unknown = FilterSpec::parse("blur=5").unwrap();
        let err = FilterGraph::new(0, &unknown, hd_format()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FilterGraph);

        let wrong_kind = FilterSpec::parse("scale=2:2").unwrap();
        assert!(FilterGraph::new(1, &wrong_kind, audio_format()).is_err());
        let wrong_kind = FilterSpec::parse("volume=2").unwrap();
        assert!(FilterGraph::new(0, &wrong_kind, hd_format()).is_err());

        let mut broken = hd_format();
        if let FrameFormat::Video(v) = &mut broken {
            v.width = 0;
        }
        let err = FilterGraph::new(0, &FilterSpec::new(), broken).unwrap_err();
        assert!(err.to_string().contains("width"));
    }

    #[test]
    fn test_identity_graph_passes_through() {
        let mut graph = FilterGraph::new(0, &FilterSpec::new(), small_format()).unwrap();
        assert!(graph.is_identity());
        assert_eq!(graph.pull(), Pull::NotReady);
        graph.push(small_frame(0)).unwrap();
        graph.push(small_frame(1)).unwrap();
        assert_eq!(graph.pull().value().map(|f| f.pts().value), Some(0));
        assert_eq!(graph.pull().value().map(|f| f.pts().value), Some(1));
        assert_eq!(graph.pull(), Pull::NotReady);
        graph.push_eof();
        assert_eq!(graph.pull(), Pull::Finished);
        assert_eq!(graph.push(small_frame(2)).unwrap_err().kind(), ErrorKind::FilterGraph);
    }

    #[test]
    fn test_mismatched_frame_is_recoverable() {
        let spec = FilterSpec::parse("scale=4:4").unwrap();
        let mut graph = FilterGraph::new(3, &spec, small_format()).unwrap();
        let tb = TimeBase::new(1, 30);
        let wrong = MediaFrame::Video(Frame::new(16, 16, PixelFormat::Gray8, tb));
        let err = graph.push(wrong).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err, PipelineError::FilterFrame {
            stream: 3,
            reason: "expected 8x8 gray8, got 16x16 gray8".into()
        });

        graph.push(small_frame(0)).unwrap();
        let frame = graph.pull().value().unwrap();
        assert_eq!(frame.as_video().unwrap().width(), 4);
    }

    #[test]
    fn test_rate_holds_frames_until_flush() {
        let spec = FilterSpec::new().rate(Rational::from_int(15));
        let mut graph = FilterGraph::new(0, &spec, small_format()).unwrap();
        graph.push(small_frame(0)).unwrap();
        assert_eq!(graph.pull(), Pull::NotReady);
        graph.push(small_frame(1)).unwrap();
        assert!(graph.pull().value().is_some());
        graph.push(small_frame(2)).unwrap();
        graph.push_eof();
        let mut rest = 0;
        while let Pull::Value(_) = graph.pull() {
            rest += 1;
        }
        assert_eq!(rest, 1);
        assert_eq!(graph.discarded(), 1);
        assert_eq!(graph.pull(), Pull::Finished);
    }

    #[test]
    fn test_append_format_conversion() {
        let mut graph = FilterGraph::new(0, &FilterSpec::new(), small_format()).unwrap();
        graph
            .append(&FilterStep::new("format", [PixelFormat::Yuv420p]))
            .unwrap();
        assert_eq!(
            graph.output_format().video().map(|v| v.pixel_format),
            Some(PixelFormat::Yuv420p)
        );
        assert!(graph.to_string().contains("format"));
    }
}
