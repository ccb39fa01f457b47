use tracing::debug;
use transcode_core::{PixelFormat, SampleFormat};

use super::{Drain, PullSource};
use crate::codec::EncoderFactory;
use crate::error::{PipelineError, Result};
use crate::filter::{can_convert, FilterGraph, FilterSpec, FilterStep};
use crate::media::{FrameFormat, MediaFrame};
use crate::pull::Pull;

/// Runs the filter graph of one stream.
#[derive(Debug)]
pub struct FilterStage {
    stream_index: u32,
    graph: FilterGraph,
    flushed: bool,
    finished: bool,
}

impl FilterStage {
    /// Compile `spec` for frames of `input` format.
    pub fn configure(stream_index: u32, spec: &FilterSpec, input: FrameFormat) -> Result<Self> {
        Ok(Self {
            stream_index,
            graph: FilterGraph::new(stream_index, spec, input)?,
            flushed: false,
            finished: false,
        })
    }

    /// Settle the graph's output format against what `encoder` accepts.
    ///
    /// The graph output is kept when the encoder takes it. Otherwise the
    /// preferred format, or the encoder's first reachable format, is
    /// selected and a conversion node appended. Returns the final format.
    pub fn negotiate(
        &mut self,
        encoder: &dyn EncoderFactory,
        pixel_format: Option<PixelFormat>,
        sample_format: Option<SampleFormat>,
    ) -> Result<FrameFormat> {
        let rejected = |reason: String| PipelineError::CodecOpen {
            codec: encoder.name().to_string(),
            reason,
        };
        match self.graph.output_format() {
            FrameFormat::Video(v) => {
                let supported = encoder.pixel_formats();
                let current = v.pixel_format;
                let target = match pixel_format {
                    Some(p) if !supported.is_empty() && !supported.contains(&p) => {
                        return Err(rejected(format!("pixel format {} not supported", p)))
                    }
                    Some(p) => p,
                    None if supported.is_empty() || supported.contains(&current) => current,
                    None => supported
                        .iter()
                        .copied()
                        .find(|&p| can_convert(current, p))
                        .ok_or_else(|| {
                            rejected(format!("no supported pixel format reachable from {}", current))
                        })?,
                };
                if target != current {
                    if !can_convert(current, target) {
                        return Err(rejected(format!(
                            "cannot convert {} to {}",
                            current, target
                        )));
                    }
                    debug!(
                        "Stream {}: converting {} to {} for {}",
                        self.stream_index,
                        current,
                        target,
                        encoder.name()
                    );
                    self.graph.append(&FilterStep::new("format", [target]))?;
                }
            }
            FrameFormat::Audio(a) => {
                let supported = encoder.sample_formats();
                let current = a.sample_format;
                let target = match sample_format {
                    Some(s) if !supported.is_empty() && !supported.contains(&s) => {
                        return Err(rejected(format!("sample format {} not supported", s)))
                    }
                    Some(s) => s,
                    None if supported.is_empty() || supported.contains(&current) => current,
                    None => supported[0],
                };
                if target != current {
                    debug!(
                        "Stream {}: converting {} to {} for {}",
                        self.stream_index,
                        current,
                        target,
                        encoder.name()
                    );
                    self.graph.append(&FilterStep::new("aformat", [target]))?;
                }
            }
        }
        Ok(self.graph.output_format())
    }

    pub fn stream_index(&self) -> u32 {
        self.stream_index
    }

    /// Format of the frames pulled out of the stage.
    pub fn output_format(&self) -> FrameFormat {
        self.graph.output_format()
    }

    pub fn graph(&self) -> &FilterGraph {
        &self.graph
    }

    /// Push one frame.
    pub fn submit(&mut self, frame: MediaFrame) -> Result<()> {
        self.graph.push(frame)
    }

    /// Frames filtered so far.
    pub fn frames(&mut self) -> Drain<'_, Self> {
        Drain::new(self)
    }

    /// Signal end of input and drain the graph.
    pub fn flush(&mut self) -> Drain<'_, Self> {
        if !self.flushed {
            self.flushed = true;
            self.graph.push_eof();
        }
        Drain::new(self)
    }

    /// Frames dropped by rate conversion or rejected while flushing.
    pub fn dropped(&self) -> u64 {
        self.graph.discarded() + self.graph.rejected_on_flush()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl PullSource for FilterStage {
    type Item = MediaFrame;

    fn pull_next(&mut self) -> Result<Pull<MediaFrame>> {
        let next = self.graph.pull();
        if next.is_finished() {
            self.finished = true;
        }
        Ok(next)
    }
}
