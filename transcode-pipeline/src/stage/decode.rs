use tracing::{debug, warn};
use transcode_core::{Packet, StreamDescriptor};

use super::{Drain, PullSource};
use crate::codec::{CodecRegistry, Decoder};
use crate::error::{PipelineError, Result};
use crate::media::{FrameFormat, MediaFrame};
use crate::pull::Pull;

/// Decodes the packets of one input stream.
pub struct DecodeStage {
    stream: StreamDescriptor,
    decoder: Box<dyn Decoder>,
    output: FrameFormat,
    flushed: bool,
    finished: bool,
}

impl DecodeStage {
    /// Open a decoder for `stream`, by explicit name or by the stream's codec.
    pub fn open(
        stream: &StreamDescriptor,
        codecs: &CodecRegistry,
        decoder_name: Option<&str>,
    ) -> Result<Self> {
        let factory = match decoder_name {
            Some(name) => {
                let factory = codecs.find_decoder_by_name(name)?;
                if factory.codec() != stream.codec {
                    return Err(PipelineError::CodecOpen {
                        codec: name.to_string(),
                        reason: format!(
                            "decodes {}, stream {} is {}",
                            factory.codec(),
                            stream.index,
                            stream.codec
                        ),
                    });
                }
                factory
            }
            None => codecs.find_decoder(stream.codec)?,
        };
        let decoder = factory
            .create(stream)
            .map_err(|e| PipelineError::codec_open(factory.name(), e))?;
        let output = decoder
            .output_format()
            .unwrap_or_else(|| FrameFormat::from_stream(stream));
        debug!(
            "Stream {}: opened decoder {} producing {}",
            stream.index,
            decoder.name(),
            output
        );
        Ok(Self::new(stream.clone(), decoder, output))
    }

    /// Wrap an already opened decoder.
    pub fn new(stream: StreamDescriptor, decoder: Box<dyn Decoder>, output: FrameFormat) -> Self {
        Self {
            stream,
            decoder,
            output,
            flushed: false,
            finished: false,
        }
    }

    /// The input stream being decoded.
    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    /// Format of the decoded frames.
    pub fn output_format(&self) -> &FrameFormat {
        &self.output
    }

    /// Submit one packet; ownership moves to the decoder.
    ///
    /// A malformed packet fails with a recoverable [`PipelineError::Decode`].
    pub fn submit(&mut self, packet: Packet) -> Result<()> {
        if self.flushed {
            return Err(PipelineError::Decode {
                stream: self.stream.index,
                reason: "packet submitted after flush".into(),
            });
        }
        self.decoder
            .send_packet(packet)
            .map_err(|e| PipelineError::decode(self.stream.index, e))
    }

    /// Frames decoded so far.
    pub fn frames(&mut self) -> Drain<'_, Self> {
        Drain::new(self)
    }

    /// Signal end of input and drain everything the decoder buffered.
    pub fn flush(&mut self) -> Result<Drain<'_, Self>> {
        if !self.flushed {
            self.flushed = true;
            self.decoder
                .send_eof()
                .map_err(|e| PipelineError::decode(self.stream.index, e))?;
        }
        Ok(Drain::new(self))
    }

    /// Whether the decoder has been flushed and fully drained.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl PullSource for DecodeStage {
    type Item = MediaFrame;

    fn pull_next(&mut self) -> Result<Pull<MediaFrame>> {
        if self.finished {
            return Ok(Pull::Finished);
        }
        match self.decoder.receive_frame() {
            Ok(Pull::Value(mut frame)) => {
                frame.set_stream_index(self.stream.index);
                Ok(Pull::Value(frame))
            }
            Ok(Pull::NotReady) if self.flushed => {
                warn!(
                    "Stream {}: decoder {} stalled after end of input",
                    self.stream.index,
                    self.decoder.name()
                );
                self.finished = true;
                Ok(Pull::Finished)
            }
            Ok(Pull::NotReady) => Ok(Pull::NotReady),
            Ok(Pull::Finished) => {
                self.finished = true;
                Ok(Pull::Finished)
            }
            Err(e) => Err(PipelineError::decode(self.stream.index, e)),
        }
    }
}

impl std::fmt::Debug for DecodeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeStage")
            .field("stream", &self.stream.index)
            .field("decoder", &self.decoder.name())
            .field("flushed", &self.flushed)
            .field("finished", &self.finished)
            .finish()
    }
}
