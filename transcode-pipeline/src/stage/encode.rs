use tracing::debug;
use transcode_core::{CodecId, Packet, StreamDescriptor, StreamParams, TimeBase};

use super::{Drain, PullSource};
use crate::codec::{Encoder, EncoderFactory, EncoderParams};
use crate::error::{PipelineError, Result};
use crate::media::MediaFrame;
use crate::pull::Pull;

/// Encodes the frames of one output stream.
pub struct EncodeStage {
    stream_index: u32,
    codec: CodecId,
    encoder: Box<dyn Encoder>,
    params: EncoderParams,
    flushed: bool,
    finished: bool,
}

impl EncodeStage {
    /// Open an encoder from `factory` with `params`.
    pub fn open(factory: &dyn EncoderFactory, params: EncoderParams) -> Result<Self> {
        if factory.codec().kind() != params.format.kind() {
            return Err(PipelineError::CodecOpen {
                codec: factory.name().to_string(),
                reason: format!(
                    "{} encoder cannot take {} frames",
                    factory.codec().kind(),
                    params.format.kind()
                ),
            });
        }
        let encoder = factory
            .create(&params)
            .map_err(|e| PipelineError::codec_open(factory.name(), e))?;
        debug!(
            "Stream {}: opened encoder {} ({}, {:?}, effort {})",
            params.stream_index,
            encoder.name(),
            params.format,
            params.rate_control,
            params.effort
        );
        Ok(Self {
            stream_index: params.stream_index,
            codec: factory.codec(),
            encoder,
            params,
            flushed: false,
            finished: false,
        })
    }

    pub fn stream_index(&self) -> u32 {
        self.stream_index
    }

    /// Time base of produced packets.
    pub fn time_base(&self) -> TimeBase {
        self.encoder.time_base()
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    /// Descriptor of the stream this encoder produces.
    pub fn output_stream(&self) -> StreamDescriptor {
        let params: StreamParams = self.params.format.to_params();
        StreamDescriptor {
            index: self.stream_index,
            codec: self.codec,
            time_base: self.encoder.time_base(),
            params,
            bit_rate: self.params.rate_control.bitrate(),
            start_time: None,
            duration: None,
            extra_data: self.encoder.extra_data(),
        }
    }

    /// Submit one frame.
    ///
    /// A frame the encoder rejects fails with a recoverable
    /// [`PipelineError::Encode`].
    pub fn submit(&mut self, frame: MediaFrame) -> Result<()> {
        if self.flushed {
            return Err(PipelineError::Encode {
                stream: self.stream_index,
                reason: "frame submitted after flush".into(),
            });
        }
        self.encoder
            .send_frame(frame)
            .map_err(|e| PipelineError::encode(self.stream_index, e))
    }

    /// Packets encoded so far.
    pub fn packets(&mut self) -> Drain<'_, Self> {
        Drain::new(self)
    }

    /// Signal end of input and drain everything the encoder buffered.
    pub fn flush(&mut self) -> Result<Drain<'_, Self>> {
        if !self.flushed {
            self.flushed = true;
            self.encoder
                .send_eof()
                .map_err(|e| PipelineError::encode(self.stream_index, e))?;
        }
        Ok(Drain::new(self))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl PullSource for EncodeStage {
    type Item = Packet;

    fn pull_next(&mut self) -> Result<Pull<Packet>> {
        if self.finished {
            return Ok(Pull::Finished);
        }
        match self.encoder.receive_packet() {
            Ok(Pull::Value(packet)) => Ok(Pull::Value(packet.with_stream_index(self.stream_index))),
            Ok(Pull::NotReady) if self.flushed => {
                self.finished = true;
                Ok(Pull::Finished)
            }
            Ok(Pull::NotReady) => Ok(Pull::NotReady),
            Ok(Pull::Finished) => {
                self.finished = true;
                Ok(Pull::Finished)
            }
            Err(e) => Err(PipelineError::encode(self.stream_index, e)),
        }
    }
}

impl std::fmt::Debug for EncodeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeStage")
            .field("stream_index", &self.stream_index)
            .field("encoder", &self.encoder.name())
            .field("params", &self.params)
            .field("flushed", &self.flushed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PcmEncoderFactory, RateControl, RawVideoEncoderFactory, PCM_FRAME_SAMPLES};
    use crate::error::ErrorKind;
    use crate::media::{AudioFormat, FrameFormat, VideoFormat};
    use transcode_core::{
        ChannelLayout, Frame, PixelFormat, Rational, Sample, SampleFormat, Timestamp,
    };

    fn video_format() -> FrameFormat {
        FrameFormat::Video(VideoFormat {
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Gray8,
            sample_aspect_ratio: Rational::from_int(1),
            frame_rate: Rational::from_int(30),
            time_base: TimeBase::new(1, 90000),
        })
    }

    fn audio_format() -> FrameFormat {
        FrameFormat::Audio(AudioFormat {
            sample_rate: 48000,
            channel_layout: ChannelLayout::Mono,
            sample_format: SampleFormat::S16,
            time_base: TimeBase::new(1, 48000),
        })
    }

    #[test]
    fn test_output_stream_descriptor() {
        let params = EncoderParams::new(0, video_format())
            .with_rate_control(RateControl::resolve(Some(20), Some(800_000)));
        let stage = EncodeStage::open(&RawVideoEncoderFactory, params).unwrap();
        let stream = stage.output_stream();
        assert_eq!(stream.time_base, TimeBase::new(1, 30));
        assert_eq!(stream.bit_rate, Some(800_000));
        assert_eq!(stream.video_params().map(|v| v.width), Some(2));
        assert!(stream.missing_parameters().is_empty());
    }

    #[test]
    fn test_encode_rescales_to_encoder_time_base() {
        let params = EncoderParams::new(3, video_format());
        let mut stage = EncodeStage::open(&RawVideoEncoderFactory, params).unwrap();
        let mut frame = Frame::new(2, 2, PixelFormat::Gray8, TimeBase::new(1, 90000));
        frame.pts = Timestamp::new(6000, TimeBase::new(1, 90000));
        stage.submit(frame.into()).unwrap();
        let packets: Vec<Packet> = stage.packets().collect::<Result<_>>().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].stream_index, 3);
        assert_eq!(packets[0].pts.value, 2);
    }

    #[test]
    fn test_flush_emits_buffered_audio() {
        let params = EncoderParams::new(1, audio_format());
        let mut stage = EncodeStage::open(&PcmEncoderFactory, params).unwrap();
        let mut sample = Sample::new(PCM_FRAME_SAMPLES + 10, SampleFormat::S16, ChannelLayout::Mono, 48000);
        sample.pts = Timestamp::new(0, TimeBase::new(1, 48000));
        stage.submit(sample.into()).unwrap();
        assert_eq!(stage.packets().count(), 1);
        assert_eq!(stage.flush().unwrap().count(), 1);
        assert!(stage.is_finished());
        assert_eq!(stage.submit(audio_frame()).unwrap_err().kind(), ErrorKind::Encode);
    }

    fn audio_frame() -> MediaFrame {
        Sample::new(4, SampleFormat::S16, ChannelLayout::Mono, 48000).into()
    }

    #[test]
    fn test_kind_mismatch() {
        let err = EncodeStage::open(&PcmEncoderFactory, EncoderParams::new(0, video_format()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecOpen);
    }
}
