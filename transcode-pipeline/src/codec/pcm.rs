//! Signed 16-bit little-endian PCM.
//!
//! The encoder regroups incoming samples into fixed-size packets, so it
//! holds back a partial packet until more input or end of input arrives.
//! A hole in the input timeline ends the partial packet early so the
//! packets after it keep their source timestamps.

use std::collections::VecDeque;

use tracing::debug;
use transcode_core::{
    AudioCodec, ChannelLayout, CodecError, CodecId, Duration, Error, Packet, PacketFlags, Sample,
    SampleBuffer, SampleFormat, StreamDescriptor, TimeBase, Timestamp,
};

use super::{Decoder, DecoderFactory, Encoder, EncoderFactory, EncoderParams};
use crate::media::{AudioFormat, FrameFormat, MediaFrame};
use crate::pull::Pull;

const PCM: CodecId = CodecId::Audio(AudioCodec::PcmS16le);

/// Samples per channel in each encoded packet.
pub const PCM_FRAME_SAMPLES: usize = 1024;

/// Factory for the PCM decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcmDecoderFactory;

impl DecoderFactory for PcmDecoderFactory {
    fn name(&self) -> &str {
        "pcm_s16le"
    }

    fn codec(&self) -> CodecId {
        PCM
    }

    fn create(&self, stream: &StreamDescriptor) -> transcode_core::Result<Box<dyn Decoder>> {
        let params = stream
            .audio_params()
            .ok_or_else(|| Error::invalid_param("pcm_s16le needs an audio stream"))?;
        if params.sample_rate == 0 || params.channel_layout.channels() == 0 {
            return Err(CodecError::DecoderConfig("sample rate and channels are required".into()).into());
        }
        Ok(Box::new(PcmDecoder {
            layout: params.channel_layout,
            sample_rate: params.sample_rate,
            time_base: stream.time_base,
            stream_index: stream.index,
            queue: VecDeque::new(),
            eof: false,
        }))
    }
}

struct PcmDecoder {
    layout: ChannelLayout,
    sample_rate: u32,
    time_base: TimeBase,
    stream_index: u32,
    queue: VecDeque<MediaFrame>,
    eof: bool,
}

impl Decoder for PcmDecoder {
    fn name(&self) -> &str {
        "pcm_s16le"
    }

    fn send_packet(&mut self, packet: Packet) -> transcode_core::Result<()> {
        if self.eof {
            return Err(CodecError::AlreadyFlushed.into());
        }
        let pts = if packet.pts.is_valid() { packet.pts } else { packet.dts };
        let size = packet.size();
        let buffer = SampleBuffer::from_interleaved(
            SampleFormat::S16,
            self.layout,
            self.sample_rate,
            packet.into_data(),
        )
        .ok_or_else(|| {
            CodecError::MalformedPayload(format!(
                "{} bytes is not a whole number of {}-channel s16 samples",
                size,
                self.layout.channels()
            ))
        })?;

        let mut sample = Sample::from_buffer(buffer);
        sample.stream_index = self.stream_index;
        sample.pts = pts.rescale(self.time_base);
        sample.duration = sample.duration.rescale(self.time_base);
        self.queue.push_back(MediaFrame::Audio(sample));
        Ok(())
    }

    fn send_eof(&mut self) -> transcode_core::Result<()> {
        self.eof = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> transcode_core::Result<Pull<MediaFrame>> {
        Ok(match self.queue.pop_front() {
            Some(frame) => Pull::Value(frame),
            None if self.eof => Pull::Finished,
            None => Pull::NotReady,
        })
    }

    fn output_format(&self) -> Option<FrameFormat> {
        Some(FrameFormat::Audio(AudioFormat {
            sample_rate: self.sample_rate,
            channel_layout: self.layout,
            sample_format: SampleFormat::S16,
            time_base: self.time_base,
        }))
    }
}

/// Factory for the PCM encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcmEncoderFactory;

impl EncoderFactory for PcmEncoderFactory {
    fn name(&self) -> &str {
        "pcm_s16le"
    }

    fn codec(&self) -> CodecId {
        PCM
    }

    fn sample_formats(&self) -> &[SampleFormat] {
        &[SampleFormat::S16]
    }

    fn create(&self, params: &EncoderParams) -> transcode_core::Result<Box<dyn Encoder>> {
        let FrameFormat::Audio(format) = params.format else {
            return Err(CodecError::EncoderConfig("pcm_s16le encodes audio only".into()).into());
        };
        if format.sample_format != SampleFormat::S16 {
            return Err(CodecError::EncoderConfig(format!(
                "pcm_s16le cannot encode {}",
                format.sample_format
            ))
            .into());
        }
        if format.sample_rate == 0 || format.channel_layout.channels() == 0 {
            return Err(CodecError::EncoderConfig("sample rate and channels are required".into()).into());
        }
        Ok(Box::new(PcmEncoder {
            format,
            time_base: TimeBase::from_sample_rate(format.sample_rate),
            stream_index: params.stream_index,
            pending: Vec::new(),
            next_pts: None,
            queue: VecDeque::new(),
            eof: false,
        }))
    }
}

struct PcmEncoder {
    format: AudioFormat,
    time_base: TimeBase,
    stream_index: u32,
    pending: Vec<u8>,
    next_pts: Option<i64>,
    queue: VecDeque<Packet>,
    eof: bool,
}

impl PcmEncoder {
    fn frame_bytes(&self) -> usize {
        2 * self.format.channel_layout.channels() as usize
    }

    fn emit(&mut self, byte_len: usize) {
        let rest = self.pending.split_off(byte_len);
        let data = std::mem::replace(&mut self.pending, rest);
        let samples = (data.len() / self.frame_bytes()) as i64;
        let pts = self.next_pts.unwrap_or(0);
        self.next_pts = Some(pts + samples);

        let ts = Timestamp::new(pts, self.time_base);
        let packet = Packet::new(data)
            .with_timestamps(ts, ts)
            .with_duration(Duration::new(samples, self.time_base))
            .with_stream_index(self.stream_index)
            .with_flags(PacketFlags::KEYFRAME);
        self.queue.push_back(packet);
    }
}

impl Encoder for PcmEncoder {
    fn name(&self) -> &str {
        "pcm_s16le"
    }

    fn time_base(&self) -> TimeBase {
        self.time_base
    }

    fn send_frame(&mut self, frame: MediaFrame) -> transcode_core::Result<()> {
        if self.eof {
            return Err(CodecError::AlreadyFlushed.into());
        }
        let MediaFrame::Audio(sample) = frame else {
            return Err(CodecError::FormatMismatch("video frame sent to pcm_s16le".into()).into());
        };
        if sample.format() != SampleFormat::S16
            || sample.sample_rate() != self.format.sample_rate
            || sample.channels() != self.format.channel_layout.channels()
        {
            return Err(CodecError::FormatMismatch(format!(
                "negotiated {} Hz {} s16, got {} Hz {} {}",
                self.format.sample_rate,
                self.format.channel_layout,
                sample.sample_rate(),
                sample.channel_layout(),
                sample.format()
            ))
            .into());
        }

        let frame_pts = sample.pts.rescale(self.time_base).get();
        match (self.next_pts, frame_pts) {
            (None, _) => self.next_pts = frame_pts,
            (Some(next), Some(pts)) => {
                let expected = next + (self.pending.len() / self.frame_bytes()) as i64;
                let gap = pts - expected;
                // Jitter under half a frame stays contiguous.
                if gap * 2 > sample.num_samples() as i64 {
                    debug!(expected, pts, gap, "pcm_s16le: re-anchoring after input gap");
                    if !self.pending.is_empty() {
                        self.emit(self.pending.len());
                    }
                    self.next_pts = Some(pts);
                }
            }
            (Some(_), None) => {}
        }
        self.pending.extend_from_slice(sample.buffer().data());

        let packet_bytes = PCM_FRAME_SAMPLES * self.frame_bytes();
        while self.pending.len() >= packet_bytes {
            self.emit(packet_bytes);
        }
        Ok(())
    }

    fn send_eof(&mut self) -> transcode_core::Result<()> {
        if !self.eof && !self.pending.is_empty() {
            self.emit(self.pending.len());
        }
        self.eof = true;
        Ok(())
    }

    fn receive_packet(&mut self) -> transcode_core::Result<Pull<Packet>> {
        Ok(match self.queue.pop_front() {
            Some(packet) => Pull::Value(packet),
            None if self.eof => Pull::Finished,
            None => Pull::NotReady,
        })
    }
}
