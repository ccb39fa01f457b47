//! Uncompressed video: packets carry tightly packed planes.

use std::collections::VecDeque;

use tracing::debug;
use transcode_core::{
    CodecError, CodecId, Duration, Error, Frame, FrameBuffer, FrameFlags, Packet, PacketFlags,
    PixelFormat, Rational, StreamDescriptor, TimeBase, VideoCodec,
};

use super::{Decoder, DecoderFactory, Encoder, EncoderFactory, EncoderParams};
use crate::media::{FrameFormat, MediaFrame, VideoFormat};
use crate::pull::Pull;

const RAW: CodecId = CodecId::Video(VideoCodec::Raw);

/// Factory for the raw video decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawVideoDecoderFactory;

impl DecoderFactory for RawVideoDecoderFactory {
    fn name(&self) -> &str {
        "rawvideo"
    }

    fn codec(&self) -> CodecId {
        RAW
    }

    fn create(&self, stream: &StreamDescriptor) -> transcode_core::Result<Box<dyn Decoder>> {
        let params = stream
            .video_params()
            .ok_or_else(|| Error::invalid_param("rawvideo needs a video stream"))?;
        let frame_duration = if params.frame_rate.is_positive() {
            TimeBase::from_rate(params.frame_rate).convert_rounded(1, stream.time_base)
        } else {
            0
        };
        Ok(Box::new(RawVideoDecoder {
            width: params.width,
            height: params.height,
            pixel_format: params.pixel_format,
            sample_aspect_ratio: params.sample_aspect_ratio,
            time_base: stream.time_base,
            frame_duration,
            stream_index: stream.index,
            queue: VecDeque::new(),
            eof: false,
        }))
    }
}

struct RawVideoDecoder {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    sample_aspect_ratio: Rational,
    time_base: TimeBase,
    frame_duration: i64,
    stream_index: u32,
    queue: VecDeque<MediaFrame>,
    eof: bool,
}

impl Decoder for RawVideoDecoder {
    fn name(&self) -> &str {
        "rawvideo"
    }

    fn send_packet(&mut self, packet: Packet) -> transcode_core::Result<()> {
        if self.eof {
            return Err(CodecError::AlreadyFlushed.into());
        }
        let expected = self.pixel_format.frame_size(self.width, self.height);
        let buffer = FrameBuffer::from_bytes(self.width, self.height, self.pixel_format, packet.data())
            .ok_or_else(|| {
                CodecError::MalformedPayload(format!(
                    "expected {} bytes of {}, got {}",
                    expected,
                    self.pixel_format,
                    packet.size()
                ))
            })?;

        let mut frame = Frame::from_buffer(buffer, self.time_base);
        frame.stream_index = self.stream_index;
        let pts = if packet.pts.is_valid() { packet.pts } else { packet.dts };
        frame.pts = pts.rescale(self.time_base);
        frame.duration = if packet.duration.is_zero() {
            Duration::new(self.frame_duration, self.time_base)
        } else {
            packet.duration.rescale(self.time_base)
        };
        frame.sample_aspect_ratio = self.sample_aspect_ratio;
        if packet.is_keyframe() {
            frame.flags |= FrameFlags::KEYFRAME;
        }
        self.queue.push_back(MediaFrame::Video(frame));
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
}

/// Factory for the raw video encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawVideoEncoderFactory;

impl EncoderFactory for RawVideoEncoderFactory {
    fn name(&self) -> &str {
        "rawvideo"
    }

    fn codec(&self) -> CodecId {
        RAW
    }

    fn pixel_formats(&self) -> &[PixelFormat] {
        &PixelFormat::ALL
    }

    fn create(&self, params: &EncoderParams) -> transcode_core::Result<Box<dyn Encoder>> {
        let FrameFormat::Video(format) = params.format else {
            return Err(CodecError::EncoderConfig("rawvideo encodes video only".into()).into());
        };
        if !params.time_base.is_valid() {
            return Err(CodecError::EncoderConfig("invalid time base".into()).into());
        }
        debug!(
            "Opening rawvideo encoder {}x{} {} (rate control {:?} and effort {} have no effect)",
            format.width, format.height, format.pixel_format, params.rate_control, params.effort
        );
        Ok(Box::new(RawVideoEncoder {
            format,
            time_base: params.time_base,
            stream_index: params.stream_index,
            keyframe_interval: params.keyframe_interval.filter(|&n| n > 0).map(i64::from),
            frames: 0,
            queue: VecDeque::new(),
            eof: false,
        }))
    }
}

struct RawVideoEncoder {
    format: VideoFormat,
    time_base: TimeBase,
    stream_index: u32,
    keyframe_interval: Option<i64>,
    frames: i64,
    queue: VecDeque<Packet>,
    eof: bool,
}

impl Encoder for RawVideoEncoder {
    fn name(&self) -> &str {
        "rawvideo"
    }

    fn time_base(&self) -> TimeBase {
        self.time_base
    }

    fn send_frame(&mut self, frame: MediaFrame) -> transcode_core::Result<()> {
        if self.eof {
            return Err(CodecError::AlreadyFlushed.into());
        }
        let MediaFrame::Video(frame) = frame else {
            return Err(CodecError::FormatMismatch("audio frame sent to rawvideo".into()).into());
        };
        if frame.width() != self.format.width
            || frame.height() != self.format.height
            || frame.format() != self.format.pixel_format
        {
            return Err(CodecError::FormatMismatch(format!(
                "negotiated {}x{} {}, got {}x{} {}",
                self.format.width,
                self.format.height,
                self.format.pixel_format,
                frame.width(),
                frame.height(),
                frame.format()
            ))
            .into());
        }

        let pts = frame.pts.rescale(self.time_base);
        let pts = if pts.is_valid() {
            pts
        } else {
            transcode_core::Timestamp::new(self.frames, self.time_base)
        };
        let duration = match frame.duration.rescale(self.time_base) {
            d if d.value > 0 => d,
            _ => Duration::new(1, self.time_base),
        };
        // Every frame is intra; the interval only controls which are flagged.
        let flags = match self.keyframe_interval {
            Some(n) if self.frames % n != 0 => PacketFlags::empty(),
            _ => PacketFlags::KEYFRAME,
        };
        self.frames += 1;

        let packet = Packet::new(frame.buffer().to_bytes())
            .with_timestamps(pts, pts)
            .with_duration(duration)
            .with_stream_index(self.stream_index)
            .with_flags(flags);
        self.queue.push_back(packet);
        Ok(())
    }

    fn send_eof(&mut self) -> transcode_core::Result<()> {
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
