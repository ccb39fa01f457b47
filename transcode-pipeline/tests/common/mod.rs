//! Shared fixtures: synthetic inputs, mock demuxer, muxer and codecs.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use transcode_core::{
    AudioCodec, AudioParams, ChannelLayout, CodecError, CodecId, Duration, Error, Packet, PacketFlags,
    PixelFormat, Rational, SampleFormat, StreamDescriptor, TimeBase, Timestamp, VideoCodec,
    VideoParams,
};
use transcode_pipeline::{
    Decoder, DecoderFactory, Demuxer, MediaFrame, Muxer, Pull, Registry,
};
use transcode_pipeline::codec::RawVideoDecoderFactory;

pub const WIDTH: u32 = 32;
pub const HEIGHT: u32 = 16;
pub const SAMPLE_RATE: u32 = 48_000;
/// Samples per channel in each synthetic audio packet.
pub const AUDIO_CHUNK: usize = 960;

pub fn video_stream(index: u32, width: u32, height: u32, fps: Rational) -> StreamDescriptor {
    StreamDescriptor::video(
        index,
        CodecId::Video(VideoCodec::Raw),
        TimeBase::new(1, 90_000),
        VideoParams {
            width,
            height,
            pixel_format: PixelFormat::Gray8,
            sample_aspect_ratio: Rational::from_int(1),
            frame_rate: fps,
        },
    )
}

pub fn audio_stream(index: u32) -> StreamDescriptor {
    StreamDescriptor::audio(
        index,
        CodecId::Audio(AudioCodec::PcmS16le),
        TimeBase::new(1, SAMPLE_RATE as i64),
        AudioParams {
            sample_rate: SAMPLE_RATE,
            channel_layout: ChannelLayout::Stereo,
            sample_format: SampleFormat::S16,
        },
    )
}

/// `count` raw frames, each filled with its own index.
pub fn video_packets(stream: &StreamDescriptor, count: usize) -> Vec<Packet> {
    let params = stream.video_params().copied().expect("video stream");
    let size = params.pixel_format.frame_size(params.width, params.height);
    let tb = stream.time_base;
    let ticks = TimeBase::from_rate(params.frame_rate).convert_rounded(1, tb);
    (0..count)
        .map(|i| {
            let pts = Timestamp::new(i as i64 * ticks, tb);
            Packet::new(vec![(i % 251) as u8; size])
                .with_timestamps(pts, pts)
                .with_duration(Duration::new(ticks, tb))
                .with_stream_index(stream.index)
                .with_flags(PacketFlags::KEYFRAME)
        })
        .collect()
}

/// `count` stereo PCM packets of [`AUDIO_CHUNK`] samples.
pub fn audio_packets(stream: &StreamDescriptor, count: usize) -> Vec<Packet> {
    let tb = stream.time_base;
    (0..count)
        .map(|i| {
            let data: Vec<u8> = (0..AUDIO_CHUNK * 2)
                .flat_map(|s| (((s + i) % 200) as i16 * 100).to_le_bytes())
                .collect();
            let pts = Timestamp::new((i * AUDIO_CHUNK) as i64, tb);
            Packet::new(data)
                .with_timestamps(pts, pts)
                .with_duration(Duration::new(AUDIO_CHUNK as i64, tb))
                .with_stream_index(stream.index)
                .with_flags(PacketFlags::KEYFRAME)
        })
        .collect()
}

/// Merge per-stream packet lists into file order.
pub fn interleave(lists: Vec<Vec<Packet>>) -> Vec<Packet> {
    let mut all: Vec<Packet> = lists.into_iter().flatten().collect();
    all.sort_by_key(|p| (p.pts.to_micros().unwrap_or(i64::MIN), p.stream_index));
    all
}

/// Demuxer serving a fixed packet list.
pub struct MockDemuxer {
    pub streams: Vec<StreamDescriptor>,
    pub packets: VecDeque<Packet>,
    /// Fail with an I/O error after this many packets.
    pub fail_after: Option<usize>,
    read: usize,
}

impl MockDemuxer {
    pub fn new(streams: Vec<StreamDescriptor>, packets: Vec<Packet>) -> Self {
        Self {
            streams,
            packets: packets.into(),
            fail_after: None,
            read: 0,
        }
    }

    /// One 25 fps video stream and one 48 kHz stereo audio stream.
    pub fn av(frames: usize, audio: usize) -> Self {
        let video = video_stream(0, WIDTH, HEIGHT, Rational::from_int(25));
        let sound = audio_stream(1);
        let packets = interleave(vec![
            video_packets(&video, frames),
            audio_packets(&sound, audio),
        ]);
        Self::new(vec![video, sound], packets)
    }
}

impl Demuxer for MockDemuxer {
    fn format_name(&self) -> &str {
        "mock"
    }

    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn read_packet(&mut self) -> transcode_core::Result<Option<Packet>> {
        if self.fail_after == Some(self.read) {
            return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "device gone")));
        }
        self.read += 1;
        Ok(self.packets.pop_front())
    }
}

/// What a [`MockMuxer`] was asked to do.
#[derive(Default)]
pub struct MuxRecord {
    pub streams: Vec<StreamDescriptor>,
    pub header: bool,
    pub packets: Vec<Packet>,
    pub trailer: bool,
}

impl MuxRecord {
    pub fn packets_of(&self, stream: u32) -> Vec<&Packet> {
        self.packets
            .iter()
            .filter(|p| p.stream_index == stream)
            .collect()
    }
}

/// Muxer recording every call into a shared [`MuxRecord`].
pub struct MockMuxer {
    record: Arc<Mutex<MuxRecord>>,
    /// Fail writes after this many packets.
    pub fail_after: Option<usize>,
}

impl MockMuxer {
    pub fn new() -> (Self, Arc<Mutex<MuxRecord>>) {
        let record = Arc::new(Mutex::new(MuxRecord::default()));
        (
            Self {
                record: record.clone(),
                fail_after: None,
            },
            record,
        )
    }
}

impl Muxer for MockMuxer {
    fn format_name(&self) -> &str {
        "mock"
    }

    fn add_stream(&mut self, stream: &StreamDescriptor) -> transcode_core::Result<TimeBase> {
        self.record.lock().unwrap().streams.push(stream.clone());
        Ok(stream.time_base)
    }

    fn write_header(&mut self) -> transcode_core::Result<()> {
        self.record.lock().unwrap().header = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: &Packet) -> transcode_core::Result<()> {
        let mut record = self.record.lock().unwrap();
        if self.fail_after == Some(record.packets.len()) {
            return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
        }
        record.packets.push(packet.clone());
        Ok(())
    }

    fn write_trailer(&mut self) -> transcode_core::Result<()> {
        self.record.lock().unwrap().trailer = true;
        Ok(())
    }
}

/// Raw video decoder that holds back `delay` frames until flushed.
pub struct DelayedDecoderFactory {
    pub delay: usize,
}

impl DecoderFactory for DelayedDecoderFactory {
    fn name(&self) -> &str {
        "delayed"
    }

    fn codec(&self) -> CodecId {
        CodecId::Video(VideoCodec::Raw)
    }

    fn create(&self, stream: &StreamDescriptor) -> transcode_core::Result<Box<dyn Decoder>> {
        Ok(Box::new(DelayedDecoder {
            inner: RawVideoDecoderFactory.create(stream)?,
            held: VecDeque::new(),
            delay: self.delay,
            eof: false,
        }))
    }
}

struct DelayedDecoder {
    inner: Box<dyn Decoder>,
    held: VecDeque<MediaFrame>,
    delay: usize,
    eof: bool,
}

impl Decoder for DelayedDecoder {
    fn name(&self) -> &str {
        "delayed"
    }

    fn send_packet(&mut self, packet: Packet) -> transcode_core::Result<()> {
        self.inner.send_packet(packet)
    }

    fn send_eof(&mut self) -> transcode_core::Result<()> {
        self.eof = true;
        self.inner.send_eof()
    }

    fn receive_frame(&mut self) -> transcode_core::Result<Pull<MediaFrame>> {
        while let Pull::Value(frame) = self.inner.receive_frame()? {
            self.held.push_back(frame);
        }
        if self.held.len() > self.delay || (self.eof && !self.held.is_empty()) {
            return Ok(self.held.pop_front().map_or(Pull::NotReady, Pull::Value));
        }
        Ok(if self.eof { Pull::Finished } else { Pull::NotReady })
    }
}

/// Raw video decoder that accepts packets but never decodes one.
pub struct StuckDecoderFactory;

impl DecoderFactory for StuckDecoderFactory {
    fn name(&self) -> &str {
        "stuck"
    }

    fn codec(&self) -> CodecId {
        CodecId::Video(VideoCodec::Raw)
    }

    fn create(&self, _stream: &StreamDescriptor) -> transcode_core::Result<Box<dyn Decoder>> {
        Ok(Box::new(StuckDecoder { receives: 0 }))
    }
}

struct StuckDecoder {
    receives: usize,
}

impl Decoder for StuckDecoder {
    fn name(&self) -> &str {
        "stuck"
    }

    fn send_packet(&mut self, _packet: Packet) -> transcode_core::Result<()> {
        Ok(())
    }

    fn send_eof(&mut self) -> transcode_core::Result<()> {
        Ok(())
    }

    fn receive_frame(&mut self) -> transcode_core::Result<Pull<MediaFrame>> {
        self.receives += 1;
        // Bound the damage if the caller never gives up.
        if self.receives > 10_000 {
            return Ok(Pull::Finished);
        }
        Err(CodecError::MalformedPayload("corrupt bitstream".into()).into())
    }
}

pub fn registry() -> Arc<Registry> {
    Arc::new(Registry::builtin())
}

/// Built-in registry where raw video decodes through [`DelayedDecoderFactory`].
pub fn delayed_registry(delay: usize) -> Arc<Registry> {
    let mut registry = Registry::builtin();
    registry
        .codecs
        .register_decoder(Arc::new(DelayedDecoderFactory { delay }));
    Arc::new(registry)
}

/// Built-in registry that also offers the `stuck` raw video decoder.
pub fn stuck_registry() -> Arc<Registry> {
    let mut registry = Registry::builtin();
    registry
        .codecs
        .register_decoder(Arc::new(StuckDecoderFactory));
    Arc::new(registry)
}
