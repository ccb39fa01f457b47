//! Mux sink: validates the muxer contract and interleaves packets.

use std::fmt;
use std::path::Path;

use tracing::{debug, info, trace};
use transcode_core::{Packet, StreamDescriptor, TimeBase, Timestamp};

use crate::container::ContainerRegistry;
use crate::error::{PipelineError, Result};
use crate::sync::Interleaver;

/// A container writer.
pub trait Muxer: Send {
    /// Container format name.
    fn format_name(&self) -> &str;

    /// Register a stream; returns the time base packets must be written in.
    fn add_stream(&mut self, stream: &StreamDescriptor) -> transcode_core::Result<TimeBase>;

    fn write_header(&mut self) -> transcode_core::Result<()>;

    /// Write one packet, already in the stream's container time base.
    fn write_packet(&mut self, packet: &Packet) -> transcode_core::Result<()>;

    fn write_trailer(&mut self) -> transcode_core::Result<()>;
}

/// Handle to an output stream of a [`MuxSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(u32);

impl StreamHandle {
    /// Output stream index.
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Writing,
    Finished,
}

#[derive(Debug)]
struct OutputStream {
    descriptor: StreamDescriptor,
    container_time_base: TimeBase,
    packets: u64,
    bytes: u64,
    first: Option<Timestamp>,
    end: Option<Timestamp>,
}

/// Output side of a run.
pub struct MuxSink {
    locator: String,
    muxer: Box<dyn Muxer>,
    streams: Vec<OutputStream>,
    interleaver: Interleaver,
    phase: Phase,
}

impl MuxSink {
    /// Create `path`, choosing the container from `hint` or the extension.
    pub fn create(path: &Path, hint: Option<&str>, containers: &ContainerRegistry) -> Result<Self> {
        let muxer = containers.create_output(path, hint)?;
        Ok(Self::new(path.display().to_string(), muxer))
    }

    /// Wrap an already created muxer.
    pub fn new(locator: impl Into<String>, muxer: Box<dyn Muxer>) -> Self {
        Self {
            locator: locator.into(),
            muxer,
            streams: Vec::new(),
            interleaver: Interleaver::default(),
            phase: Phase::Setup,
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn format_name(&self) -> &str {
        self.muxer.format_name()
    }

    /// Add an output stream. Only allowed before the header.
    ///
    /// The descriptor's time base is the one packets arrive in; its index
    /// is replaced by the output position.
    pub fn add_stream(&mut self, mut descriptor: StreamDescriptor) -> Result<StreamHandle> {
        if self.phase != Phase::Setup {
            return Err(PipelineError::Mux(
                "streams cannot be added after the header".into(),
            ));
        }
        let index = self.streams.len() as u32;
        descriptor.index = index;
        let container_time_base = self
            .muxer
            .add_stream(&descriptor)
            .map_err(PipelineError::mux)?;
        debug!(
            "Output stream {}: {} in {}, container time base {}",
            index, descriptor.codec, descriptor.time_base, container_time_base
        );
        self.interleaver.add_stream(index);
        self.streams.push(OutputStream {
            descriptor,
            container_time_base,
            packets: 0,
            bytes: 0,
            first: None,
            end: None,
        });
        Ok(StreamHandle(index))
    }

    /// Write the container header.
    pub fn write_header(&mut self) -> Result<()> {
        if self.phase != Phase::Setup {
            return Err(PipelineError::Mux("header already written".into()));
        }
        if self.streams.is_empty() {
            return Err(PipelineError::Mux("no output streams".into()));
        }
        for stream in &self.streams {
            let missing = stream.descriptor.missing_parameters();
            if !missing.is_empty() {
                return Err(PipelineError::Mux(format!(
                    "stream {} is missing codec parameters: {}",
                    stream.descriptor.index,
                    missing.join(", ")
                )));
            }
        }
        self.muxer.write_header().map_err(PipelineError::mux)?;
        self.phase = Phase::Writing;
        info!(
            "Writing {} ({}, {} streams)",
            self.locator,
            self.muxer.format_name(),
            self.streams.len()
        );
        Ok(())
    }

    /// Queue a packet, rescaled to the container time base, and write
    /// whatever the interleaver releases.
    pub fn write_packet(&mut self, handle: StreamHandle, mut packet: Packet) -> Result<()> {
        match self.phase {
            Phase::Setup => {
                return Err(PipelineError::Mux(
                    "packet written before the header".into(),
                ))
            }
            Phase::Finished => {
                return Err(PipelineError::Mux(
                    "packet written after the trailer".into(),
                ))
            }
            Phase::Writing => {}
        }
        let stream = self
            .streams
            .get_mut(handle.0 as usize)
            .ok_or_else(|| PipelineError::Mux(format!("unknown stream {}", handle)))?;

        packet.stream_index = handle.0;
        packet.rescale(stream.container_time_base);
        stream.packets += 1;
        stream.bytes += packet.size() as u64;
        if packet.pts.is_valid() {
            let end = packet.pts + packet.duration;
            stream.first = Some(stream.first.map_or(packet.pts, |f| f.min(packet.pts)));
            stream.end = Some(stream.end.map_or(end, |e| e.max(end)));
        }
        trace!(stream = handle.0, pts = packet.pts.value, "queue packet");

        self.interleaver.push(packet);
        while let Some(ready) = self.interleaver.pop_ready() {
            self.muxer.write_packet(&ready).map_err(PipelineError::mux)?;
        }
        Ok(())
    }

    /// Mark a stream as finished so it stops holding the others back.
    pub fn end_stream(&mut self, handle: StreamHandle) -> Result<()> {
        self.interleaver.end_stream(handle.0);
        if self.phase != Phase::Writing {
            return Ok(());
        }
        while let Some(ready) = self.interleaver.pop_ready() {
            self.muxer.write_packet(&ready).map_err(PipelineError::mux)?;
        }
        Ok(())
    }

    /// Flush queued packets and finalize the container. Exactly once.
    pub fn write_trailer(&mut self) -> Result<()> {
        match self.phase {
            Phase::Setup => {
                return Err(PipelineError::Mux("trailer written before the header".into()))
            }
            Phase::Finished => return Err(PipelineError::Mux("trailer already written".into())),
            Phase::Writing => {}
        }
        while let Some(packet) = self.interleaver.pop_any() {
            self.muxer.write_packet(&packet).map_err(PipelineError::mux)?;
        }
        self.muxer.write_trailer().map_err(PipelineError::mux)?;
        self.phase = Phase::Finished;
        info!("Finalized {}", self.locator);
        Ok(())
    }

    /// Whether the header has been written.
    pub fn is_started(&self) -> bool {
        self.phase != Phase::Setup
    }

    /// Whether the trailer has been written.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Descriptor of an output stream.
    pub fn stream(&self, handle: StreamHandle) -> Option<&StreamDescriptor> {
        self.streams.get(handle.0 as usize).map(|s| &s.descriptor)
    }

    /// Descriptors of all output streams.
    pub fn streams(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.streams.iter().map(|s| &s.descriptor)
    }

    /// Packets accepted for a stream.
    pub fn packets_written(&self, handle: StreamHandle) -> u64 {
        self.streams
            .get(handle.0 as usize)
            .map_or(0, |s| s.packets)
    }

    /// Payload bytes accepted for a stream.
    pub fn bytes_written(&self, handle: StreamHandle) -> u64 {
        self.streams.get(handle.0 as usize).map_or(0, |s| s.bytes)
    }

    /// Span from the first packet's start to the last packet's end.
    pub fn duration_us(&self, handle: StreamHandle) -> Option<i64> {
        let stream = self.streams.get(handle.0 as usize)?;
        let first = stream.first?.to_micros()?;
        let end = stream.end?.to_micros()?;
        Some(end - first)
    }
}

impl fmt::Debug for MuxSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxSink")
            .field("locator", &self.locator)
            .field("format", &self.muxer.format_name())
            .field("streams", &self.streams.len())
            .field("phase", &self.phase)
            .field("queued", &self.interleaver.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::{Arc, Mutex};
    use transcode_core::{
        AudioCodec, AudioParams, ChannelLayout, CodecId, Duration, PixelFormat, Rational,
        SampleFormat, VideoCodec, VideoParams,
    };

    #[derive(Default)]
    struct Log {
        header: bool,
        packets: Vec<(u32, i64)>,
        trailers: u32,
    }

    struct RecordingMuxer(Arc<Mutex<Log>>);

    impl Muxer for RecordingMuxer {
        fn format_name(&self) -> &str {
            "recording"
        }

        fn add_stream(&mut self, _stream: &StreamDescriptor) -> transcode_core::Result<TimeBase> {
            Ok(TimeBase::MILLISECONDS)
        }

        fn write_header(&mut self) -> transcode_core::Result<()> {
            self.0.lock().unwrap().header = true;
            Ok(())
        }

        fn write_packet(&mut self, packet: &Packet) -> transcode_core::Result<()> {
            self.0
                .lock()
                .unwrap()
                .packets
                .push((packet.stream_index, packet.dts.value));
            Ok(())
        }

        fn write_trailer(&mut self) -> transcode_core::Result<()> {
            self.0.lock().unwrap().trailers += 1;
            Ok(())
        }
    }

    fn video() -> StreamDescriptor {
        StreamDescriptor::video(
            7,
            CodecId::Video(VideoCodec::Raw),
            TimeBase::new(1, 25),
            VideoParams {
                width: 16,
                height: 16,
                pixel_format: PixelFormat::Yuv420p,
                sample_aspect_ratio: Rational::from_int(1),
                frame_rate: Rational::from_int(25),
            },
        )
    }

    fn audio() -> StreamDescriptor {
        StreamDescriptor::audio(
            3,
            CodecId::Audio(AudioCodec::PcmS16le),
            TimeBase::new(1, 48000),
            AudioParams {
                sample_rate: 48000,
                channel_layout: ChannelLayout::Mono,
                sample_format: SampleFormat::S16,
            },
        )
    }

    fn packet(ts: i64, tb: TimeBase, duration: i64) -> Packet {
        let t = Timestamp::new(ts, tb);
        Packet::new(vec![1, 2])
            .with_timestamps(t, t)
            .with_duration(Duration::new(duration, tb))
    }

    fn sink() -> (MuxSink, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        (MuxSink::new("memory", Box::new(RecordingMuxer(log.clone()))), log)
    }

    #[test]
    fn test_write_before_header_fails() {
        let (mut sink, _) = sink();
        let v = sink.add_stream(video()).unwrap();
        let err = sink.write_packet(v, packet(0, TimeBase::new(1, 25), 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Mux);
    }

    #[test]
    fn test_add_stream_after_header_fails() {
        let (mut sink, _) = sink();
        sink.add_stream(video()).unwrap();
        sink.write_header().unwrap();
        assert_eq!(sink.add_stream(audio()).unwrap_err().kind(), ErrorKind::Mux);
        assert_eq!(sink.write_header().unwrap_err().kind(), ErrorKind::Mux);
    }

    #[test]
    fn test_header_requires_parameters() {
        let (mut sink, _) = sink();
        let mut broken = video();
        if let transcode_core::StreamParams::Video(v) = &mut broken.params {
            v.width = 0;
        }
        sink.add_stream(broken).unwrap();
        assert_eq!(sink.write_header().unwrap_err().kind(), ErrorKind::Mux);
    }

    #[test]
    fn test_rescale_interleave_and_trailer() {
        let (mut sink, log) = sink();
        let v = sink.add_stream(video()).unwrap();
        let a = sink.add_stream(audio()).unwrap();
        assert_eq!(sink.stream(v).map(|s| s.index), Some(0));
        sink.write_header().unwrap();

        let vtb = TimeBase::new(1, 25);
        let atb = TimeBase::new(1, 48000);
        sink.write_packet(v, packet(0, vtb, 1)).unwrap();
        sink.write_packet(v, packet(1, vtb, 1)).unwrap();
        sink.write_packet(a, packet(960, atb, 960)).unwrap();
        sink.end_stream(a).unwrap();
        sink.end_stream(v).unwrap();
        sink.write_trailer().unwrap();

        let log = log.lock().unwrap();
        assert!(log.header);
        assert_eq!(log.packets, vec![(0, 0), (1, 20), (0, 40)]);
        assert_eq!(log.trailers, 1);
        drop(log);

        assert_eq!(sink.packets_written(v), 2);
        assert_eq!(sink.duration_us(v), Some(80_000));
        assert_eq!(sink.write_trailer().unwrap_err().kind(), ErrorKind::Mux);
        assert!(sink.is_finished());
    }
}
