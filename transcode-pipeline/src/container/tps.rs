//! Transcode packet stream (`.tps`): a minimal interleaved container.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! "TPS1" u32:stream_count stream_header*
//! ( 'P' u32:stream i64:pts i64:dts i64:duration u32:flags u32:len [len bytes] )*
//! 'T' u32:count ( u32:stream u64:packets i64:first_pts i64:end_pts )*
//! u32:trailer_len "TPSE"
//! ```
//!
//! A stream header is `u32:index u8:kind u8:name_len name i64:tb_num
//! i64:tb_den`, then either `u32:width u32:height u8:pixel_format
//! i64:sar_num i64:sar_den i64:rate_num i64:rate_den` (video) or
//! `u32:sample_rate u32:channels u8:sample_format` (audio), then
//! `u64:bit_rate u32:extra_len extra`. Undefined timestamps are stored as
//! `i64::MIN`. Timestamps are in each stream's own time base.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;
use transcode_core::{
    AudioParams, ChannelLayout, CodecId, ContainerError, Duration, Error, Packet, PacketFlags,
    PixelFormat, Rational, SampleFormat, StreamDescriptor, StreamParams, TimeBase, Timestamp,
    VideoParams,
};

use super::{InputFormat, OutputFormat};
use crate::demux::Demuxer;
use crate::mux::Muxer;

const MAGIC: &[u8; 4] = b"TPS1";
const END_MAGIC: &[u8; 4] = b"TPSE";
const PACKET_MARKER: u8 = b'P';
const TRAILER_MARKER: u8 = b'T';
const KIND_VIDEO: u8 = 0;
const KIND_AUDIO: u8 = 1;

/// The `tps` container, readable and writable.
#[derive(Debug, Clone, Copy, Default)]
pub struct TpsFormat;

impl InputFormat for TpsFormat {
    fn name(&self) -> &str {
        "tps"
    }

    fn extensions(&self) -> &[&str] {
        &["tps"]
    }

    fn probe(&self, header: &[u8]) -> bool {
        header.starts_with(MAGIC)
    }

    fn open(&self, path: &Path) -> transcode_core::Result<Box<dyn Demuxer>> {
        Ok(Box::new(TpsDemuxer::new(BufReader::new(File::open(path)?))?))
    }
}

impl OutputFormat for TpsFormat {
    fn name(&self) -> &str {
        "tps"
    }

    fn extensions(&self) -> &[&str] {
        &["tps"]
    }

    fn create(&self, path: &Path) -> transcode_core::Result<Box<dyn Muxer>> {
        Ok(Box::new(TpsMuxer::new(BufWriter::new(File::create(path)?))))
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    ContainerError::InvalidStructure(msg.into()).into()
}

/// Turn a short read into a truncation error.
fn truncated(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ContainerError::Truncated("unexpected end of file".into()).into()
    } else {
        err.into()
    }
}

fn read_rational<R: Read>(reader: &mut R) -> transcode_core::Result<Rational> {
    let num = reader.read_i64::<LittleEndian>().map_err(truncated)?;
    let den = reader.read_i64::<LittleEndian>().map_err(truncated)?;
    Rational::try_new(num, den).ok_or_else(|| invalid("zero denominator"))
}

fn write_rational<W: Write>(writer: &mut W, value: Rational) -> io::Result<()> {
    writer.write_i64::<LittleEndian>(value.num)?;
    writer.write_i64::<LittleEndian>(value.den)
}

fn read_stream<R: Read>(reader: &mut R) -> transcode_core::Result<StreamDescriptor> {
    let index = reader.read_u32::<LittleEndian>().map_err(truncated)?;
    let kind = reader.read_u8().map_err(truncated)?;
    let name_len = reader.read_u8().map_err(truncated)? as usize;
    let mut name = vec![0u8; name_len];
    reader.read_exact(&mut name).map_err(truncated)?;
    let name = String::from_utf8(name).map_err(|_| invalid("codec name is not UTF-8"))?;
    let codec = CodecId::from_name(&name)
        .ok_or_else(|| invalid(format!("unknown codec '{}'", name)))?;
    let time_base = TimeBase(read_rational(reader)?);

    let params = match kind {
        KIND_VIDEO => {
            let width = reader.read_u32::<LittleEndian>().map_err(truncated)?;
            let height = reader.read_u32::<LittleEndian>().map_err(truncated)?;
            let id = reader.read_u8().map_err(truncated)?;
            let pixel_format = PixelFormat::from_id(id)
                .ok_or_else(|| invalid(format!("unknown pixel format {}", id)))?;
            StreamParams::Video(VideoParams {
                width,
                height,
                pixel_format,
                sample_aspect_ratio: read_rational(reader)?,
                frame_rate: read_rational(reader)?,
            })
        }
        KIND_AUDIO => {
            let sample_rate = reader.read_u32::<LittleEndian>().map_err(truncated)?;
            let channels = reader.read_u32::<LittleEndian>().map_err(truncated)?;
            let id = reader.read_u8().map_err(truncated)?;
            let sample_format = SampleFormat::from_id(id)
                .ok_or_else(|| invalid(format!("unknown sample format {}", id)))?;
            StreamParams::Audio(AudioParams {
                sample_rate,
                channel_layout: ChannelLayout::from_channels(channels),
                sample_format,
            })
        }
        other => return Err(invalid(format!("unknown stream kind {}", other))),
    };
    if codec.kind() != params_kind(&params) {
        return Err(invalid(format!("stream {}: {} does not match its parameters", index, codec)));
    }

    let bit_rate = reader.read_u64::<LittleEndian>().map_err(truncated)?;
    let extra_len = reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let mut extra_data = vec![0u8; extra_len];
    reader.read_exact(&mut extra_data).map_err(truncated)?;

    Ok(StreamDescriptor {
        index,
        codec,
        time_base,
        params,
        bit_rate: (bit_rate > 0).then_some(bit_rate),
        start_time: None,
        duration: None,
        extra_data,
    })
}

fn params_kind(params: &StreamParams) -> transcode_core::MediaKind {
    match params {
        StreamParams::Video(_) => transcode_core::MediaKind::Video,
        StreamParams::Audio(_) => transcode_core::MediaKind::Audio,
    }
}

fn write_stream<W: Write>(writer: &mut W, stream: &StreamDescriptor) -> io::Result<()> {
    let name = stream.codec.name().as_bytes();
    writer.write_u32::<LittleEndian>(stream.index)?;
    match &stream.params {
        StreamParams::Video(_) => writer.write_u8(KIND_VIDEO)?,
        StreamParams::Audio(_) => writer.write_u8(KIND_AUDIO)?,
    }
    writer.write_u8(name.len() as u8)?;
    writer.write_all(name)?;
    write_rational(writer, stream.time_base.0)?;
    match &stream.params {
        StreamParams::Video(v) => {
            writer.write_u32::<LittleEndian>(v.width)?;
            writer.write_u32::<LittleEndian>(v.height)?;
            writer.write_u8(v.pixel_format.id())?;
            write_rational(writer, v.sample_aspect_ratio)?;
            write_rational(writer, v.frame_rate)?;
        }
        StreamParams::Audio(a) => {
            writer.write_u32::<LittleEndian>(a.sample_rate)?;
            writer.write_u32::<LittleEndian>(a.channel_layout.channels())?;
            writer.write_u8(a.sample_format.id())?;
        }
    }
    writer.write_u64::<LittleEndian>(stream.bit_rate.unwrap_or(0))?;
    writer.write_u32::<LittleEndian>(stream.extra_data.len() as u32)?;
    writer.write_all(&stream.extra_data)
}

/// Per-stream summary kept in the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamSummary {
    packets: u64,
    first_pts: i64,
    end_pts: i64,
}

impl Default for StreamSummary {
    fn default() -> Self {
        Self {
            packets: 0,
            first_pts: Timestamp::NONE,
            end_pts: Timestamp::NONE,
        }
    }
}

impl StreamSummary {
    fn record(&mut self, packet: &Packet, time_base: TimeBase) {
        self.packets += 1;
        let Some(pts) = packet.pts.rescale(time_base).get() else {
            return;
        };
        let end = pts + packet.duration.rescale(time_base).value.max(0);
        if self.first_pts == Timestamp::NONE || pts < self.first_pts {
            self.first_pts = pts;
        }
        if self.end_pts == Timestamp::NONE || end > self.end_pts {
            self.end_pts = end;
        }
    }
}

/// Reader for `.tps` files.
pub struct TpsDemuxer<R: Read + Seek> {
    reader: R,
    streams: Vec<StreamDescriptor>,
    duration_us: Option<i64>,
    done: bool,
}

impl<R: Read + Seek> TpsDemuxer<R> {
    /// Parse the header and trailer. Files without a trailer are rejected.
    pub fn new(mut reader: R) -> transcode_core::Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(truncated)?;
        if &magic != MAGIC {
            return Err(invalid("missing TPS1 magic"));
        }
        let count = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        let mut streams = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            streams.push(read_stream(&mut reader)?);
        }
        let data_start = reader.stream_position()?;

        let summaries = read_trailer(&mut reader, data_start)?;
        let mut duration_us = None;
        for stream in &mut streams {
            let Some(summary) = summaries.get(&stream.index) else {
                continue;
            };
            if summary.first_pts != Timestamp::NONE {
                stream.start_time = Some(summary.first_pts);
                stream.duration = Some(summary.end_pts - summary.first_pts);
                let end_us = stream
                    .time_base
                    .convert_rounded(summary.end_pts, TimeBase::MICROSECONDS);
                duration_us = duration_us.max(Some(end_us));
            }
        }
        reader.seek(SeekFrom::Start(data_start))?;
        debug!("tps: {} streams, duration {:?}us", streams.len(), duration_us);

        Ok(Self {
            reader,
            streams,
            duration_us,
            done: false,
        })
    }
}

fn read_trailer<R: Read + Seek>(
    reader: &mut R,
    data_start: u64,
) -> transcode_core::Result<BTreeMap<u32, StreamSummary>> {
    let missing = || -> Error { ContainerError::Truncated("no trailer".into()).into() };
    let file_len = reader.seek(SeekFrom::End(0))?;
    if file_len < data_start + 8 {
        return Err(missing());
    }
    reader.seek(SeekFrom::End(-8))?;
    let trailer_len = reader.read_u32::<LittleEndian>()? as u64;
    let mut end_magic = [0u8; 4];
    reader.read_exact(&mut end_magic)?;
    if &end_magic != END_MAGIC || trailer_len > file_len - 8 - data_start {
        return Err(missing());
    }
    reader.seek(SeekFrom::Start(file_len - 8 - trailer_len))?;
    if reader.read_u8()? != TRAILER_MARKER {
        return Err(missing());
    }
    let count = reader.read_u32::<LittleEndian>()?;
    let mut summaries = BTreeMap::new();
    for _ in 0..count {
        let index = reader.read_u32::<LittleEndian>()?;
        let summary = StreamSummary {
            packets: reader.read_u64::<LittleEndian>()?,
            first_pts: reader.read_i64::<LittleEndian>()?,
            end_pts: reader.read_i64::<LittleEndian>()?,
        };
        summaries.insert(index, summary);
    }
    Ok(summaries)
}

impl<R: Read + Seek + Send> Demuxer for TpsDemuxer<R> {
    fn format_name(&self) -> &str {
        "tps"
    }

    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn read_packet(&mut self) -> transcode_core::Result<Option<Packet>> {
        if self.done {
            return Ok(None);
        }
        match self.reader.read_u8().map_err(truncated)? {
            PACKET_MARKER => {}
            TRAILER_MARKER => {
                self.done = true;
                return Ok(None);
            }
            other => return Err(invalid(format!("unexpected record marker {:#04x}", other))),
        }
        let r = &mut self.reader;
        let stream_index = r.read_u32::<LittleEndian>().map_err(truncated)?;
        let time_base = self
            .streams
            .iter()
            .find(|s| s.index == stream_index)
            .map(|s| s.time_base)
            .ok_or(ContainerError::StreamNotFound { index: stream_index })?;
        let pts = r.read_i64::<LittleEndian>().map_err(truncated)?;
        let dts = r.read_i64::<LittleEndian>().map_err(truncated)?;
        let duration = r.read_i64::<LittleEndian>().map_err(truncated)?;
        let flags = PacketFlags::from_bits_truncate(r.read_u32::<LittleEndian>().map_err(truncated)?);
        let len = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let mut data = vec![0u8; len];
        r.read_exact(&mut data).map_err(truncated)?;

        Ok(Some(
            Packet::new(data)
                .with_stream_index(stream_index)
                .with_timestamps(Timestamp::new(pts, time_base), Timestamp::new(dts, time_base))
                .with_duration(Duration::new(duration, time_base))
                .with_flags(flags),
        ))
    }

    fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }
}

/// Writer for `.tps` files.
pub struct TpsMuxer<W: Write> {
    writer: W,
    streams: Vec<StreamDescriptor>,
    summaries: Vec<StreamSummary>,
    header_written: bool,
}

impl<W: Write> TpsMuxer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            streams: Vec::new(),
            summaries: Vec::new(),
            header_written: false,
        }
    }

    /// Consume the muxer, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Muxer for TpsMuxer<W> {
    fn format_name(&self) -> &str {
        "tps"
    }

    fn add_stream(&mut self, stream: &StreamDescriptor) -> transcode_core::Result<TimeBase> {
        if self.header_written {
            return Err(ContainerError::TrackConfig("header already written".into()).into());
        }
        if stream.codec.name().len() > u8::MAX as usize {
            return Err(ContainerError::TrackConfig("codec name too long".into()).into());
        }
        self.streams.push(stream.clone());
        self.summaries.push(StreamSummary::default());
        Ok(stream.time_base)
    }

    fn write_header(&mut self) -> transcode_core::Result<()> {
        self.writer.write_all(MAGIC)?;
        self.writer
            .write_u32::<LittleEndian>(self.streams.len() as u32)?;
        for stream in &self.streams {
            write_stream(&mut self.writer, stream)?;
        }
        self.header_written = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: &Packet) -> transcode_core::Result<()> {
        let position = self
            .streams
            .iter()
            .position(|s| s.index == packet.stream_index)
            .ok_or(ContainerError::StreamNotFound {
                index: packet.stream_index,
            })?;
        let time_base = self.streams[position].time_base;
        self.summaries[position].record(packet, time_base);

        let w = &mut self.writer;
        w.write_u8(PACKET_MARKER)?;
        w.write_u32::<LittleEndian>(packet.stream_index)?;
        w.write_i64::<LittleEndian>(packet.pts.rescale(time_base).value)?;
        w.write_i64::<LittleEndian>(packet.dts.rescale(time_base).value)?;
        w.write_i64::<LittleEndian>(packet.duration.rescale(time_base).value)?;
        w.write_u32::<LittleEndian>(packet.flags.bits())?;
        w.write_u32::<LittleEndian>(packet.size() as u32)?;
        w.write_all(packet.data())?;
        Ok(())
    }

    fn write_trailer(&mut self) -> transcode_core::Result<()> {
        let mut trailer = Vec::new();
        trailer.write_u8(TRAILER_MARKER)?;
        trailer.write_u32::<LittleEndian>(self.streams.len() as u32)?;
        for (stream, summary) in self.streams.iter().zip(&self.summaries) {
            trailer.write_u32::<LittleEndian>(stream.index)?;
            trailer.write_u64::<LittleEndian>(summary.packets)?;
            trailer.write_i64::<LittleEndian>(summary.first_pts)?;
            trailer.write_i64::<LittleEndian>(summary.end_pts)?;
        }
        self.writer.write_all(&trailer)?;
        self.writer.write_u32::<LittleEndian>(trailer.len() as u32)?;
        self.writer.write_all(END_MAGIC)?;
        self.writer.flush()?;
        Ok(())
    }
}
