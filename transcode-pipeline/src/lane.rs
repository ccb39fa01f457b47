//! Per-stream processing shared by the sequential and threaded executors.
//!
//! A transcoded stream is split in three parts that can live on different
//! threads: the decode side, the filter+encode side and the shared packet
//! writer. Recoverable errors are logged and counted here; anything else
//! is returned to the executor.

use tracing::{trace, warn};
use transcode_core::Packet;

use crate::error::{PipelineError, Result};
use crate::media::MediaFrame;
use crate::mux::{MuxSink, StreamHandle};
use crate::report::StreamStats;
use crate::stage::{DecodeStage, EncodeStage, FilterStage};
use crate::sync::TimestampGuard;

/// Drain passes in a row that may end on a recoverable error without
/// producing anything before the lane gives up on the codec.
pub(crate) const MAX_IDLE_PASSES: u32 = 8;

/// Outcome of one pass over a codec drain.
#[derive(Debug, Default, Clone, Copy)]
struct Pass {
    produced: u64,
    interrupted: bool,
}

/// Counts drain passes that made no progress.
#[derive(Debug, Default)]
struct Retry {
    idle: u32,
}

impl Retry {
    /// Whether another pass should run after `pass`.
    fn again(&mut self, pass: Pass, what: &str) -> bool {
        if !pass.interrupted {
            return false;
        }
        if pass.produced > 0 {
            self.idle = 0;
            return true;
        }
        self.idle += 1;
        if self.idle >= MAX_IDLE_PASSES {
            warn!("{} keeps failing without output, giving up after {} attempts", what, self.idle);
            return false;
        }
        true
    }
}

/// Decode side of one stream.
#[derive(Debug)]
pub(crate) struct DecodeLane {
    pub(crate) decode: DecodeStage,
    pub(crate) stats: StreamStats,
}

impl DecodeLane {
    pub(crate) fn new(decode: DecodeStage, output_index: u32) -> Self {
        let stream = decode.stream();
        let stats = StreamStats::new(stream.index, output_index, stream.kind());
        Self { decode, stats }
    }

    /// Decode one packet and hand every produced frame to `emit`.
    pub(crate) fn push(
        &mut self,
        packet: Packet,
        emit: &mut dyn FnMut(MediaFrame) -> Result<()>,
    ) -> Result<()> {
        self.stats.packets_read += 1;
        match self.decode.submit(packet) {
            Ok(()) => self.stats.packets_decoded += 1,
            Err(e) if e.is_recoverable() => {
                warn!("Dropping packet: {}", e);
                self.stats.dropped_packets += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.drain(false, emit)
    }

    /// Flush the decoder, emitting the frames it was holding.
    pub(crate) fn flush(&mut self, emit: &mut dyn FnMut(MediaFrame) -> Result<()>) -> Result<()> {
        self.drain(true, emit)
    }

    fn drain(&mut self, flush: bool, emit: &mut dyn FnMut(MediaFrame) -> Result<()>) -> Result<()> {
        let mut first = flush;
        let mut retry = Retry::default();
        loop {
            let frames = if first {
                first = false;
                match self.decode.flush() {
                    Ok(drain) => drain,
                    Err(e) if e.is_recoverable() => {
                        warn!("Decoder flush failed: {}", e);
                        self.stats.dropped_packets += 1;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            } else {
                self.decode.frames()
            };
            let mut pass = Pass::default();
            for frame in frames {
                match frame {
                    Ok(frame) => {
                        self.stats.frames_decoded += 1;
                        pass.produced += 1;
                        emit(frame)?;
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!("Dropping undecodable data: {}", e);
                        self.stats.dropped_packets += 1;
                        pass.interrupted = true;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !retry.again(pass, "decoder") {
                return Ok(());
            }
        }
    }
}

/// Filter and encode side of one stream.
#[derive(Debug)]
pub(crate) struct EncodeLane {
    pub(crate) filter: FilterStage,
    pub(crate) encode: EncodeStage,
    pub(crate) stats: StreamStats,
}

impl EncodeLane {
    pub(crate) fn new(filter: FilterStage, encode: EncodeStage) -> Self {
        Self {
            filter,
            encode,
            stats: StreamStats::default(),
        }
    }

    /// Filter and encode one decoded frame, handing packets to `emit`.
    pub(crate) fn push(
        &mut self,
        frame: MediaFrame,
        emit: &mut dyn FnMut(Packet) -> Result<()>,
    ) -> Result<()> {
        match self.filter.submit(frame) {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                warn!("Dropping frame: {}", e);
                self.stats.dropped_frames += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        for frame in self.filter.frames() {
            self.stats.frames_filtered += 1;
            encode_frame(&mut self.encode, &mut self.stats, frame?, emit)?;
        }
        Ok(())
    }

    /// Flush the filter graph, then the encoder.
    pub(crate) fn flush(&mut self, emit: &mut dyn FnMut(Packet) -> Result<()>) -> Result<()> {
        for frame in self.filter.flush() {
            self.stats.frames_filtered += 1;
            encode_frame(&mut self.encode, &mut self.stats, frame?, emit)?;
        }
        let mut first = true;
        let mut retry = Retry::default();
        loop {
            let packets = if first {
                first = false;
                match self.encode.flush() {
                    Ok(drain) => drain,
                    Err(e) if e.is_recoverable() => {
                        warn!("Encoder flush failed: {}", e);
                        self.stats.dropped_frames += 1;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            } else {
                self.encode.packets()
            };
            let pass = drain_packets(packets, &mut self.stats, emit)?;
            if !retry.again(pass, "encoder") {
                return Ok(());
            }
        }
    }

    /// Counters including the filter graph's own.
    pub(crate) fn snapshot(&self) -> StreamStats {
        let mut stats = self.stats.clone();
        let graph = self.filter.graph();
        stats.frames_discarded += graph.discarded();
        stats.dropped_frames += graph.rejected_on_flush();
        stats
    }
}

fn encode_frame(
    encode: &mut EncodeStage,
    stats: &mut StreamStats,
    frame: MediaFrame,
    emit: &mut dyn FnMut(Packet) -> Result<()>,
) -> Result<()> {
    match encode.submit(frame) {
        Ok(()) => stats.frames_encoded += 1,
        Err(e) if e.is_recoverable() => {
            warn!("Dropping frame: {}", e);
            stats.dropped_frames += 1;
            return Ok(());
        }
        Err(e) => return Err(e),
    }
    let mut retry = Retry::default();
    loop {
        let pass = drain_packets(encode.packets(), stats, emit)?;
        if !retry.again(pass, "encoder") {
            return Ok(());
        }
    }
}

fn drain_packets(
    packets: impl Iterator<Item = Result<Packet>>,
    stats: &mut StreamStats,
    emit: &mut dyn FnMut(Packet) -> Result<()>,
) -> Result<Pass> {
    let mut pass = Pass::default();
    for packet in packets {
        match packet {
            Ok(packet) => {
                stats.packets_encoded += 1;
                pass.produced += 1;
                emit(packet)?;
            }
            Err(e) if e.is_recoverable() => {
                warn!("Dropping encoder output: {}", e);
                stats.dropped_frames += 1;
                pass.interrupted = true;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(pass)
}

/// Writes encoded packets of every stream to the output.
#[derive(Debug)]
pub(crate) struct PacketWriter {
    pub(crate) sink: MuxSink,
    handles: Vec<StreamHandle>,
    guard: TimestampGuard,
    stats: Vec<StreamStats>,
}

impl PacketWriter {
    pub(crate) fn new(sink: MuxSink, handles: Vec<StreamHandle>) -> Self {
        let stats = vec![StreamStats::default(); handles.len()];
        Self {
            sink,
            handles,
            guard: TimestampGuard::new(),
            stats,
        }
    }

    /// Write a packet tagged with its output stream index.
    ///
    /// Packets moving a stream's timeline backwards are dropped.
    pub(crate) fn write(&mut self, packet: Packet) -> Result<()> {
        let lane = packet.stream_index as usize;
        let (Some(&handle), Some(stats)) = (self.handles.get(lane), self.stats.get_mut(lane)) else {
            return Err(PipelineError::Mux(format!(
                "packet for unknown output stream {}",
                packet.stream_index
            )));
        };
        if !self.guard.admit(&packet) {
            warn!(
                "Stream {}: dropping packet with non-monotonic dts {} (last {:?})",
                handle,
                packet.ordering_ts(),
                self.guard.last(packet.stream_index).map(|t| t.value)
            );
            stats.dropped_packets += 1;
            return Ok(());
        }
        trace!(stream = lane, dts = packet.dts.value, "write packet");
        self.sink.write_packet(handle, packet)?;
        stats.packets_written += 1;
        Ok(())
    }

    /// Mark an output stream as complete.
    pub(crate) fn end_stream(&mut self, lane: usize) -> Result<()> {
        match self.handles.get(lane) {
            Some(&handle) => self.sink.end_stream(handle),
            None => Ok(()),
        }
    }

    /// Write the trailer.
    pub(crate) fn finish(&mut self) -> Result<()> {
        self.sink.write_trailer()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.sink.is_finished()
    }

    pub(crate) fn snapshot(&self, lane: usize) -> StreamStats {
        let mut stats = self.stats.get(lane).cloned().unwrap_or_default();
        if let Some(&handle) = self.handles.get(lane) {
            stats.duration_us = self.sink.duration_us(handle);
        }
        stats
    }
}
