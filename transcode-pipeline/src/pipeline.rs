//! Pipeline controller.
//!
//! A [`Pipeline`] moves through
//! `Unconfigured → Configured → Running → Draining → Closed`; any fatal
//! error sends it to `Failed`, releases every per-run resource and keeps
//! the error for the report.
//!
//! `configure` probes the input, selects streams, opens one decoder, filter
//! graph and encoder per selected stream (negotiating the encoder input
//! format against the filter output) and writes the output header. Each
//! [`Pipeline::step`] then reads one packet and pushes it all the way to
//! the muxer; end of input flushes every stream in order and writes the
//! trailer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace};
use transcode_core::{MediaKind, Packet, StreamDescriptor};

use crate::cancel::CancellationToken;
use crate::codec::EncoderParams;
use crate::config::{ExecutionMode, TranscodeConfig};
use crate::demux::{DemuxSource, Demuxer};
use crate::error::{PipelineError, Result};
use crate::lane::{DecodeLane, EncodeLane, PacketWriter};
use crate::mux::{MuxSink, Muxer};
use crate::report::{PipelineStats, TranscodeReport};
use crate::runtime::Registry;
use crate::stage::{DecodeStage, EncodeStage, FilterStage};
use crate::sync::TimestampRebaser;
use crate::threaded;

/// Pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Created, nothing opened yet.
    Unconfigured,
    /// Input probed, stages opened, header written.
    Configured,
    /// Packets are flowing.
    Running,
    /// Input ended or cancelled; stages are being flushed.
    Draining,
    /// Trailer written and resources released.
    Closed,
    /// A fatal error stopped the pipeline.
    Failed,
}

impl PipelineState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Progress snapshot handed to progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Packets of selected streams read so far.
    pub packets_read: u64,
    /// Furthest rebased presentation time seen.
    pub position_us: i64,
    /// Input duration, when the container knows it.
    pub duration_us: Option<i64>,
}

impl Progress {
    /// Completion percentage, when the duration is known.
    pub fn percent(&self) -> Option<f64> {
        match self.duration_us {
            Some(total) if total > 0 => {
                Some((self.position_us as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
            }
            _ => None,
        }
    }
}

/// Called every `progress_interval` packets.
pub type ProgressCallback = Box<dyn FnMut(&Progress) + Send>;

/// Decides which input streams are transcoded.
pub type StreamSelector = Box<dyn FnMut(&StreamDescriptor) -> bool + Send>;

/// What the input produced on one read.
pub(crate) enum Demuxed {
    /// A packet of the selected stream at this lane position.
    Packet(usize, Packet),
    /// A packet of a stream that is not transcoded.
    Ignored,
    End,
}

/// Most packets read ahead while looking for the first timestamp of
/// every selected stream.
const ANCHOR_LOOKAHEAD: usize = 256;

/// Demux side of a run: reading, routing, rebasing and progress.
pub(crate) struct Input {
    source: DemuxSource,
    rebaser: TimestampRebaser,
    lane_of: HashMap<u32, usize>,
    lookahead: VecDeque<Packet>,
    primed: bool,
    /// Read failure hit while filling `lookahead`, reported once it drains.
    deferred: Option<PipelineError>,
    progress: Option<ProgressCallback>,
    progress_interval: u64,
    packets_read: u64,
    packets_ignored: u64,
    selected_read: u64,
    position_us: i64,
    duration_us: Option<i64>,
}

impl Input {
    /// Read the next packet and route it to its lane.
    pub(crate) fn next(&mut self) -> Result<Demuxed> {
        if !self.primed {
            self.prime();
        }
        let packet = match self.lookahead.pop_front() {
            Some(packet) => Some(packet),
            None => match self.deferred.take() {
                Some(err) => return Err(err),
                None => self.source.next_packet()?,
            },
        };
        let Some(mut packet) = packet else {
            return Ok(Demuxed::End);
        };
        self.packets_read += 1;
        let Some(&lane) = self.lane_of.get(&packet.stream_index) else {
            self.packets_ignored += 1;
            trace!(stream = packet.stream_index, "skipping unselected stream");
            return Ok(Demuxed::Ignored);
        };

        self.rebaser.rebase(&mut packet);
        if let Some(us) = packet.pts.to_micros() {
            self.position_us = self.position_us.max(us);
        }
        self.selected_read += 1;
        trace!(
            stream = packet.stream_index,
            pts = packet.pts.value,
            dts = packet.dts.value,
            "demuxed packet"
        );
        if self.progress_interval > 0 && self.selected_read % self.progress_interval == 0 {
            self.report_progress();
        }
        Ok(Demuxed::Packet(lane, packet))
    }

    /// Without declared start times, read until every selected stream has
    /// shown a timestamp and rebase against the earliest of them.
    fn prime(&mut self) {
        self.primed = true;
        if self.rebaser.origin_us().is_some() {
            return;
        }
        let mut waiting: HashSet<u32> = self.lane_of.keys().copied().collect();
        while !waiting.is_empty() && self.lookahead.len() < ANCHOR_LOOKAHEAD {
            match self.source.next_packet() {
                Ok(Some(packet)) => {
                    if packet.ordering_ts().is_valid() {
                        waiting.remove(&packet.stream_index);
                    }
                    self.lookahead.push_back(packet);
                }
                Ok(None) => break,
                Err(e) => {
                    self.deferred = Some(e);
                    break;
                }
            }
        }
        let lane_of = &self.lane_of;
        self.rebaser.anchor(
            self.lookahead
                .iter()
                .filter(|p| lane_of.contains_key(&p.stream_index)),
        );
        debug!(
            "Timestamp origin {:?}us after reading {} packets ahead",
            self.rebaser.origin_us(),
            self.lookahead.len()
        );
    }

    fn report_progress(&mut self) {
        let progress = Progress {
            packets_read: self.selected_read,
            position_us: self.position_us,
            duration_us: self.duration_us,
        };
        match progress.percent() {
            Some(percent) => info!(
                "Progress: {:.1}% ({} packets processed)",
                percent, progress.packets_read
            ),
            None => info!("Processed {} packets", progress.packets_read),
        }
        if let Some(callback) = self.progress.as_mut() {
            callback(&progress);
        }
    }
}

/// Everything owned by one configured run.
pub(crate) struct Run {
    pub(crate) input: Input,
    pub(crate) decoders: Vec<DecodeLane>,
    pub(crate) encoders: Vec<EncodeLane>,
    pub(crate) writer: PacketWriter,
}

impl Run {
    /// Push one packet through decode, filter, encode and mux.
    fn process(&mut self, lane: usize, packet: Packet) -> Result<()> {
        let Run {
            decoders,
            encoders,
            writer,
            ..
        } = self;
        let (Some(decoder), Some(encoder)) = (decoders.get_mut(lane), encoders.get_mut(lane))
        else {
            return Ok(());
        };
        decoder.push(packet, &mut |frame| {
            encoder.push(frame, &mut |packet| writer.write(packet))
        })
    }

    /// Flush one stream end to end and release it in the muxer.
    fn drain_lane(&mut self, lane: usize, flush_decoder: bool) -> Result<()> {
        let Run {
            decoders,
            encoders,
            writer,
            ..
        } = self;
        let (Some(decoder), Some(encoder)) = (decoders.get_mut(lane), encoders.get_mut(lane))
        else {
            return Ok(());
        };
        if flush_decoder {
            decoder.flush(&mut |frame| {
                encoder.push(frame, &mut |packet| writer.write(packet))
            })?;
        }
        encoder.flush(&mut |packet| writer.write(packet))?;
        writer.end_stream(lane)
    }

    fn stats(&self, elapsed: Duration) -> PipelineStats {
        let streams = self
            .decoders
            .iter()
            .zip(&self.encoders)
            .enumerate()
            .map(|(lane, (decoder, encoder))| {
                let mut stats = decoder.stats.clone();
                stats.absorb(&encoder.snapshot());
                stats.absorb(&self.writer.snapshot(lane));
                stats
            })
            .collect();
        PipelineStats {
            streams,
            packets_read: self.input.packets_read,
            packets_ignored: self.input.packets_ignored,
            elapsed,
        }
    }
}

/// Transcoding pipeline controller.
pub struct Pipeline {
    registry: Arc<Registry>,
    config: TranscodeConfig,
    state: PipelineState,
    error: Option<PipelineError>,
    cancel: CancellationToken,
    selector: Option<StreamSelector>,
    progress: Option<ProgressCallback>,
    run: Option<Run>,
    outputs: Vec<StreamDescriptor>,
    stats: PipelineStats,
    cancelled: bool,
    finalized: bool,
    started: Option<Instant>,
}

impl Pipeline {
    /// Create an unconfigured pipeline.
    pub fn new(registry: Arc<Registry>, config: TranscodeConfig) -> Self {
        Self {
            registry,
            config,
            state: PipelineState::Unconfigured,
            error: None,
            cancel: CancellationToken::new(),
            selector: None,
            progress: None,
            run: None,
            outputs: Vec::new(),
            stats: PipelineStats::default(),
            cancelled: false,
            finalized: false,
            started: None,
        }
    }

    /// Use a shared cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Report progress to `callback` every `progress_interval` packets.
    #[must_use]
    pub fn on_progress(mut self, callback: impl FnMut(&Progress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Transcode exactly the input streams `predicate` accepts, instead of
    /// the best video and audio stream. Dropped kinds stay dropped.
    #[must_use]
    pub fn select_streams(
        mut self,
        predicate: impl FnMut(&StreamDescriptor) -> bool + Send + 'static,
    ) -> Self {
        self.selector = Some(Box::new(predicate));
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// First fatal error, if the pipeline failed.
    pub fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    /// Token that cancels this pipeline.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Descriptors of the output streams, once configured.
    pub fn output_streams(&self) -> &[StreamDescriptor] {
        &self.outputs
    }

    /// Probe `input`, open every stage and create `output`.
    pub fn configure(&mut self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
        self.expect_state("configure", &[PipelineState::Unconfigured])?;
        let result = self.open_files(input.as_ref(), output.as_ref());
        self.settle(result)
    }

    /// Configure with an already opened demuxer and muxer.
    pub fn configure_with(
        &mut self,
        demuxer: Box<dyn Demuxer>,
        muxer: Box<dyn Muxer>,
    ) -> Result<()> {
        self.expect_state("configure", &[PipelineState::Unconfigured])?;
        let result = self.config.validate().and_then(|()| {
            let source = DemuxSource::from_demuxer(demuxer.format_name().to_string(), demuxer)?;
            let locator = muxer.format_name().to_string();
            self.bind(source, move || Ok(MuxSink::new(locator, muxer)))
        });
        self.settle(result)
    }

    fn open_files(&mut self, input: &Path, output: &Path) -> Result<()> {
        self.config.validate()?;
        let source = DemuxSource::open(input, &self.registry.containers)?;
        let registry = self.registry.clone();
        let hint = self.config.container.clone();
        self.bind(source, move || {
            MuxSink::create(output, hint.as_deref(), &registry.containers)
        })
    }

    /// Select streams and open their stages. The output is only created
    /// once every stage opened.
    fn bind(
        &mut self,
        mut source: DemuxSource,
        create_sink: impl FnOnce() -> Result<MuxSink>,
    ) -> Result<()> {
        let config = &self.config;
        let selected: Vec<u32> = match self.selector.as_mut() {
            Some(select) => source
                .select_streams(|s| config.keeps(s.kind()) && select(s))
                .to_vec(),
            None => source
                .select_best(config.keeps(MediaKind::Video), config.keeps(MediaKind::Audio))
                .to_vec(),
        };
        if selected.is_empty() {
            return Err(PipelineError::StreamInfo(format!(
                "{}: no stream left to transcode",
                source.locator()
            )));
        }

        let mut decoders = Vec::with_capacity(selected.len());
        let mut encoders = Vec::with_capacity(selected.len());
        let mut lane_of = HashMap::new();
        for (lane, &input_index) in selected.iter().enumerate() {
            let stream = source
                .stream(input_index)
                .cloned()
                .ok_or_else(|| PipelineError::StreamInfo(format!("stream {} vanished", input_index)))?;
            let (decoder, encoder) = self.open_stream(&stream, lane as u32)?;
            decoders.push(decoder);
            encoders.push(encoder);
            lane_of.insert(input_index, lane);
        }

        let mut sink = create_sink()?;
        let mut handles = Vec::with_capacity(encoders.len());
        for encoder in &encoders {
            handles.push(sink.add_stream(encoder.encode.output_stream())?);
        }
        sink.write_header()?;
        self.outputs = sink.streams().cloned().collect();

        let rebaser = TimestampRebaser::from_streams(source.selected_streams());
        let duration_us = source.duration_us();
        info!(
            "Pipeline configured: {} ({}) -> {} ({}), {} streams",
            source.locator(),
            source.format_name(),
            sink.locator(),
            sink.format_name(),
            handles.len()
        );
        self.run = Some(Run {
            input: Input {
                source,
                rebaser,
                lane_of,
                lookahead: VecDeque::new(),
                primed: false,
                deferred: None,
                progress: self.progress.take(),
                progress_interval: self.config.progress_interval,
                packets_read: 0,
                packets_ignored: 0,
                selected_read: 0,
                position_us: 0,
                duration_us,
            },
            decoders,
            encoders,
            writer: PacketWriter::new(sink, handles),
        });
        self.transition(PipelineState::Configured);
        Ok(())
    }

    fn open_stream(&self, stream: &StreamDescriptor, output_index: u32) -> Result<(DecodeLane, EncodeLane)> {
        let config = &self.config;
        let kind = stream.kind();
        let factory = self.registry.codecs.find_encoder(config.encoder_name(kind)?)?;

        let decode = DecodeStage::open(stream, &self.registry.codecs, config.decoder_name(kind))?;
        let mut filter = FilterStage::configure(
            stream.index,
            &config.filters(kind),
            decode.output_format().clone(),
        )?;
        let format = filter.negotiate(factory.as_ref(), config.pixel_format, config.sample_format)?;

        let mut params = EncoderParams::new(output_index, format)
            .with_rate_control(config.rate_control(kind))
            .with_effort(config.effort)
            .with_threads(config.threads);
        if kind == MediaKind::Video {
            params = params.with_keyframe_interval(config.keyframe_interval);
        }
        let encode = EncodeStage::open(factory.as_ref(), params)?;
        debug!(
            "Stream {} -> {}: {} via [{}] to {}",
            stream.index,
            output_index,
            stream.codec,
            filter.graph(),
            factory.name()
        );
        Ok((
            DecodeLane::new(decode, output_index),
            EncodeLane::new(filter, encode),
        ))
    }

    /// Run one iteration: read one packet and push it through its stream.
    ///
    /// Returns `false` once the output has been finalized.
    pub fn step(&mut self) -> Result<bool> {
        match self.state {
            PipelineState::Configured => self.begin(),
            PipelineState::Running => {}
            PipelineState::Draining => {
                let result = self.drain();
                return self.settle(result).map(|()| false);
            }
            state => {
                return Err(PipelineError::InvalidState {
                    operation: "step",
                    state,
                })
            }
        }

        if self.cancel.is_cancelled() {
            info!("Cancellation requested, draining");
            self.cancelled = true;
            let result = self.drain();
            return self.settle(result).map(|()| false);
        }

        let result = self.advance();
        self.settle(result)
    }

    fn advance(&mut self) -> Result<bool> {
        let run = self.run_mut("step")?;
        match run.input.next()? {
            Demuxed::Packet(lane, packet) => {
                run.process(lane, packet)?;
                Ok(true)
            }
            Demuxed::Ignored => Ok(true),
            Demuxed::End => {
                info!("End of input");
                self.drain()?;
                Ok(false)
            }
        }
    }

    /// Flush every stream, write the trailer and release the run.
    fn drain(&mut self) -> Result<()> {
        if self.state != PipelineState::Draining {
            self.transition(PipelineState::Draining);
        }
        let flush_decoders = !self.cancelled;
        let run = self.run_mut("drain")?;
        for lane in 0..run.decoders.len() {
            run.drain_lane(lane, flush_decoders)?;
        }
        run.writer.finish()?;
        self.finish();
        Ok(())
    }

    /// Run until the output is finalized and return the report.
    ///
    /// Fails with the first fatal error; [`Pipeline::report`] still
    /// describes the failed run afterwards.
    pub fn run(&mut self) -> Result<TranscodeReport> {
        self.expect_state(
            "run",
            &[PipelineState::Configured, PipelineState::Running],
        )?;
        match self.config.execution {
            ExecutionMode::Sequential => while self.step()? {},
            ExecutionMode::Threaded => {
                if self.state == PipelineState::Configured {
                    self.begin();
                }
                let cancel = self.cancel.clone();
                let capacity = self.config.queue_capacity;
                let result = self
                    .run_mut("run")
                    .and_then(|run| threaded::execute(run, &cancel, capacity));
                match result {
                    Ok(cancelled) => {
                        self.cancelled |= cancelled;
                        self.transition(PipelineState::Draining);
                        self.finish();
                    }
                    Err(e) => return Err(self.fail(e)),
                }
            }
        }
        Ok(self.report())
    }

    /// Stop the pipeline, finalizing the output when one was started.
    ///
    /// A running pipeline is drained as if cancelled. Closing a closed or
    /// failed pipeline does nothing.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Unconfigured => {
                self.transition(PipelineState::Closed);
                Ok(())
            }
            PipelineState::Configured | PipelineState::Running | PipelineState::Draining => {
                self.cancelled = true;
                let result = self.drain();
                self.settle(result)
            }
            PipelineState::Closed | PipelineState::Failed => Ok(()),
        }
    }

    /// Snapshot of the run so far.
    pub fn report(&self) -> TranscodeReport {
        let stats = match &self.run {
            Some(run) => run.stats(self.elapsed()),
            None => self.stats.clone(),
        };
        TranscodeReport::new(
            self.state,
            self.error.clone(),
            self.cancelled,
            self.finalized,
            stats,
        )
    }

    fn begin(&mut self) {
        self.started = Some(Instant::now());
        self.transition(PipelineState::Running);
    }

    /// Trailer written: keep the statistics, release everything else.
    fn finish(&mut self) {
        self.finalized = self
            .run
            .as_ref()
            .map_or(false, |run| run.writer.is_finished());
        self.release();
        self.transition(PipelineState::Closed);
        info!(
            "Pipeline finished: {} packets read, {} frames encoded, {} dropped",
            self.stats.packets_read,
            self.stats.frames_encoded(),
            self.stats.dropped()
        );
    }

    fn release(&mut self) {
        if let Some(run) = self.run.take() {
            self.stats = run.stats(self.elapsed());
        }
    }

    fn fail(&mut self, err: PipelineError) -> PipelineError {
        error!("Pipeline failed in state {}: {}", self.state, err);
        self.release();
        self.transition(PipelineState::Failed);
        self.error.get_or_insert_with(|| err.clone());
        err
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.fail(e))
    }

    fn transition(&mut self, to: PipelineState) {
        if self.state != to {
            info!("Pipeline state: {} -> {}", self.state, to);
            self.state = to;
        }
    }

    fn expect_state(&self, operation: &'static str, allowed: &[PipelineState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn run_mut(&mut self, operation: &'static str) -> Result<&mut Run> {
        let state = self.state;
        self.run
            .as_mut()
            .ok_or(PipelineError::InvalidState { operation, state })
    }

    fn elapsed(&self) -> Duration {
        self.started.map(|t| t.elapsed()).unwrap_or_default()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("outputs", &self.outputs.len())
            .field("error", &self.error)
            .finish()
    }
}

/// Transcode `input` into `output` in one call.
pub fn transcode(
    registry: Arc<Registry>,
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: TranscodeConfig,
) -> Result<TranscodeReport> {
    let mut pipeline = Pipeline::new(registry, config);
    pipeline.configure(input, output)?;
    pipeline.run()
}
