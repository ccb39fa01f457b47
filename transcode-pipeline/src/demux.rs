//! Demux source: opens an input and hands out its packets in file order.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, info};
use transcode_core::{MediaKind, Packet, StreamDescriptor, TimeBase};

use crate::container::ContainerRegistry;
use crate::error::{PipelineError, Result};

/// A container reader.
pub trait Demuxer: Send {
    /// Container format name.
    fn format_name(&self) -> &str;

    /// Streams found in the input.
    fn streams(&self) -> &[StreamDescriptor];

    /// Read the next packet in file order, `None` at end of input.
    fn read_packet(&mut self) -> transcode_core::Result<Option<Packet>>;

    /// Total duration in microseconds, when the container knows it.
    fn duration_us(&self) -> Option<i64> {
        None
    }
}

/// An opened input with its stream selection.
pub struct DemuxSource {
    locator: String,
    demuxer: Box<dyn Demuxer>,
    streams: Vec<StreamDescriptor>,
    selected: Vec<u32>,
    finished: bool,
    packets_read: u64,
}

impl DemuxSource {
    /// Open `path`, detecting the container from its content or extension.
    pub fn open(path: &Path, containers: &ContainerRegistry) -> Result<Self> {
        let demuxer = containers.open_input(path)?;
        Self::from_demuxer(path.display().to_string(), demuxer)
    }

    /// Wrap an already opened demuxer.
    ///
    /// Fails with [`PipelineError::StreamInfo`] when a stream's metadata is
    /// incomplete. The best video and best audio stream are selected.
    pub fn from_demuxer(locator: impl Into<String>, demuxer: Box<dyn Demuxer>) -> Result<Self> {
        let locator = locator.into();
        let streams = demuxer.streams().to_vec();
        if streams.is_empty() {
            return Err(PipelineError::StreamInfo(format!("{}: no streams", locator)));
        }
        let mut seen = HashSet::new();
        for stream in &streams {
            if !seen.insert(stream.index) {
                return Err(PipelineError::StreamInfo(format!(
                    "{}: duplicate stream index {}",
                    locator, stream.index
                )));
            }
            if !stream.time_base.is_valid() {
                return Err(PipelineError::StreamInfo(format!(
                    "{}: stream {} has invalid time base {}",
                    locator, stream.index, stream.time_base
                )));
            }
            let missing = stream.missing_parameters();
            if !missing.is_empty() {
                return Err(PipelineError::StreamInfo(format!(
                    "{}: stream {} is missing {}",
                    locator,
                    stream.index,
                    missing.join(", ")
                )));
            }
        }

        info!(
            "Opened {} ({}, {} streams)",
            locator,
            demuxer.format_name(),
            streams.len()
        );
        let mut source = Self {
            locator,
            demuxer,
            streams,
            selected: Vec::new(),
            finished: false,
            packets_read: 0,
        };
        source.select_best(true, true);
        Ok(source)
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn format_name(&self) -> &str {
        self.demuxer.format_name()
    }

    /// All streams of the input.
    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn stream(&self, index: u32) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.index == index)
    }

    /// Select the streams matching `predicate`.
    pub fn select_streams(&mut self, mut predicate: impl FnMut(&StreamDescriptor) -> bool) -> &[u32] {
        self.selected = self
            .streams
            .iter()
            .filter(|s| predicate(s))
            .map(|s| s.index)
            .collect();
        debug!("Selected streams {:?}", self.selected);
        &self.selected
    }

    /// Select the best video and/or best audio stream.
    pub fn select_best(&mut self, video: bool, audio: bool) -> &[u32] {
        let mut wanted = Vec::new();
        if video {
            wanted.extend(self.best_stream(MediaKind::Video).map(|s| s.index));
        }
        if audio {
            wanted.extend(self.best_stream(MediaKind::Audio).map(|s| s.index));
        }
        self.select_streams(|s| wanted.contains(&s.index))
    }

    /// The preferred stream of a kind: highest resolution, then bitrate.
    /// Ties go to the lowest index.
    pub fn best_stream(&self, kind: MediaKind) -> Option<&StreamDescriptor> {
        self.streams
            .iter()
            .filter(|s| s.kind() == kind)
            .max_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| b.index.cmp(&a.index)))
    }

    /// Indices of the selected streams.
    pub fn selected(&self) -> &[u32] {
        &self.selected
    }

    pub fn is_selected(&self, index: u32) -> bool {
        self.selected.contains(&index)
    }

    /// Descriptors of the selected streams.
    pub fn selected_streams(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.streams
            .iter()
            .filter(move |s| self.selected.contains(&s.index))
    }

    /// Next packet of any stream, `None` once the input is exhausted.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.finished {
            return Ok(None);
        }
        match self.demuxer.read_packet() {
            Ok(Some(packet)) => {
                self.packets_read += 1;
                Ok(Some(packet))
            }
            Ok(None) => {
                debug!("{}: end of input after {} packets", self.locator, self.packets_read);
                self.finished = true;
                Ok(None)
            }
            Err(e) => Err(PipelineError::Input(format!("{}: {}", self.locator, e))),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Total duration in microseconds, from the container or the streams.
    pub fn duration_us(&self) -> Option<i64> {
        self.demuxer.duration_us().or_else(|| {
            self.selected_streams()
                .filter_map(|s| {
                    let start = s.start_time.unwrap_or(0);
                    s.duration.map(|d| {
                        s.time_base.convert_rounded(start + d, TimeBase::MICROSECONDS)
                    })
                })
                .max()
        })
    }
}

/// Ranking key for stream selection.
fn rank(stream: &StreamDescriptor) -> (u64, u64) {
    let bit_rate = stream.bit_rate.unwrap_or(0);
    if let Some(v) = stream.video_params() {
        (v.width as u64 * v.height as u64, bit_rate)
    } else if let Some(a) = stream.audio_params() {
        (a.sample_rate as u64 * a.channel_layout.channels() as u64, bit_rate)
    } else {
        (0, bit_rate)
    }
}

impl std::fmt::Debug for DemuxSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemuxSource")
            .field("locator", &self.locator)
            .field("format", &self.demuxer.format_name())
            .field("selected", &self.selected)
            .field("finished", &self.finished)
            .finish()
    }
}
