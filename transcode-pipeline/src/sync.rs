//! Cross-stream timing: rebasing, monotonicity and interleaving.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::trace;
use transcode_core::{Packet, StreamDescriptor, TimeBase, Timestamp};

/// Shifts input timestamps so the output starts at zero.
///
/// All streams share one origin so the offset between them survives.
#[derive(Debug, Clone, Default)]
pub struct TimestampRebaser {
    origin_us: Option<i64>,
}

impl TimestampRebaser {
    /// Rebase against a fixed origin, or against the first timestamp seen.
    pub fn new(origin_us: Option<i64>) -> Self {
        Self { origin_us }
    }

    /// Use the earliest start time among `streams`.
    pub fn from_streams<'a>(streams: impl IntoIterator<Item = &'a StreamDescriptor>) -> Self {
        Self::new(streams.into_iter().filter_map(|s| s.start_time_us()).min())
    }

    /// Origin in microseconds, once known.
    pub fn origin_us(&self) -> Option<i64> {
        self.origin_us
    }

    /// Take the origin from the earliest of `packets` unless one is set.
    ///
    /// Fed the first packet of each stream, this keeps every stream's
    /// rebased timestamps non-negative.
    pub fn anchor<'a>(&mut self, packets: impl IntoIterator<Item = &'a Packet>) {
        if self.origin_us.is_some() {
            return;
        }
        self.origin_us = packets
            .into_iter()
            .filter_map(|p| p.ordering_ts().to_micros())
            .min();
        if let Some(origin) = self.origin_us {
            trace!("Timestamp origin taken from earliest packet: {}us", origin);
        }
    }

    /// Rebase one packet in place.
    pub fn rebase(&mut self, packet: &mut Packet) {
        if self.origin_us.is_none() {
            self.origin_us = packet.ordering_ts().to_micros();
            if let Some(origin) = self.origin_us {
                trace!("Timestamp origin taken from first packet: {}us", origin);
            }
        }
        let Some(origin) = self.origin_us else {
            return;
        };
        if origin == 0 {
            return;
        }
        let time_base = if packet.dts.is_valid() {
            packet.dts.time_base
        } else {
            packet.pts.time_base
        };
        let offset = TimeBase::MICROSECONDS.convert_rounded(origin, time_base);
        shift(&mut packet.pts, offset);
        shift(&mut packet.dts, offset);
    }
}

fn shift(ts: &mut Timestamp, offset: i64) {
    if ts.is_valid() {
        ts.value -= offset;
    }
}

/// Rejects packets that would move a stream's timeline backwards.
#[derive(Debug, Clone, Default)]
pub struct TimestampGuard {
    last: HashMap<u32, Timestamp>,
}

impl TimestampGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `packet` if its timestamp does not precede the previous one
    /// on the same stream. Returns `false` when the packet must be dropped.
    pub fn admit(&mut self, packet: &Packet) -> bool {
        let ts = packet.ordering_ts();
        if !ts.is_valid() {
            return true;
        }
        match self.last.get(&packet.stream_index) {
            Some(last) if ts < *last => false,
            _ => {
                self.last.insert(packet.stream_index, ts);
                true
            }
        }
    }

    /// Last admitted timestamp of a stream.
    pub fn last(&self, stream: u32) -> Option<Timestamp> {
        self.last.get(&stream).copied()
    }
}

#[derive(Debug, Default)]
struct Lane {
    queue: VecDeque<Packet>,
    ended: bool,
}

/// Orders packets of several streams by decode timestamp.
///
/// A packet is released once every open stream has something queued, so
/// nothing later can still arrive ahead of it. When the total backlog
/// reaches `max_buffered`, the earliest packet is released regardless.
#[derive(Debug)]
pub struct Interleaver {
    lanes: BTreeMap<u32, Lane>,
    buffered: usize,
    max_buffered: usize,
}

impl Interleaver {
    /// Default backlog limit.
    pub const DEFAULT_MAX_BUFFERED: usize = 256;

    pub fn new(max_buffered: usize) -> Self {
        Self {
            lanes: BTreeMap::new(),
            buffered: 0,
            max_buffered: max_buffered.max(1),
        }
    }

    /// Start tracking a stream.
    pub fn add_stream(&mut self, stream: u32) {
        self.lanes.entry(stream).or_default();
    }

    /// Queue a packet. Unknown streams are added on the fly.
    pub fn push(&mut self, packet: Packet) {
        self.lanes
            .entry(packet.stream_index)
            .or_default()
            .queue
            .push_back(packet);
        self.buffered += 1;
    }

    /// Mark a stream as finished; it no longer holds others back.
    pub fn end_stream(&mut self, stream: u32) {
        self.lanes.entry(stream).or_default().ended = true;
    }

    /// Packets currently held.
    pub fn len(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    /// Next packet that can be written safely.
    pub fn pop_ready(&mut self) -> Option<Packet> {
        let blocked = self
            .lanes
            .values()
            .any(|lane| !lane.ended && lane.queue.is_empty());
        if blocked && self.buffered < self.max_buffered {
            return None;
        }
        self.pop_earliest()
    }

    /// Next packet regardless of open streams, for the final flush.
    pub fn pop_any(&mut self) -> Option<Packet> {
        self.pop_earliest()
    }

    fn pop_earliest(&mut self) -> Option<Packet> {
        // BTreeMap iteration makes ties go to the lowest stream index.
        let stream = self
            .lanes
            .iter()
            .filter_map(|(index, lane)| lane.queue.front().map(|p| (p.ordering_ts(), *index)))
            .min()?
            .1;
        let packet = self.lanes.get_mut(&stream)?.queue.pop_front()?;
        self.buffered -= 1;
        Some(packet)
    }
}

impl Default for Interleaver {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_BUFFERED)
    }
}
