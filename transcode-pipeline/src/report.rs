//! Run statistics and outcome.

use std::time::Duration;

use serde::Serialize;
use transcode_core::MediaKind;

use crate::error::PipelineError;
use crate::pipeline::PipelineState;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Output finalized, nothing dropped.
    Success,
    /// Output finalized, but the run was cancelled or dropped units.
    PartialSuccess,
    /// A fatal error stopped the run.
    Failure,
}

impl Outcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::PartialSuccess => 2,
            Outcome::Failure => 1,
        }
    }
}

/// Counters for one transcoded stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Index of the stream in the input.
    pub input_index: u32,
    /// Index of the stream in the output.
    pub output_index: u32,
    pub kind: Option<MediaKind>,
    pub packets_read: u64,
    pub packets_decoded: u64,
    pub frames_decoded: u64,
    pub frames_filtered: u64,
    /// Frames removed on purpose by rate conversion.
    pub frames_discarded: u64,
    pub frames_encoded: u64,
    pub packets_encoded: u64,
    pub packets_written: u64,
    /// Packets lost to decode errors or timestamp violations.
    pub dropped_packets: u64,
    /// Frames lost to filter or encode errors.
    pub dropped_frames: u64,
    /// Duration of the written stream.
    pub duration_us: Option<i64>,
}

impl StreamStats {
    pub(crate) fn new(input_index: u32, output_index: u32, kind: MediaKind) -> Self {
        Self {
            input_index,
            output_index,
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Add the counters collected by another part of the same stream.
    pub(crate) fn absorb(&mut self, other: &StreamStats) {
        self.packets_read += other.packets_read;
        self.packets_decoded += other.packets_decoded;
        self.frames_decoded += other.frames_decoded;
        self.frames_filtered += other.frames_filtered;
        self.frames_discarded += other.frames_discarded;
        self.frames_encoded += other.frames_encoded;
        self.packets_encoded += other.packets_encoded;
        self.packets_written += other.packets_written;
        self.dropped_packets += other.dropped_packets;
        self.dropped_frames += other.dropped_frames;
        if other.duration_us.is_some() {
            self.duration_us = other.duration_us;
        }
    }

    /// Units lost to errors.
    pub fn dropped(&self) -> u64 {
        self.dropped_packets + self.dropped_frames
    }
}

/// Counters for a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub streams: Vec<StreamStats>,
    /// Packets read from the input, selected or not.
    pub packets_read: u64,
    /// Packets of streams that were not selected.
    pub packets_ignored: u64,
    /// Wall-clock time spent running.
    pub elapsed: Duration,
}

impl PipelineStats {
    /// Units lost to errors across all streams.
    pub fn dropped(&self) -> u64 {
        self.streams.iter().map(StreamStats::dropped).sum()
    }

    /// Frames encoded across all streams.
    pub fn frames_encoded(&self) -> u64 {
        self.streams.iter().map(|s| s.frames_encoded).sum()
    }

    /// Statistics of the output stream at `index`.
    pub fn stream(&self, index: u32) -> Option<&StreamStats> {
        self.streams.iter().find(|s| s.output_index == index)
    }
}

/// Final account of a run.
#[derive(Debug, Clone)]
pub struct TranscodeReport {
    pub outcome: Outcome,
    pub state: PipelineState,
    /// First fatal error, if the run failed.
    pub error: Option<PipelineError>,
    pub cancelled: bool,
    pub stats: PipelineStats,
}

impl TranscodeReport {
    pub(crate) fn new(
        state: PipelineState,
        error: Option<PipelineError>,
        cancelled: bool,
        finalized: bool,
        stats: PipelineStats,
    ) -> Self {
        let outcome = if error.is_some() || !finalized {
            Outcome::Failure
        } else if cancelled || stats.dropped() > 0 {
            Outcome::PartialSuccess
        } else {
            Outcome::Success
        };
        Self {
            outcome,
            state,
            error,
            cancelled,
            stats,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(dropped_frames: u64) -> PipelineStats {
        let mut stream = StreamStats::new(0, 0, MediaKind::Video);
        stream.frames_encoded = 10;
        stream.dropped_frames = dropped_frames;
        PipelineStats {
            streams: vec![stream],
            ..PipelineStats::default()
        }
    }

    #[test]
    fn test_outcome() {
        let closed = PipelineState::Closed;
        assert_eq!(
            TranscodeReport::new(closed, None, false, true, stats(0)).outcome,
            Outcome::Success
        );
        assert_eq!(
            TranscodeReport::new(closed, None, false, true, stats(1)).outcome,
            Outcome::PartialSuccess
        );
        assert_eq!(
            TranscodeReport::new(closed, None, true, true, stats(0)).outcome,
            Outcome::PartialSuccess
        );
        let failed = TranscodeReport::new(
            PipelineState::Failed,
            Some(PipelineError::Mux("disk full".into())),
            false,
            false,
            stats(0),
        );
        assert_eq!(failed.outcome, Outcome::Failure);
        assert_eq!(failed.outcome.exit_code(), 1);
    }

    #[test]
    fn test_absorb() {
        let mut decode = StreamStats::new(3, 0, MediaKind::Audio);
        decode.packets_read = 5;
        let mut write = StreamStats::default();
        write.packets_written = 4;
        write.duration_us = Some(1_000);
        decode.absorb(&write);
        assert_eq!(decode.packets_read, 5);
        assert_eq!(decode.packets_written, 4);
        assert_eq!(decode.duration_us, Some(1_000));
        assert_eq!(decode.kind, Some(MediaKind::Audio));
    }

    #[test]
    fn test_stats_serialize() {
        let json = serde_json::to_value(stats(2)).unwrap();
        assert_eq!(json["streams"][0]["dropped_frames"], 2);
        assert_eq!(json["streams"][0]["frames_encoded"], 10);
        assert_eq!(json["streams"][0]["kind"], "video");
    }
}
