//! Packet abstractions for encoded media data.
//!
//! Packets carry compressed data between the demuxer and a decoder, or
//! between an encoder and the muxer. A packet owns its payload; handing it to
//! the next stage moves it.

use crate::timestamp::{Duration, TimeBase, Timestamp};
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Flags for packet properties.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u32 {
        /// This packet contains a keyframe.
        const KEYFRAME = 0x0001;
        /// Packet data is corrupted.
        const CORRUPT = 0x0002;
        /// Packet should be discarded.
        const DISCARD = 0x0004;
    }
}

/// An encoded media packet.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    /// Presentation timestamp.
    pub pts: Timestamp,
    /// Decode timestamp.
    pub dts: Timestamp,
    /// Duration of the packet.
    pub duration: Duration,
    /// Stream index this packet belongs to.
    pub stream_index: u32,
    /// Packet flags.
    pub flags: PacketFlags,
}

impl Packet {
    /// Create a new packet owning `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pts: Timestamp::none(),
            dts: Timestamp::none(),
            duration: Duration::zero(),
            stream_index: 0,
            flags: PacketFlags::empty(),
        }
    }

    /// Get the packet data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the payload out of the packet.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Get the size of the packet data.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check if this packet is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check if this is a keyframe packet.
    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(PacketFlags::KEYFRAME)
    }

    /// Set the keyframe flag.
    pub fn set_keyframe(&mut self, keyframe: bool) {
        self.flags.set(PacketFlags::KEYFRAME, keyframe);
    }

    /// The timestamp used for ordering: DTS when known, otherwise PTS.
    pub fn ordering_ts(&self) -> Timestamp {
        if self.dts.is_valid() {
            self.dts
        } else {
            self.pts
        }
    }

    /// Rescale timestamps to a new time base.
    pub fn rescale(&mut self, target: TimeBase) {
        self.pts = self.pts.rescale(target);
        self.dts = self.dts.rescale(target);
        self.duration = self.duration.rescale(target);
    }

    /// Builder: set timestamps.
    pub fn with_timestamps(mut self, pts: Timestamp, dts: Timestamp) -> Self {
        self.pts = pts;
        self.dts = dts;
        self
    }

    /// Builder: set duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Builder: set stream index.
    pub fn with_stream_index(mut self, index: u32) -> Self {
        self.stream_index = index;
        self
    }

    /// Builder: set flags.
    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.size())
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("stream_index", &self.stream_index)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_keyframe() {
        let mut packet = Packet::default();
        assert!(!packet.is_keyframe());
        packet.set_keyframe(true);
        assert!(packet.is_keyframe());
        packet.set_keyframe(false);
        assert!(!packet.is_keyframe());
    }

    #[test]
    fn test_ordering_ts_falls_back_to_pts() {
        let tb = TimeBase::MILLISECONDS;
        let packet = Packet::new(vec![1]).with_timestamps(Timestamp::new(40, tb), Timestamp::none());
        assert_eq!(packet.ordering_ts().value, 40);
    }

    #[test]
    fn test_packet_rescale() {
        let mut packet = Packet::new(vec![0; 4])
            .with_timestamps(
                Timestamp::new(1, TimeBase::new(1, 25)),
                Timestamp::new(1, TimeBase::new(1, 25)),
            )
            .with_duration(Duration::new(1, TimeBase::new(1, 25)));
        packet.rescale(TimeBase::MILLISECONDS);
        assert_eq!(packet.pts.value, 40);
        assert_eq!(packet.dts.value, 40);
        assert_eq!(packet.duration.value, 40);
        assert_eq!(packet.into_data().len(), 4);
    }
}
