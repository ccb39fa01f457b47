//! Video frame buffer abstractions.
//!
//! Provides types for representing decoded video frames in various pixel formats.

use crate::error::Error;
use crate::rational::Rational;
use crate::timestamp::{Duration, TimeBase, Timestamp};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixel format for video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, 12bpp (1 Cr & Cb sample per 2x2 Y samples).
    Yuv420p,
    /// Planar YUV 4:2:2, 16bpp (1 Cr & Cb sample per 2x1 Y samples).
    Yuv422p,
    /// Planar YUV 4:4:4, 24bpp (no subsampling).
    Yuv444p,
    /// Y plane followed by an interleaved UV plane, 4:2:0.
    Nv12,
    /// Packed RGB24, 24bpp.
    Rgb24,
    /// Packed RGBA, 32bpp.
    Rgba,
    /// Grayscale, 8bpp.
    Gray8,
}

impl PixelFormat {
    /// All formats, in the order encoders usually advertise them.
    pub const ALL: [PixelFormat; 7] = [
        Self::Yuv420p,
        Self::Yuv422p,
        Self::Yuv444p,
        Self::Nv12,
        Self::Rgb24,
        Self::Rgba,
        Self::Gray8,
    ];

    /// Get the number of planes for this pixel format.
    pub fn num_planes(&self) -> usize {
        match self {
            Self::Yuv420p | Self::Yuv422p | Self::Yuv444p => 3,
            Self::Nv12 => 2,
            Self::Rgb24 | Self::Rgba | Self::Gray8 => 1,
        }
    }

    /// Get chroma subsampling factors (horizontal, vertical).
    pub fn chroma_subsampling(&self) -> (u32, u32) {
        match self {
            Self::Yuv420p | Self::Nv12 => (2, 2),
            Self::Yuv422p => (2, 1),
            _ => (1, 1),
        }
    }

    /// Bytes used by one pixel of `plane` (interleaved components count once
    /// per component).
    pub fn bytes_per_pixel(&self, plane: usize) -> usize {
        match (self, plane) {
            (Self::Rgb24, _) => 3,
            (Self::Rgba, _) => 4,
            (Self::Nv12, 1) => 2,
            _ => 1,
        }
    }

    /// Pixel dimensions of `plane` for a frame of `width`x`height`.
    pub fn plane_dimensions(&self, plane: usize, width: u32, height: u32) -> (u32, u32) {
        if plane == 0 {
            return (width, height);
        }
        let (hsub, vsub) = self.chroma_subsampling();
        (width.div_ceil(hsub), height.div_ceil(vsub))
    }

    /// Row length in bytes of `plane` for a frame `width` pixels wide.
    pub fn row_bytes(&self, plane: usize, width: u32) -> usize {
        let (plane_width, _) = self.plane_dimensions(plane, width, 1);
        plane_width as usize * self.bytes_per_pixel(plane)
    }

    /// Calculate the size of a plane for given dimensions.
    pub fn plane_size(&self, plane: usize, width: u32, height: u32) -> usize {
        let (_, rows) = self.plane_dimensions(plane, width, height);
        self.row_bytes(plane, width) * rows as usize
    }

    /// Total size of all planes for given dimensions.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        (0..self.num_planes())
            .map(|p| self.plane_size(p, width, height))
            .sum()
    }

    /// Byte value that renders black in `plane`.
    pub fn black_value(&self, plane: usize) -> u8 {
        match self {
            Self::Yuv420p | Self::Yuv422p | Self::Yuv444p | Self::Nv12 => {
                if plane == 0 {
                    16
                } else {
                    128
                }
            }
            Self::Rgb24 | Self::Rgba | Self::Gray8 => 0,
        }
    }

    /// Canonical lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
            Self::Yuv422p => "yuv422p",
            Self::Yuv444p => "yuv444p",
            Self::Nv12 => "nv12",
            Self::Rgb24 => "rgb24",
            Self::Rgba => "rgba",
            Self::Gray8 => "gray8",
        }
    }

    /// Stable numeric identifier used in container headers.
    pub fn id(&self) -> u8 {
        match self {
            Self::Yuv420p => 0,
            Self::Yuv422p => 1,
            Self::Yuv444p => 2,
            Self::Nv12 => 3,
            Self::Rgb24 => 4,
            Self::Rgba => 5,
            Self::Gray8 => 6,
        }
    }

    /// Inverse of [`PixelFormat::id`].
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.id() == id)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::unsupported(format!("pixel format '{}'", s)))
    }
}

bitflags! {
    /// Frame flags indicating frame properties.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        /// This is a keyframe (I-frame).
        const KEYFRAME = 0x0001;
        /// Frame is corrupted or incomplete.
        const CORRUPT = 0x0002;
        /// Frame was synthesized by a rate conversion.
        const DUPLICATE = 0x0004;
    }
}

/// A decoded video frame.
#[derive(Clone, PartialEq)]
pub struct Frame {
    buffer: FrameBuffer,
    /// Stream this frame was decoded from.
    pub stream_index: u32,
    /// Presentation timestamp.
    pub pts: Timestamp,
    /// Frame duration.
    pub duration: Duration,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Sample (pixel) aspect ratio.
    pub sample_aspect_ratio: Rational,
}

impl Frame {
    /// Create a new zero-filled frame with the specified parameters.
    pub fn new(width: u32, height: u32, format: PixelFormat, time_base: TimeBase) -> Self {
        Self::from_buffer(FrameBuffer::new(width, height, format), time_base)
    }

    /// Create a frame from an existing buffer.
    pub fn from_buffer(buffer: FrameBuffer, time_base: TimeBase) -> Self {
        Self {
            buffer,
            stream_index: 0,
            pts: Timestamp::new(Timestamp::NONE, time_base),
            duration: Duration::new(0, time_base),
            flags: FrameFlags::empty(),
            sample_aspect_ratio: Rational::from_int(1),
        }
    }

    /// Get the frame width.
    pub fn width(&self) -> u32 {
        self.buffer.width
    }

    /// Get the frame height.
    pub fn height(&self) -> u32 {
        self.buffer.height
    }

    /// Get the pixel format.
    pub fn format(&self) -> PixelFormat {
        self.buffer.format
    }

    /// Check if this is a keyframe.
    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(FrameFlags::KEYFRAME)
    }

    /// Get the frame buffer.
    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    /// Get a mutable reference to the frame buffer.
    pub fn buffer_mut(&mut self) -> &mut FrameBuffer {
        &mut self.buffer
    }

    /// Get a plane's data.
    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        self.buffer.plane(index)
    }

    /// Get a mutable reference to a plane's data.
    pub fn plane_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.buffer.plane_mut(index)
    }

    /// Get the stride (bytes per row) for a plane.
    pub fn stride(&self, plane: usize) -> usize {
        self.buffer.stride(plane)
    }

    /// Copy the timing and identity of `other` onto this frame.
    pub fn copy_props(&mut self, other: &Frame) {
        self.stream_index = other.stream_index;
        self.pts = other.pts;
        self.duration = other.duration;
        self.flags = other.flags;
        self.sample_aspect_ratio = other.sample_aspect_ratio;
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("stream_index", &self.stream_index)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("format", &self.format())
            .field("pts", &self.pts)
            .field("flags", &self.flags)
            .finish()
    }
}

/// A buffer for storing frame pixel data.
///
/// Planes are tightly packed: the stride of a plane equals its row length.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: PixelFormat,
    planes: Vec<Vec<u8>>,
}

impl FrameBuffer {
    /// Create a new zero-filled frame buffer.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let planes = (0..format.num_planes())
            .map(|p| vec![0u8; format.plane_size(p, width, height)])
            .collect();
        Self {
            width,
            height,
            format,
            planes,
        }
    }

    /// Create a buffer filled with black.
    pub fn black(width: u32, height: u32, format: PixelFormat) -> Self {
        let mut buffer = Self::new(width, height, format);
        for (index, plane) in buffer.planes.iter_mut().enumerate() {
            plane.fill(format.black_value(index));
        }
        buffer
    }

    /// Build a buffer from contiguous plane data (plane 0 first).
    pub fn from_bytes(width: u32, height: u32, format: PixelFormat, data: &[u8]) -> Option<Self> {
        if data.len() != format.frame_size(width, height) {
            return None;
        }
        let mut planes = Vec::with_capacity(format.num_planes());
        let mut offset = 0;
        for p in 0..format.num_planes() {
            let size = format.plane_size(p, width, height);
            planes.push(data[offset..offset + size].to_vec());
            offset += size;
        }
        Some(Self {
            width,
            height,
            format,
            planes,
        })
    }

    /// Concatenate all planes (plane 0 first).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        for plane in &self.planes {
            out.extend_from_slice(plane);
        }
        out
    }

    /// Get the number of planes.
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Get a plane's data.
    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        self.planes.get(index).map(|p| p.as_slice())
    }

    /// Get a mutable reference to a plane's data.
    pub fn plane_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.planes.get_mut(index).map(|p| p.as_mut_slice())
    }

    /// Get the stride for a plane.
    pub fn stride(&self, plane: usize) -> usize {
        if plane < self.planes.len() {
            self.format.row_bytes(plane, self.width)
        } else {
            0
        }
    }

    /// Get the total size of all planes in bytes.
    pub fn total_size(&self) -> usize {
        self.planes.iter().map(|p| p.len()).sum()
    }

    /// Fill all planes with a value.
    pub fn fill(&mut self, value: u8) {
        for plane in &mut self.planes {
            plane.fill(value);
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("planes", &self.planes.len())
            .finish()
    }
}
