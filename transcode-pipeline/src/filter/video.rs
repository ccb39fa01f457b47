//! Video filter nodes.

use tracing::debug;
use transcode_core::{
    Duration, Frame, FrameBuffer, FrameFlags, PixelFormat, Rational, TimeBase, Timestamp,
};

use super::{FilterNode, FilterStep};
use crate::error::{PipelineError, Result};
use crate::media::{FrameFormat, MediaFrame, VideoFormat};

/// Unwrap a video frame in the expected pixel format.
fn expect_video(frame: MediaFrame, format: &VideoFormat) -> std::result::Result<Frame, String> {
    match frame {
        MediaFrame::Video(f) if f.format() == format.pixel_format => Ok(f),
        MediaFrame::Video(f) => Err(format!(
            "expected {} frame, got {}",
            format.pixel_format,
            f.format()
        )),
        MediaFrame::Audio(_) => Err("expected video frame, got audio".into()),
    }
}

fn graph_error(step: &FilterStep, msg: impl std::fmt::Display) -> PipelineError {
    PipelineError::FilterGraph(format!("{}: {}", step.name, msg))
}

/// Pass-through.
pub(super) struct Null {
    format: VideoFormat,
}

impl Null {
    pub(super) fn new(input: &VideoFormat) -> Self {
        Self { format: *input }
    }
}

impl FilterNode for Null {
    fn name(&self) -> &str {
        "null"
    }

    fn output_format(&self) -> FrameFormat {
        FrameFormat::Video(self.format)
    }

    fn process(
        &mut self,
        frame: MediaFrame,
        out: &mut Vec<MediaFrame>,
    ) -> std::result::Result<(), String> {
        out.push(MediaFrame::Video(expect_video(frame, &self.format)?));
        Ok(())
    }
}

/// Nearest-neighbour resize.
pub(super) struct Scale {
    output: VideoFormat,
}

impl Scale {
    pub(super) fn from_step(step: &FilterStep, input: &VideoFormat) -> Result<Self> {
        let width: i64 = step.required(0, &["w", "width"])?;
        let height: i64 = step.required(1, &["h", "height"])?;
        let (width, height) = resolve_scale(width, height, input.width, input.height)
            .map_err(|e| graph_error(step, e))?;
        debug!(
            "scale {}x{} -> {}x{}",
            input.width, input.height, width, height
        );
        Ok(Self {
            output: VideoFormat {
                width,
                height,
                ..*input
            },
        })
    }
}

/// Resolve requested scale dimensions against the input size.
///
/// `0` keeps the input dimension; `-n` derives the dimension from the other
/// one so the aspect ratio is kept, rounded to a multiple of `n`.
pub(crate) fn resolve_scale(
    width: i64,
    height: i64,
    in_width: u32,
    in_height: u32,
) -> std::result::Result<(u32, u32), String> {
    let (iw, ih) = (in_width as i64, in_height as i64);
    if iw == 0 || ih == 0 {
        return Err("input has no dimensions".into());
    }
    let width = if width == 0 { iw } else { width };
    let height = if height == 0 { ih } else { height };
    let (width, height) = match (width < 0, height < 0) {
        (true, true) => (iw, ih),
        (true, false) => (keep_aspect(height, iw, ih, -width), height),
        (false, true) => (width, keep_aspect(width, ih, iw, -height)),
        (false, false) => (width, height),
    };
    match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(format!("invalid output size {}x{}", width, height)),
    }
}

/// `known * num / den` rounded to the nearest multiple of `multiple`.
fn keep_aspect(known: i64, num: i64, den: i64, multiple: i64) -> i64 {
    let den = den as i128 * multiple as i128;
    let value = (known as i128 * num as i128 * 2 + den) / (2 * den);
    (value * multiple as i128) as i64
}

impl FilterNode for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn output_format(&self) -> FrameFormat {
        FrameFormat::Video(self.output)
    }

    fn process(
        &mut self,
        frame: MediaFrame,
        out: &mut Vec<MediaFrame>,
    ) -> std::result::Result<(), String> {
        let frame = expect_video(frame, &self.output)?;
        let (dst_width, dst_height) = (self.output.width, self.output.height);
        if frame.width() == dst_width && frame.height() == dst_height {
            out.push(MediaFrame::Video(frame));
            return Ok(());
        }

        let format = frame.format();
        let mut buffer = FrameBuffer::new(dst_width, dst_height, format);
        for plane in 0..format.num_planes() {
            let (sw, sh) = format.plane_dimensions(plane, frame.width(), frame.height());
            let (dw, dh) = format.plane_dimensions(plane, dst_width, dst_height);
            let (sw, sh, dw, dh) = (sw as usize, sh as usize, dw as usize, dh as usize);
            let bpp = format.bytes_per_pixel(plane);
            let (Some(src), Some(dst)) = (frame.plane(plane), buffer.plane_mut(plane)) else {
                continue;
            };
            if sw == 0 || sh == 0 {
                continue;
            }
            for y in 0..dh {
                let src_row = (y * sh / dh) * sw;
                for x in 0..dw {
                    let s = (src_row + x * sw / dw) * bpp;
                    let d = (y * dw + x) * bpp;
                    dst[d..d + bpp].copy_from_slice(&src[s..s + bpp]);
                }
            }
        }

        let mut scaled = Frame::from_buffer(buffer, frame.pts.time_base);
        scaled.copy_props(&frame);
        out.push(MediaFrame::Video(scaled));
        Ok(())
    }
}

/// Crop to a window, padding with black where the window leaves the
/// source picture.
pub(super) struct Crop {
    x: i64,
    y: i64,
    input: VideoFormat,
    output: VideoFormat,
}

impl Crop {
    pub(super) fn from_step(step: &FilterStep, input: &VideoFormat) -> Result<Self> {
        let width: u32 = step.required(0, &["w", "width", "out_w"])?;
        let height: u32 = step.required(1, &["h", "height", "out_h"])?;
        if width == 0 || height == 0 {
            return Err(graph_error(step, "crop size must be positive"));
        }
        let x: Option<u32> = step.optional(2, &["x"])?;
        let y: Option<u32> = step.optional(3, &["y"])?;
        let x = x.map_or((input.width as i64 - width as i64) / 2, i64::from);
        let y = y.map_or((input.height as i64 - height as i64) / 2, i64::from);

        let inside = x >= 0
            && y >= 0
            && x + width as i64 <= input.width as i64
            && y + height as i64 <= input.height as i64;
        if !inside {
            debug!(
                "crop {}x{}+{}+{} exceeds {}x{} input, padding with black",
                width, height, x, y, input.width, input.height
            );
        }
        Ok(Self {
            x,
            y,
            input: *input,
            output: VideoFormat {
                width,
                height,
                ..*input
            },
        })
    }
}

impl FilterNode for Crop {
    fn name(&self) -> &str {
        "crop"
    }

    fn output_format(&self) -> FrameFormat {
        FrameFormat::Video(self.output)
    }

    fn process(
        &mut self,
        frame: MediaFrame,
        out: &mut Vec<MediaFrame>,
    ) -> std::result::Result<(), String> {
        let frame = expect_video(frame, &self.input)?;
        if frame.width() != self.input.width || frame.height() != self.input.height {
            return Err(format!(
                "crop configured for {}x{}, got {}x{}",
                self.input.width,
                self.input.height,
                frame.width(),
                frame.height()
            ));
        }

        let format = frame.format();
        let mut buffer = FrameBuffer::black(self.output.width, self.output.height, format);
        for plane in 0..format.num_planes() {
            let (hsub, vsub) = if plane == 0 {
                (1, 1)
            } else {
                let (h, v) = format.chroma_subsampling();
                (h as i64, v as i64)
            };
            let px = self.x.div_euclid(hsub);
            let py = self.y.div_euclid(vsub);
            let (sw, sh) = format.plane_dimensions(plane, frame.width(), frame.height());
            let (dw, dh) = format.plane_dimensions(plane, self.output.width, self.output.height);
            let (sw, sh, dw, dh) = (sw as i64, sh as i64, dw as i64, dh as i64);
            let bpp = format.bytes_per_pixel(plane);

            let first = (-px).max(0);
            let last = dw.min(sw - px);
            if first >= last {
                continue;
            }
            let len = (last - first) as usize * bpp;
            let (Some(src), Some(dst)) = (frame.plane(plane), buffer.plane_mut(plane)) else {
                continue;
            };
            for row in 0..dh {
                let sy = py + row;
                if sy < 0 || sy >= sh {
                    continue;
                }
                let s = (sy * sw + px + first) as usize * bpp;
                let d = (row * dw + first) as usize * bpp;
                dst[d..d + len].copy_from_slice(&src[s..s + len]);
            }
        }

        let mut cropped = Frame::from_buffer(buffer, frame.pts.time_base);
        cropped.copy_props(&frame);
        out.push(MediaFrame::Video(cropped));
        Ok(())
    }
}

/// Constant frame rate conversion.
///
/// Each output slot of `1/fps` shows the most recent input frame whose
/// timestamp rounds to that slot or earlier: frames are duplicated to fill
/// gaps and dropped when several land in one slot.
pub(super) struct Rate {
    time_base: TimeBase,
    output: VideoFormat,
    next_slot: Option<i64>,
    last: Option<Frame>,
    emitted: u64,
    dropped: u64,
}

impl Rate {
    pub(super) fn from_step(step: &FilterStep, input: &VideoFormat) -> Result<Self> {
        let fps: Rational = step.required(0, &["fps", "rate", "r"])?;
        if !fps.is_positive() {
            return Err(graph_error(step, format!("frame rate {} must be positive", fps)));
        }
        let fps = fps.reduce();
        let time_base = TimeBase::from_rate(fps);
        Ok(Self {
            time_base,
            output: VideoFormat {
                frame_rate: fps,
                time_base,
                ..*input
            },
            next_slot: None,
            last: None,
            emitted: 0,
            dropped: 0,
        })
    }

    fn slot(&self, ts: Timestamp) -> Option<i64> {
        ts.rescale(self.time_base).get()
    }

    /// Emit `frame` for every slot before `end`; returns how many were emitted.
    fn emit_until(&mut self, frame: &Frame, end: i64, out: &mut Vec<MediaFrame>) -> u64 {
        let mut emitted = 0;
        let mut next = self.next_slot.unwrap_or(end);
        while next < end {
            let mut copy = frame.clone();
            copy.pts = Timestamp::new(next, self.time_base);
            copy.duration = Duration::new(1, self.time_base);
            if emitted > 0 {
                copy.flags |= FrameFlags::DUPLICATE;
                copy.flags.remove(FrameFlags::KEYFRAME);
            }
            out.push(MediaFrame::Video(copy));
            emitted += 1;
            next += 1;
        }
        self.next_slot = Some(next);
        self.emitted += emitted;
        emitted
    }
}

impl FilterNode for Rate {
    fn name(&self) -> &str {
        "fps"
    }

    fn output_format(&self) -> FrameFormat {
        FrameFormat::Video(self.output)
    }

    fn process(
        &mut self,
        frame: MediaFrame,
        out: &mut Vec<MediaFrame>,
    ) -> std::result::Result<(), String> {
        let frame = expect_video(frame, &self.output)?;
        let slot = self
            .slot(frame.pts)
            .or(self.next_slot)
            .unwrap_or(0);
        match self.last.take() {
            Some(prev) => {
                if self.emit_until(&prev, slot, out) == 0 {
                    self.dropped += 1;
                }
            }
            None => {
                if self.next_slot.is_none() {
                    self.next_slot = Some(slot);
                }
            }
        }
        self.last = Some(frame);
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<MediaFrame>) {
        let Some(prev) = self.last.take() else {
            return;
        };
        let next = self.next_slot.unwrap_or(0);
        let end = if prev.duration.value > 0 {
            self.slot(prev.pts + prev.duration)
        } else {
            None
        };
        let mut end = end.unwrap_or(next + 1);
        if end <= next && self.emitted == 0 {
            end = next + 1;
        }
        if self.emit_until(&prev, end, out) == 0 {
            self.dropped += 1;
        }
    }

    fn discarded(&self) -> u64 {
        self.dropped
    }
}

/// Conversion between the luma/chroma pixel formats.
pub(super) struct Convert {
    input: VideoFormat,
    output: VideoFormat,
}

fn is_yuv_family(format: PixelFormat) -> bool {
    matches!(
        format,
        PixelFormat::Yuv420p
            | PixelFormat::Yuv422p
            | PixelFormat::Yuv444p
            | PixelFormat::Nv12
            | PixelFormat::Gray8
    )
}

/// Whether [`Convert`] can turn `from` into `to`.
pub(crate) fn can_convert(from: PixelFormat, to: PixelFormat) -> bool {
    from == to || (is_yuv_family(from) && is_yuv_family(to))
}

impl Convert {
    pub(super) fn from_step(step: &FilterStep, input: &VideoFormat) -> Result<Self> {
        let target: PixelFormat = step.required(0, &["pix_fmts", "pix_fmt"])?;
        if !can_convert(input.pixel_format, target) {
            return Err(graph_error(
                step,
                format!("no conversion from {} to {}", input.pixel_format, target),
            ));
        }
        Ok(Self {
            input: *input,
            output: VideoFormat {
                pixel_format: target,
                ..*input
            },
        })
    }
}

/// Full-resolution chroma planes of `frame`, or `None` for grayscale.
fn upsample_chroma(frame: &Frame) -> Option<(Vec<u8>, Vec<u8>)> {
    let format = frame.format();
    let (w, h) = (frame.width() as usize, frame.height() as usize);
    let (hsub, vsub) = format.chroma_subsampling();
    let (hsub, vsub) = (hsub as usize, vsub as usize);
    let (cw, _) = format.plane_dimensions(1, frame.width(), frame.height());
    let cw = cw as usize;

    let (u_plane, v_plane, interleaved) = match format {
        PixelFormat::Nv12 => (frame.plane(1)?, frame.plane(1)?, true),
        PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Yuv444p => {
            (frame.plane(1)?, frame.plane(2)?, false)
        }
        _ => return None,
    };

    let mut u = vec![0u8; w * h];
    let mut v = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let c = (y / vsub) * cw + x / hsub;
            let (ui, vi) = if interleaved { (2 * c, 2 * c + 1) } else { (c, c) };
            u[y * w + x] = u_plane[ui];
            v[y * w + x] = v_plane[vi];
        }
    }
    Some((u, v))
}

impl FilterNode for Convert {
    fn name(&self) -> &str {
        "format"
    }

    fn output_format(&self) -> FrameFormat {
        FrameFormat::Video(self.output)
    }

    fn process(
        &mut self,
        frame: MediaFrame,
        out: &mut Vec<MediaFrame>,
    ) -> std::result::Result<(), String> {
        let frame = expect_video(frame, &self.input)?;
        let target = self.output.pixel_format;
        if frame.format() == target {
            out.push(MediaFrame::Video(frame));
            return Ok(());
        }

        let (w, h) = (frame.width(), frame.height());
        let mut buffer = FrameBuffer::new(w, h, target);
        if let (Some(src), Some(dst)) = (frame.plane(0), buffer.plane_mut(0)) {
            dst.copy_from_slice(src);
        }

        let chroma = upsample_chroma(&frame);
        let (hsub, vsub) = target.chroma_subsampling();
        let (cw, ch) = target.plane_dimensions(1, w, h);
        let full_width = w as usize;
        let sample = |cx: usize, cy: usize| -> (u8, u8) {
            match &chroma {
                Some((u, v)) => {
                    let x = (cx * hsub as usize).min(full_width - 1);
                    let y = (cy * vsub as usize).min(h as usize - 1);
                    (u[y * full_width + x], v[y * full_width + x])
                }
                None => (128, 128),
            }
        };

        match target {
            PixelFormat::Nv12 => {
                if let Some(uv) = buffer.plane_mut(1) {
                    for cy in 0..ch as usize {
                        for cx in 0..cw as usize {
                            let (u, v) = sample(cx, cy);
                            let i = 2 * (cy * cw as usize + cx);
                            uv[i] = u;
                            uv[i + 1] = v;
                        }
                    }
                }
            }
            PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Yuv444p => {
                for cy in 0..ch as usize {
                    for cx in 0..cw as usize {
                        let (u, v) = sample(cx, cy);
                        let i = cy * cw as usize + cx;
                        if let Some(plane) = buffer.plane_mut(1) {
                            plane[i] = u;
                        }
                        if let Some(plane) = buffer.plane_mut(2) {
                            plane[i] = v;
                        }
                    }
                }
            }
            _ => {}
        }

        let mut converted = Frame::from_buffer(buffer, frame.pts.time_base);
        converted.copy_props(&frame);
        out.push(MediaFrame::Video(converted));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(width: u32, height: u32, pixel_format: PixelFormat) -> VideoFormat {
        VideoFormat {
            width,
            height,
            pixel_format,
            sample_aspect_ratio: Rational::from_int(1),
            frame_rate: Rational::from_int(30),
            time_base: TimeBase::new(1, 30),
        }
    }

    fn frame_at(fmt: &VideoFormat, pts: i64, fill: u8) -> MediaFrame {
        let mut frame = Frame::from_buffer(
            FrameBuffer::new(fmt.width, fmt.height, fmt.pixel_format),
            fmt.time_base,
        );
        frame.buffer_mut().fill(fill);
        frame.pts = Timestamp::new(pts, fmt.time_base);
        frame.duration = Duration::new(1, fmt.time_base);
        MediaFrame::Video(frame)
    }

    #[test]
    fn test_resolve_scale() {
        assert_eq!(resolve_scale(1080, -1, 1920, 1080), Ok((1080, 608)));
        assert_eq!(resolve_scale(1080, -2, 1920, 1080), Ok((1080, 608)));
        assert_eq!(resolve_scale(-1, 720, 1920, 1080), Ok((1280, 720)));
        assert_eq!(resolve_scale(0, 0, 640, 480), Ok((640, 480)));
        assert_eq!(resolve_scale(-1, -1, 640, 480), Ok((640, 480)));
        assert_eq!(resolve_scale(101, -2, 200, 100), Ok((101, 50)));
        assert!(resolve_scale(100, 100, 0, 480).is_err());
    }

    #[test]
    fn test_scale_frame() {
        let input = format(4, 4, PixelFormat::Yuv420p);
        let step = FilterStep::new("scale", ["2", "2"]);
        let mut scale = Scale::from_step(&step, &input).unwrap();
        let mut out = Vec::new();
        scale.process(frame_at(&input, 5, 9), &mut out).unwrap();
        let frame = out[0].as_video().unwrap();
        assert_eq!((frame.width(), frame.height()), (2, 2));
        assert_eq!(frame.plane(0).unwrap(), &[9; 4]);
        assert_eq!(frame.plane(1).unwrap().len(), 1);
        assert_eq!(frame.pts.value, 5);
    }

    #[test]
    fn test_crop_pads_with_black() {
        let input = format(4, 2, PixelFormat::Gray8);
        let step = FilterStep::new("crop", ["4", "4"]);
        let mut crop = Crop::from_step(&step, &input).unwrap();
        let mut out = Vec::new();
        crop.process(frame_at(&input, 0, 200), &mut out).unwrap();
        let plane = out[0].as_video().unwrap().plane(0).unwrap();
        assert_eq!(&plane[0..4], &[0; 4]);
        assert_eq!(&plane[4..12], &[200; 8]);
        assert_eq!(&plane[12..16], &[0; 4]);
    }

    #[test]
    fn test_crop_offset_and_mismatch() {
        let input = format(4, 4, PixelFormat::Gray8);
        let step = FilterStep::new("crop", ["2", "2", "2", "2"]);
        let mut crop = Crop::from_step(&step, &input).unwrap();

        let mut frame = Frame::new(4, 4, PixelFormat::Gray8, input.time_base);
        if let Some(plane) = frame.plane_mut(0) {
            for (i, px) in plane.iter_mut().enumerate() {
                *px = i as u8;
            }
        }
        let mut out = Vec::new();
        crop.process(MediaFrame::Video(frame), &mut out).unwrap();
        assert_eq!(out[0].as_video().unwrap().plane(0).unwrap(), &[10, 11, 14, 15]);

        let small = format(2, 2, PixelFormat::Gray8);
        assert!(crop.process(frame_at(&small, 0, 0), &mut out).is_err());
    }

    #[test]
    fn test_rate_drops_and_duplicates() {
        let input = format(2, 2, PixelFormat::Gray8);

        // 30 -> 15: every other frame is dropped.
        let mut rate = Rate::from_step(&FilterStep::new("fps", ["15"]), &input).unwrap();
        let mut out = Vec::new();
        for pts in 0..30 {
            rate.process(frame_at(&input, pts, 0), &mut out).unwrap();
        }
        rate.flush(&mut out);
        assert_eq!(out.len(), 15);
        assert_eq!(rate.discarded(), 15);
        let end = out.last().unwrap().end_ts();
        assert_eq!(end.value, 15);

        // 30 -> 60: every frame is shown twice.
        let mut rate = Rate::from_step(&FilterStep::new("fps", ["60"]), &input).unwrap();
        let mut out = Vec::new();
        for pts in 0..30 {
            rate.process(frame_at(&input, pts, 0), &mut out).unwrap();
        }
        rate.flush(&mut out);
        assert_eq!(out.len(), 60);
        assert!(out[1].as_video().unwrap().flags.contains(FrameFlags::DUPLICATE));
        let pts: Vec<i64> = out.iter().map(|f| f.pts().value).collect();
        assert_eq!(pts, (0..60).collect::<Vec<_>>());
    }

    #[test]
    fn test_rate_ntsc() {
        let input = format(2, 2, PixelFormat::Gray8);
        let mut rate = Rate::from_step(&FilterStep::new("fps", ["29.97"]), &input).unwrap();
        assert_eq!(
            rate.output_format().video().unwrap().frame_rate,
            Rational::new(30000, 1001)
        );
        let mut out = Vec::new();
        for pts in 0..300 {
            rate.process(frame_at(&input, pts, 0), &mut out).unwrap();
        }
        rate.flush(&mut out);
        assert_eq!(out.len(), 300);
    }

    #[test]
    fn test_convert_formats() {
        let input = format(4, 2, PixelFormat::Gray8);
        let step = FilterStep::new("format", ["yuv420p"]);
        let mut convert = Convert::from_step(&step, &input).unwrap();
        let mut out = Vec::new();
        convert.process(frame_at(&input, 0, 50), &mut out).unwrap();
        let frame = out[0].as_video().unwrap();
        assert_eq!(frame.format(), PixelFormat::Yuv420p);
        assert_eq!(frame.plane(0).unwrap(), &[50; 8]);
        assert_eq!(frame.plane(1).unwrap(), &[128; 2]);

        let nv12 = format(4, 2, PixelFormat::Nv12);
        let mut convert =
            Convert::from_step(&FilterStep::new("format", ["yuv444p"]), &nv12).unwrap();
        let mut out = Vec::new();
        convert.process(frame_at(&nv12, 0, 7), &mut out).unwrap();
        assert_eq!(out[0].as_video().unwrap().plane(2).unwrap(), &[7; 8]);

        let rgb = format(4, 2, PixelFormat::Rgb24);
        assert!(Convert::from_step(&step, &rgb).is_err());
    }
}
