//! Audio filter nodes.

use byteorder::{ByteOrder, LittleEndian};
use transcode_core::{Sample, SampleBuffer, SampleFormat};

use super::{FilterNode, FilterStep};
use crate::error::{PipelineError, Result};
use crate::media::{AudioFormat, FrameFormat, MediaFrame};

fn expect_audio(frame: MediaFrame, format: &AudioFormat) -> std::result::Result<Sample, String> {
    match frame {
        MediaFrame::Audio(s) if s.format() == format.sample_format => Ok(s),
        MediaFrame::Audio(s) => Err(format!(
            "expected {} samples, got {}",
            format.sample_format,
            s.format()
        )),
        MediaFrame::Video(_) => Err("expected audio frame, got video".into()),
    }
}

/// Decode little-endian samples to normalized floats.
fn read_samples(format: SampleFormat, bytes: &[u8]) -> Vec<f64> {
    let width = format.bytes_per_sample();
    bytes
        .chunks_exact(width)
        .map(|b| match format {
            SampleFormat::U8 => (b[0] as f64 - 128.0) / 128.0,
            SampleFormat::S16 | SampleFormat::S16p => LittleEndian::read_i16(b) as f64 / 32768.0,
            SampleFormat::S32 => LittleEndian::read_i32(b) as f64 / 2_147_483_648.0,
            SampleFormat::F32 | SampleFormat::F32p => LittleEndian::read_f32(b) as f64,
        })
        .collect()
}

/// Encode normalized floats; integer formats saturate.
fn write_samples(format: SampleFormat, values: &[f64], bytes: &mut [u8]) {
    let width = format.bytes_per_sample();
    for (value, b) in values.iter().zip(bytes.chunks_exact_mut(width)) {
        match format {
            SampleFormat::U8 => b[0] = (value * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8,
            SampleFormat::S16 | SampleFormat::S16p => LittleEndian::write_i16(
                b,
                (value * 32768.0).round().clamp(-32768.0, 32767.0) as i16,
            ),
            SampleFormat::S32 => LittleEndian::write_i32(
                b,
                (value * 2_147_483_648.0)
                    .round()
                    .clamp(i32::MIN as f64, i32::MAX as f64) as i32,
            ),
            SampleFormat::F32 | SampleFormat::F32p => LittleEndian::write_f32(b, *value as f32),
        }
    }
}

/// Pass-through.
pub(super) struct ANull {
    format: AudioFormat,
}

impl ANull {
    pub(super) fn new(input: &AudioFormat) -> Self {
        Self { format: *input }
    }
}

impl FilterNode for ANull {
    fn name(&self) -> &str {
        "anull"
    }

    fn output_format(&self) -> FrameFormat {
        FrameFormat::Audio(self.format)
    }

    fn process(
        &mut self,
        frame: MediaFrame,
        out: &mut Vec<MediaFrame>,
    ) -> std::result::Result<(), String> {
        out.push(MediaFrame::Audio(expect_audio(frame, &self.format)?));
        Ok(())
    }
}

/// Gain adjustment.
pub(super) struct Volume {
    format: AudioFormat,
    gain: f64,
}

impl Volume {
    /// Accepts a decibel value (`"-6dB"`) or a linear factor (`"0.5"`).
    pub(super) fn from_step(step: &FilterStep, input: &AudioFormat) -> Result<Self> {
        let raw = step.arg(0, &["volume"]).ok_or_else(|| {
            PipelineError::FilterGraph("volume: missing argument 'volume'".into())
        })?;
        let invalid = || PipelineError::FilterGraph(format!("volume: invalid gain '{}'", raw));
        let lower = raw.to_ascii_lowercase();
        let gain = match lower.strip_suffix("db") {
            Some(db) => {
                let db: f64 = db.trim().parse().map_err(|_| invalid())?;
                10f64.powf(db / 20.0)
            }
            None => raw.parse::<f64>().map_err(|_| invalid())?,
        };
        if !gain.is_finite() || gain < 0.0 {
            return Err(invalid());
        }
        Ok(Self {
            format: *input,
            gain,
        })
    }
}

impl FilterNode for Volume {
    fn name(&self) -> &str {
        "volume"
    }

    fn output_format(&self) -> FrameFormat {
        FrameFormat::Audio(self.format)
    }

    fn process(
        &mut self,
        frame: MediaFrame,
        out: &mut Vec<MediaFrame>,
    ) -> std::result::Result<(), String> {
        let mut sample = expect_audio(frame, &self.format)?;
        let format = sample.format();
        for plane in sample.buffer_mut().planes_mut() {
            let scaled: Vec<f64> = read_samples(format, plane)
                .into_iter()
                .map(|v| v * self.gain)
                .collect();
            write_samples(format, &scaled, plane);
        }
        out.push(MediaFrame::Audio(sample));
        Ok(())
    }
}

/// Sample format conversion.
pub(super) struct Resample {
    input: AudioFormat,
    output: AudioFormat,
}

impl Resample {
    pub(super) fn from_step(step: &FilterStep, input: &AudioFormat) -> Result<Self> {
        let target: SampleFormat = step.required(0, &["sample_fmts", "sample_fmt"])?;
        Ok(Self {
            input: *input,
            output: AudioFormat {
                sample_format: target,
                ..*input
            },
        })
    }
}

impl FilterNode for Resample {
    fn name(&self) -> &str {
        "aformat"
    }

    fn output_format(&self) -> FrameFormat {
        FrameFormat::Audio(self.output)
    }

    fn process(
        &mut self,
        frame: MediaFrame,
        out: &mut Vec<MediaFrame>,
    ) -> std::result::Result<(), String> {
        let sample = expect_audio(frame, &self.input)?;
        let target = self.output.sample_format;
        if sample.format() == target {
            out.push(MediaFrame::Audio(sample));
            return Ok(());
        }

        let source = sample.format();
        let channels = sample.channels() as usize;
        let frames = sample.num_samples();
        let interleaved: Vec<f64> = if source.is_planar() {
            let planes: Vec<Vec<f64>> = (0..channels as u32)
                .map(|c| {
                    sample
                        .buffer()
                        .channel(c)
                        .map(|data| read_samples(source, data))
                        .unwrap_or_default()
                })
                .collect();
            (0..frames)
                .flat_map(|i| planes.iter().map(move |p| p.get(i).copied().unwrap_or(0.0)))
                .collect()
        } else {
            read_samples(source, sample.buffer().data())
        };

        let mut buffer = SampleBuffer::new(
            frames,
            target,
            sample.channel_layout(),
            sample.sample_rate(),
        );
        if target.is_planar() {
            for (c, plane) in buffer.planes_mut().enumerate() {
                let values: Vec<f64> = interleaved
                    .iter()
                    .skip(c)
                    .step_by(channels.max(1))
                    .copied()
                    .collect();
                write_samples(target, &values, plane);
            }
        } else {
            write_samples(target, &interleaved, buffer.data_mut());
        }

        let mut converted = Sample::from_buffer(buffer);
        converted.stream_index = sample.stream_index;
        converted.pts = sample.pts;
        converted.duration = sample.duration;
        out.push(MediaFrame::Audio(converted));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transcode_core::{ChannelLayout, TimeBase, Timestamp};

    fn format(sample_format: SampleFormat) -> AudioFormat {
        AudioFormat {
            sample_rate: 48000,
            channel_layout: ChannelLayout::Stereo,
            sample_format,
            time_base: TimeBase::new(1, 48000),
        }
    }

    fn s16_frame(values: &[i16]) -> MediaFrame {
        let mut sample = Sample::new(values.len() / 2, SampleFormat::S16, ChannelLayout::Stereo, 48000);
        assert!(sample.buffer_mut().write_s16(values));
        sample.pts = Timestamp::new(960, TimeBase::new(1, 48000));
        MediaFrame::Audio(sample)
    }

    #[test]
    fn test_volume_db_and_linear() {
        let input = format(SampleFormat::S16);
        let mut half = Volume::from_step(&FilterStep::new("volume", ["0.5"]), &input).unwrap();
        let mut out = Vec::new();
        half.process(s16_frame(&[1000, -1000, 32767, 0]), &mut out).unwrap();
        let values = out[0].as_audio().unwrap().buffer().to_s16().unwrap();
        assert_eq!(values, vec![500, -500, 16384, 0]);

        let boost = Volume::from_step(&FilterStep::new("volume", ["20dB"]), &input).unwrap();
        assert!((boost.gain - 10.0).abs() < 1e-9);
        assert!(Volume::from_step(&FilterStep::new("volume", ["loud"]), &input).is_err());
    }

    #[test]
    fn test_volume_saturates() {
        let input = format(SampleFormat::S16);
        let mut boost = Volume::from_step(&FilterStep::new("volume", ["4"]), &input).unwrap();
        let mut out = Vec::new();
        boost.process(s16_frame(&[20000, -20000]), &mut out).unwrap();
        let values = out[0].as_audio().unwrap().buffer().to_s16().unwrap();
        assert_eq!(values, vec![32767, -32768]);
    }

    #[test]
    fn test_resample_roundtrip_through_planar_float() {
        let input = format(SampleFormat::S16);
        let mut to_float =
            Resample::from_step(&FilterStep::new("aformat", ["f32p"]), &input).unwrap();
        let mut out = Vec::new();
        to_float.process(s16_frame(&[100, -200, 300, -400]), &mut out).unwrap();
        let planar = out.pop().unwrap();
        assert_eq!(planar.as_audio().unwrap().format(), SampleFormat::F32p);
        assert_eq!(planar.pts().value, 960);

        let mut back = Resample::from_step(
            &FilterStep::new("aformat", ["s16"]),
            &format(SampleFormat::F32p),
        )
        .unwrap();
        back.process(planar, &mut out).unwrap();
        let values = out[0].as_audio().unwrap().buffer().to_s16().unwrap();
        assert_eq!(values, vec![100, -200, 300, -400]);
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let mut anull = ANull::new(&format(SampleFormat::S16));
        let video = MediaFrame::Video(transcode_core::Frame::new(
            2,
            2,
            transcode_core::PixelFormat::Gray8,
            TimeBase::new(1, 25),
        ));
        assert!(anull.process(video, &mut Vec::new()).is_err());
    }
}
