use std::{fmt, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};

use super::{AudioFormat, MAX_AUDIO_BYTES};
use crate::{clock::PtpTimestamp, Error, Result};

/// A block of audio samples.
///
/// Float samples are absolute: `1.0` is the reference level. The
/// `reference_level` field only matters for 16-bit samples, where it is the
/// headroom in dB between the reference level and full scale.
#[derive(Clone)]
pub struct AudioFrame {
    pub format: AudioFormat,
    /// Headroom of 16-bit full scale above the reference level, in dB.
    pub reference_level: i32,
    pub sample_rate: i32,
    pub channels: i32,
    pub samples: i32,
    /// Bytes between channel starts for planar layouts; `0` when interleaved.
    pub channel_stride: i32,
    pub timestamp: PtpTimestamp,
    pub timecode: i64,
    pub data: Bytes,
    pub metadata: Option<String>,
}

impl fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioFrame")
            .field("format", &self.format)
            .field("reference_level", &self.reference_level)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("samples", &self.samples)
            .field("channel_stride", &self.channel_stride)
            .field("timestamp", &self.timestamp)
            .field("timecode", &self.timecode)
            .field("data (bytes)", &self.data.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Default for AudioFrame {
    fn default() -> Self {
        AudioFrame::builder().build()
    }
}

/// Scale factor between 16-bit full scale and float samples.
fn int16_full_scale(reference_level: i32) -> f32 {
    10f32.powf(reference_level as f32 / 20.0)
}

impl AudioFrame {
    pub fn builder() -> AudioFrameBuilder {
        AudioFrameBuilder::new()
    }

    /// Minimum buffer length for the frame's layout.
    ///
    /// Computed in 64 bits; a length that does not fit `usize` saturates.
    pub fn required_len(&self) -> usize {
        let channels = self.channels.max(0) as u64;
        let samples = self.samples.max(0) as u64;
        let len = if self.format.is_planar() {
            self.channel_stride.max(0) as u64 * channels
        } else {
            samples * channels * self.format.bytes_per_sample() as u64
        };
        usize::try_from(len).unwrap_or(usize::MAX)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate <= 0 || self.samples <= 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(1_000_000_000u64 * self.samples as u64 / self.sample_rate as u64)
    }

    /// Checks the frame against its declared layout.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate <= 0 || self.channels <= 0 || self.samples < 0 {
            return Err(Error::InvalidFrame(format!(
                "Invalid audio shape: {} Hz, {} channels, {} samples",
                self.sample_rate, self.channels, self.samples
            )));
        }
        if self.format.is_planar() {
            let min_stride = i64::from(self.samples) * 4;
            if i64::from(self.channel_stride) < min_stride {
                return Err(Error::InvalidFrame(format!(
                    "Channel stride {} is smaller than {} samples of f32",
                    self.channel_stride, self.samples
                )));
            }
        }
        let required = self.required_len();
        if required > MAX_AUDIO_BYTES {
            return Err(Error::InvalidFrame(format!(
                "Audio frame exceeds maximum size: {required} bytes > {MAX_AUDIO_BYTES} bytes"
            )));
        }
        if self.data.len() < required {
            return Err(Error::InvalidFrame(format!(
                "Buffer holds {} bytes but {:?} audio needs {required}",
                self.data.len(),
                self.format
            )));
        }
        Ok(())
    }

    /// One sample as a float relative to the reference level.
    pub fn sample(&self, channel: usize, index: usize) -> Option<f32> {
        let channels = self.channels.max(0) as usize;
        if channel >= channels || index >= self.samples.max(0) as usize {
            return None;
        }
        let interleaved = index.checked_mul(channels)?.checked_add(channel)?;
        match self.format {
            AudioFormat::Float32Separate => {
                let stride = usize::try_from(self.channel_stride).ok()?;
                let offset = channel.checked_mul(stride)?.checked_add(index.checked_mul(4)?)?;
                read_f32(&self.data, offset)
            }
            AudioFormat::Float32Interleaved => read_f32(&self.data, interleaved.checked_mul(4)?),
            AudioFormat::Int16Interleaved => {
                let offset = interleaved.checked_mul(2)?;
                let bytes = self.data.get(offset..offset.checked_add(2)?)?;
                let raw = i16::from_le_bytes([bytes[0], bytes[1]]);
                Some(raw as f32 / 32767.0 * int16_full_scale(self.reference_level))
            }
        }
    }

    /// All samples of one channel as floats relative to the reference level.
    pub fn channel_data(&self, channel: usize) -> Option<Vec<f32>> {
        (0..self.samples.max(0) as usize)
            .map(|index| self.sample(channel, index))
            .collect()
    }

    /// Repacks the samples into `format`, expressing 16-bit output with the
    /// given reference level. Sample rate and channel count are unchanged.
    ///
    /// Returns the frame itself (sharing its buffer) when nothing changes.
    pub fn convert(&self, format: AudioFormat, reference_level: i32) -> Result<AudioFrame> {
        self.validate()?;

        let same_scale =
            format != AudioFormat::Int16Interleaved || reference_level == self.reference_level;
        if format == self.format && same_scale {
            return Ok(AudioFrame {
                reference_level,
                ..self.clone()
            });
        }

        let channels = self.channels as usize;
        let samples = self.samples as usize;
        let mut out = BytesMut::with_capacity(samples * channels * format.bytes_per_sample());
        let sample = |channel, index| self.sample(channel, index).unwrap_or(0.0);

        match format {
            AudioFormat::Float32Separate => {
                for channel in 0..channels {
                    for index in 0..samples {
                        out.put_f32_le(sample(channel, index));
                    }
                }
            }
            AudioFormat::Float32Interleaved => {
                for index in 0..samples {
                    for channel in 0..channels {
                        out.put_f32_le(sample(channel, index));
                    }
                }
            }
            AudioFormat::Int16Interleaved => {
                let scale = 32767.0 / int16_full_scale(reference_level);
                for index in 0..samples {
                    for channel in 0..channels {
                        let value = (sample(channel, index) * scale).round();
                        out.put_i16_le(value.clamp(-32768.0, 32767.0) as i16);
                    }
                }
            }
        }

        Ok(AudioFrame {
            format,
            reference_level,
            channel_stride: if format.is_planar() {
                self.samples * 4
            } else {
                0
            },
            data: out.freeze(),
            ..self.clone()
        })
    }
}

fn read_f32(data: &[u8], offset: usize) -> Option<f32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Builder for configuring an AudioFrame with ergonomic method chaining
#[derive(Debug, Clone, Default)]
pub struct AudioFrameBuilder {
    format: Option<AudioFormat>,
    reference_level: Option<i32>,
    sample_rate: Option<i32>,
    channels: Option<i32>,
    samples: Option<i32>,
    timestamp: Option<PtpTimestamp>,
    timecode: Option<i64>,
    data: Option<Bytes>,
    metadata: Option<String>,
}

impl AudioFrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn format(mut self, format: AudioFormat) -> Self {
        self.format = Some(format);
        self
    }

    #[must_use]
    pub fn reference_level(mut self, db: i32) -> Self {
        self.reference_level = Some(db);
        self
    }

    #[must_use]
    pub fn sample_rate(mut self, rate: i32) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    #[must_use]
    pub fn channels(mut self, channels: i32) -> Self {
        self.channels = Some(channels);
        self
    }

    #[must_use]
    pub fn samples(mut self, samples: i32) -> Self {
        self.samples = Some(samples);
        self
    }

    #[must_use]
    pub fn timestamp(mut self, ts: PtpTimestamp) -> Self {
        self.timestamp = Some(ts);
        self
    }

    #[must_use]
    pub fn timecode(mut self, tc: i64) -> Self {
        self.timecode = Some(tc);
        self
    }

    /// Raw little-endian sample bytes in the configured layout.
    #[must_use]
    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Float samples in the configured float layout (planar: channel after
    /// channel; interleaved: frame after frame).
    #[must_use]
    pub fn data_f32(mut self, samples: &[f32]) -> Self {
        let mut buf = BytesMut::with_capacity(samples.len() * 4);
        for sample in samples {
            buf.put_f32_le(*sample);
        }
        self.data = Some(buf.freeze());
        self
    }

    #[must_use]
    pub fn metadata<S: Into<String>>(mut self, meta: S) -> Self {
        self.metadata = Some(meta.into());
        self
    }

    /// Build the AudioFrame.
    ///
    /// Defaults: 48 kHz stereo, 1600 samples of planar float at reference
    /// level 0 dB, zeroed. The channel stride is `samples * 4` for planar
    /// layouts and `0` for interleaved ones.
    pub fn build(self) -> AudioFrame {
        let format = self.format.unwrap_or(AudioFormat::Float32Separate);
        let sample_rate = self.sample_rate.unwrap_or(48000);
        let channels = self.channels.unwrap_or(2);
        let samples = self.samples.unwrap_or(1600);
        let channel_stride = if format.is_planar() {
            samples.saturating_mul(4)
        } else {
            0
        };

        let data = self.data.unwrap_or_else(|| {
            let len = (samples.max(0) as usize)
                .saturating_mul(channels.max(0) as usize)
                .saturating_mul(format.bytes_per_sample());
            Bytes::from(vec![0u8; len.min(MAX_AUDIO_BYTES)])
        });

        AudioFrame {
            format,
            reference_level: self.reference_level.unwrap_or(0),
            sample_rate,
            channels,
            samples,
            channel_stride,
            timestamp: self.timestamp.unwrap_or_default(),
            timecode: self.timecode.unwrap_or(0),
            data,
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planar_stereo() -> AudioFrame {
        AudioFrame::builder()
            .channels(2)
            .samples(3)
            .data_f32(&[0.1, 0.2, 0.3, -0.1, -0.2, -0.3])
            .build()
    }

    #[test]
    fn test_builder_defaults() {
        let frame = AudioFrame::default();
        assert_eq!(frame.format, AudioFormat::Float32Separate);
        assert_eq!(frame.channel_stride, 1600 * 4);
        assert_eq!(frame.data.len(), 1600 * 2 * 4);
        frame.validate().expect("default audio should validate");
        assert_eq!(frame.duration(), Duration::from_nanos(33_333_333));
    }

    #[test]
    fn test_validate_planar_stride() {
        let mut frame = planar_stereo();
        frame.channel_stride = 8;
        assert!(matches!(frame.validate(), Err(Error::InvalidFrame(_))));

        let mut frame = planar_stereo();
        frame.data = frame.data.slice(..20);
        assert!(frame.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overflowing_shapes() {
        let mut frame = planar_stereo();
        frame.samples = 0x4000_0000;
        assert!(matches!(frame.validate(), Err(Error::InvalidFrame(_))));

        let mut frame = planar_stereo();
        frame.samples = i32::MAX;
        frame.channel_stride = i32::MAX;
        frame.channels = i32::MAX;
        assert!(matches!(frame.validate(), Err(Error::InvalidFrame(_))));

        let mut frame = planar_stereo();
        frame.format = AudioFormat::Int16Interleaved;
        frame.samples = i32::MAX;
        frame.channels = i32::MAX;
        assert!(matches!(frame.validate(), Err(Error::InvalidFrame(_))));
        assert_eq!(frame.sample(0, usize::MAX), None);
    }

    #[test]
    fn test_planar_to_interleaved() {
        let frame = planar_stereo();
        let out = frame.convert(AudioFormat::Float32Interleaved, 0).unwrap();
        assert_eq!(out.channel_stride, 0);
        let interleaved: Vec<f32> = out
            .data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(interleaved, vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3]);
        assert_eq!(out.channel_data(1).unwrap(), vec![-0.1, -0.2, -0.3]);
    }

    #[test]
    fn test_int16_uses_reference_level() {
        let frame = AudioFrame::builder()
            .channels(1)
            .samples(2)
            .data_f32(&[1.0, -0.5])
            .build();

        let at_zero = frame.convert(AudioFormat::Int16Interleaved, 0).unwrap();
        let raw: Vec<i16> = at_zero
            .data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(raw, vec![32767, -16384]);

        // 20 dB of headroom puts the reference at a tenth of full scale.
        let at_twenty = frame.convert(AudioFormat::Int16Interleaved, 20).unwrap();
        let first = i16::from_le_bytes([at_twenty.data[0], at_twenty.data[1]]);
        assert_eq!(first, 3277);

        let back = at_twenty.convert(AudioFormat::Float32Separate, 0).unwrap();
        let value = back.sample(0, 0).unwrap();
        assert!((value - 1.0).abs() < 1e-3, "got {value}");
    }

    #[test]
    fn test_int16_clamps() {
        let frame = AudioFrame::builder()
            .channels(1)
            .samples(1)
            .data_f32(&[4.0])
            .build();
        let out = frame.convert(AudioFormat::Int16Interleaved, 0).unwrap();
        assert_eq!(i16::from_le_bytes([out.data[0], out.data[1]]), 32767);
    }

    #[test]
    fn test_same_format_shares_buffer() {
        let frame = planar_stereo();
        let out = frame.convert(AudioFormat::Float32Separate, 6).unwrap();
        assert_eq!(out.data.as_ptr(), frame.data.as_ptr());
        assert_eq!(out.reference_level, 6);
    }

    #[test]
    fn test_sample_out_of_range() {
        let frame = planar_stereo();
        assert!(frame.sample(2, 0).is_none());
        assert!(frame.sample(0, 3).is_none());
    }
}
