use std::{fmt, time::Duration};

use bytes::{Bytes, BytesMut};

use super::{FourCC, FrameType, MAX_VIDEO_BYTES};
use crate::{clock::PtpTimestamp, Error, Result};

/// An uncompressed video frame.
///
/// The pixel buffer is reference counted, so cloning a frame or fanning it
/// out to several connections never copies pixel data.
///
/// `line_stride` is the distance between rows in bytes. A negative stride
/// marks a bottom-to-top buffer: the last row in memory is the top of the
/// picture. [`row`](Self::row) hides the difference.
#[derive(Clone)]
pub struct VideoFrame {
    pub width: i32,
    pub height: i32,
    pub fourcc: FourCC,
    pub frame_rate_n: i32,
    pub frame_rate_d: i32,
    pub picture_aspect_ratio: f32,
    pub frame_type: FrameType,
    /// Operator-assigned timecode in nanoseconds.
    pub timecode: i64,
    pub timestamp: PtpTimestamp,
    pub line_stride: i32,
    pub data: Bytes,
    /// Per-frame metadata, typically XML.
    pub metadata: Option<String>,
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("fourcc", &self.fourcc)
            .field("frame_rate_n", &self.frame_rate_n)
            .field("frame_rate_d", &self.frame_rate_d)
            .field("picture_aspect_ratio", &self.picture_aspect_ratio)
            .field("frame_type", &self.frame_type)
            .field("timecode", &self.timecode)
            .field("timestamp", &self.timestamp)
            .field("line_stride", &self.line_stride)
            .field("data (bytes)", &self.data.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Default for VideoFrame {
    fn default() -> Self {
        VideoFrameBuilder::new().build()
    }
}

impl VideoFrame {
    /// Create a builder for configuring a video frame
    pub fn builder() -> VideoFrameBuilder {
        VideoFrameBuilder::new()
    }

    /// Minimum buffer length for the frame's format, stride and height.
    pub fn required_len(&self) -> usize {
        uncompressed_buffer_len(self.fourcc, self.line_stride.unsigned_abs(), self.height)
    }

    pub fn is_bottom_up(&self) -> bool {
        self.line_stride < 0
    }

    /// Nominal display duration of one frame.
    pub fn frame_duration(&self) -> Duration {
        if self.frame_rate_n <= 0 || self.frame_rate_d <= 0 {
            return Duration::ZERO;
        }
        let nanos = 1_000_000_000u64 * self.frame_rate_d as u64 / self.frame_rate_n as u64;
        Duration::from_nanos(nanos)
    }

    /// Checks the frame against its declared layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFrame`] for non-video FourCCs, non-positive
    /// dimensions or frame rates, a stride narrower than one row, or a
    /// buffer shorter than the layout requires.
    pub fn validate(&self) -> Result<()> {
        if !self.fourcc.is_video() {
            return Err(Error::InvalidFrame(format!(
                "{:?} is not a video format",
                self.fourcc
            )));
        }
        if self.width <= 0 || self.height <= 0 {
            return Err(Error::InvalidFrame(format!(
                "Invalid resolution {}x{}",
                self.width, self.height
            )));
        }
        if self.frame_rate_n <= 0 || self.frame_rate_d <= 0 {
            return Err(Error::InvalidFrame(format!(
                "Invalid frame rate {}/{}",
                self.frame_rate_n, self.frame_rate_d
            )));
        }
        let min_stride = natural_line_stride(self.fourcc, self.width).ok_or_else(|| {
            Error::InvalidFrame(format!(
                "Width {} overflows a {:?} row",
                self.width, self.fourcc
            ))
        })?;
        let stride = self.line_stride.unsigned_abs();
        if stride < min_stride.unsigned_abs() {
            return Err(Error::InvalidFrame(format!(
                "Line stride {} is smaller than one {:?} row ({min_stride} bytes)",
                self.line_stride, self.fourcc
            )));
        }
        let required = self.required_len();
        if required > MAX_VIDEO_BYTES {
            return Err(Error::InvalidFrame(format!(
                "Video frame exceeds maximum size: {required} bytes > {MAX_VIDEO_BYTES} bytes"
            )));
        }
        if self.data.len() < required {
            return Err(Error::InvalidFrame(format!(
                "Buffer holds {} bytes but {}x{} {:?} with stride {} needs {required}",
                self.data.len(),
                self.width,
                self.height,
                self.fourcc,
                self.line_stride
            )));
        }
        Ok(())
    }

    /// Row `y` counted from the top of the picture.
    ///
    /// For planar formats this addresses the luma plane. Returns `None` when
    /// `y` is out of range or the buffer is too short.
    pub fn row(&self, y: i32) -> Option<&[u8]> {
        if y < 0 || y >= self.height {
            return None;
        }
        let stride = self.line_stride.unsigned_abs() as usize;
        let index = if self.line_stride < 0 {
            (self.height - 1 - y) as usize
        } else {
            y as usize
        };
        let start = index.checked_mul(stride)?;
        self.data.get(start..start.checked_add(stride)?)
    }

    /// Returns a copy with the row order reversed and the stride sign
    /// flipped, so the picture is unchanged but its memory order is not.
    ///
    /// Only packed formats can be flipped.
    pub fn flipped(&self) -> Result<VideoFrame> {
        if self.fourcc.is_planar_420() {
            return Err(Error::InvalidFrame(format!(
                "Cannot flip planar {:?} frame",
                self.fourcc
            )));
        }
        let stride = self.line_stride.unsigned_abs() as usize;
        let rows = usize::try_from(self.height).unwrap_or(0);
        let len = stride
            .checked_mul(rows)
            .filter(|len| *len <= self.data.len())
            .ok_or_else(|| Error::InvalidFrame("Buffer shorter than stride * height".into()))?;
        let mut data = BytesMut::with_capacity(len);
        for index in (0..rows).rev() {
            let start = index * stride;
            let row = self.data.get(start..start + stride).ok_or_else(|| {
                Error::InvalidFrame("Buffer shorter than stride * height".into())
            })?;
            data.extend_from_slice(row);
        }
        Ok(VideoFrame {
            line_stride: -self.line_stride,
            data: data.freeze(),
            ..self.clone()
        })
    }

    /// Weaves two fields of a packed format into one interlaced frame of
    /// double height. Even lines come from `field0`.
    pub fn weave(field0: &VideoFrame, field1: &VideoFrame) -> Result<VideoFrame> {
        if field0.frame_type != FrameType::Field0 || field1.frame_type != FrameType::Field1 {
            return Err(Error::InvalidFrame(
                "Weaving requires a Field0 frame followed by a Field1 frame".into(),
            ));
        }
        if field0.fourcc.is_planar_420()
            || field0.fourcc != field1.fourcc
            || field0.width != field1.width
            || field0.height != field1.height
        {
            return Err(Error::InvalidFrame(
                "Fields differ in format or size, or use a planar format".into(),
            ));
        }
        let height = field0
            .height
            .checked_mul(2)
            .ok_or_else(|| Error::InvalidFrame("Woven frame height overflows".into()))?;
        let line_stride = natural_line_stride(field0.fourcc, field0.width)
            .ok_or_else(|| Error::InvalidFrame("Field row width overflows".into()))?;
        let stride = line_stride as usize;
        let len = uncompressed_buffer_len(field0.fourcc, line_stride.unsigned_abs(), height);
        if len > MAX_VIDEO_BYTES {
            return Err(Error::InvalidFrame(format!(
                "Woven frame exceeds maximum size: {len} bytes > {MAX_VIDEO_BYTES} bytes"
            )));
        }
        let mut data = BytesMut::with_capacity(len);
        for y in 0..field0.height {
            for field in [field0, field1] {
                let row = field
                    .row(y)
                    .and_then(|row| row.get(..stride))
                    .ok_or_else(|| Error::InvalidFrame("Field buffer too short".into()))?;
                data.extend_from_slice(row);
            }
        }
        Ok(VideoFrame {
            height,
            frame_type: FrameType::Interlaced,
            line_stride,
            data: data.freeze(),
            ..field0.clone()
        })
    }

    /// Rows of the picture from top to bottom, each trimmed to
    /// `width * bytes_per_pixel`.
    #[cfg(feature = "image-encoding")]
    fn packed_rows(&self, operation: &str) -> Result<impl Iterator<Item = &[u8]>> {
        if !self.fourcc.is_packed_rgb() {
            let fourcc = self.fourcc;
            return Err(Error::InvalidFrame(format!(
                "Unsupported format for {operation}: {fourcc:?}. Only RGBA/RGBX/BGRA/BGRX are supported."
            )));
        }
        self.validate()?;
        let row_len = self.width as usize * 4;
        Ok((0..self.height).filter_map(move |y| self.row(y).map(|row| &row[..row_len])))
    }

    /// Encode the video frame as PNG bytes.
    ///
    /// Padded rows and bottom-to-top buffers are handled. BGR variants are
    /// swizzled to RGB.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFrame`] if the format is not RGBA/RGBX/BGRA/BGRX
    /// or encoding fails.
    #[cfg(feature = "image-encoding")]
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        use png::{BitDepth, ColorType, Encoder};

        let swap = matches!(self.fourcc, FourCC::BGRA | FourCC::BGRX);
        let mut rgba_data = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for row in self.packed_rows("PNG encoding")? {
            if swap {
                for chunk in row.chunks_exact(4) {
                    rgba_data.extend_from_slice(&[chunk[2], chunk[1], chunk[0], chunk[3]]);
                }
            } else {
                rgba_data.extend_from_slice(row);
            }
        }

        let mut png_data = Vec::new();
        let mut encoder = Encoder::new(&mut png_data, self.width as u32, self.height as u32);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);

        encoder
            .write_header()
            .and_then(|mut writer| writer.write_image_data(&rgba_data))
            .map_err(|e| Error::InvalidFrame(format!("PNG encoding failed: {e}")))?;

        Ok(png_data)
    }

    /// Encode the video frame as JPEG bytes with the specified quality
    /// (1-100). Alpha is dropped.
    #[cfg(feature = "image-encoding")]
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        use jpeg_encoder::{ColorType as JpegColorType, Encoder as JpegEncoder};

        let swap = matches!(self.fourcc, FourCC::BGRA | FourCC::BGRX);
        let mut rgb_data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for row in self.packed_rows("JPEG encoding")? {
            for chunk in row.chunks_exact(4) {
                if swap {
                    rgb_data.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
                } else {
                    rgb_data.extend_from_slice(&chunk[..3]);
                }
            }
        }

        let width = u16::try_from(self.width)
            .map_err(|_| Error::InvalidFrame("Frame too wide for JPEG".into()))?;
        let height = u16::try_from(self.height)
            .map_err(|_| Error::InvalidFrame("Frame too tall for JPEG".into()))?;

        let mut jpeg_data = Vec::new();
        let encoder = JpegEncoder::new(&mut jpeg_data, quality);
        encoder
            .encode(&rgb_data, width, height, JpegColorType::Rgb)
            .map_err(|e| Error::InvalidFrame(format!("JPEG encoding failed: {e}")))?;

        Ok(jpeg_data)
    }

    /// Encode the video frame as a base64 data URL, e.g.
    /// `data:image/png;base64,...`.
    #[cfg(feature = "image-encoding")]
    pub fn encode_data_url(&self, format: ImageFormat) -> Result<String> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let (mime_type, image_bytes) = match format {
            ImageFormat::Png => ("image/png", self.encode_png()?),
            ImageFormat::Jpeg(quality) => ("image/jpeg", self.encode_jpeg(quality)?),
        };

        let base64_data = STANDARD.encode(&image_bytes);
        Ok(format!("data:{mime_type};base64,{base64_data}"))
    }
}

/// Image format specification for [`VideoFrame::encode_data_url`].
#[cfg(feature = "image-encoding")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// PNG format (lossless compression)
    Png,
    /// JPEG format with quality setting (1-100, where 100 is highest quality)
    Jpeg(u8),
}

/// Builder for configuring a VideoFrame with ergonomic method chaining
#[derive(Debug, Clone, Default)]
pub struct VideoFrameBuilder {
    width: Option<i32>,
    height: Option<i32>,
    fourcc: Option<FourCC>,
    frame_rate_n: Option<i32>,
    frame_rate_d: Option<i32>,
    picture_aspect_ratio: Option<f32>,
    frame_type: Option<FrameType>,
    timecode: Option<i64>,
    timestamp: Option<PtpTimestamp>,
    line_stride: Option<i32>,
    data: Option<Bytes>,
    metadata: Option<String>,
}

impl VideoFrameBuilder {
    /// Create a new builder with no fields set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the video resolution
    #[must_use]
    pub fn resolution(mut self, width: i32, height: i32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    #[must_use]
    pub fn fourcc(mut self, fourcc: FourCC) -> Self {
        self.fourcc = Some(fourcc);
        self
    }

    /// Set the frame rate as a fraction (e.g., 30000/1001 for 29.97fps)
    #[must_use]
    pub fn frame_rate(mut self, numerator: i32, denominator: i32) -> Self {
        self.frame_rate_n = Some(numerator);
        self.frame_rate_d = Some(denominator);
        self
    }

    #[must_use]
    pub fn aspect_ratio(mut self, ratio: f32) -> Self {
        self.picture_aspect_ratio = Some(ratio);
        self
    }

    #[must_use]
    pub fn frame_type(mut self, frame_type: FrameType) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    #[must_use]
    pub fn timecode(mut self, tc: i64) -> Self {
        self.timecode = Some(tc);
        self
    }

    #[must_use]
    pub fn timestamp(mut self, ts: PtpTimestamp) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Set an explicit stride. Negative values mark a bottom-to-top buffer.
    #[must_use]
    pub fn line_stride(mut self, stride: i32) -> Self {
        self.line_stride = Some(stride);
        self
    }

    /// Use the given pixel buffer instead of a zeroed one.
    #[must_use]
    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    #[must_use]
    pub fn metadata<S: Into<String>>(mut self, meta: S) -> Self {
        self.metadata = Some(meta.into());
        self
    }

    /// Build the VideoFrame.
    ///
    /// Defaults: 1920x1080 BGRA progressive at 60/1, 16:9, natural stride
    /// and a zeroed buffer. The result is not validated; pushes validate.
    pub fn build(self) -> VideoFrame {
        let width = self.width.unwrap_or(1920);
        let height = self.height.unwrap_or(1080);
        let fourcc = self.fourcc.unwrap_or(FourCC::BGRA);
        let line_stride = self
            .line_stride
            .unwrap_or_else(|| calculate_line_stride(fourcc, width));
        let data = self.data.unwrap_or_else(|| {
            let len = uncompressed_buffer_len(fourcc, line_stride.unsigned_abs(), height)
                .min(MAX_VIDEO_BYTES);
            Bytes::from(vec![0u8; len])
        });

        VideoFrame {
            width,
            height,
            fourcc,
            frame_rate_n: self.frame_rate_n.unwrap_or(60),
            frame_rate_d: self.frame_rate_d.unwrap_or(1),
            picture_aspect_ratio: self.picture_aspect_ratio.unwrap_or(16.0 / 9.0),
            frame_type: self.frame_type.unwrap_or(FrameType::Progressive),
            timecode: self.timecode.unwrap_or(0),
            timestamp: self.timestamp.unwrap_or_default(),
            line_stride,
            data,
            metadata: self.metadata,
        }
    }
}

/// Ceiling division by 2 for computing subsampled plane dimensions.
#[inline]
fn ceil_div2(x: i32) -> i32 {
    x / 2 + x % 2
}

/// Calculate the total buffer length for an uncompressed video frame.
///
/// - **Packed** (BGRA/BGRX/RGBA/RGBX/UYVY/UYVA/P216/PA16): `y_stride * height`
/// - **Planar 4:2:0 YV12/I420**: Y plane plus two chroma planes of
///   `(y_stride/2) * ceil(height/2)`
/// - **Semi-planar 4:2:0 NV12**: Y plane plus one interleaved chroma plane of
///   `y_stride * ceil(height/2)`
///
/// Computed in 64 bits; a length that does not fit `usize` saturates.
fn uncompressed_buffer_len(fmt: FourCC, y_stride: u32, height: i32) -> usize {
    if y_stride == 0 || height <= 0 {
        return 0;
    }
    let y_stride = u64::from(y_stride);
    let y_size = y_stride * height as u64;
    let chroma_height = ceil_div2(height) as u64;

    let len = match fmt {
        FourCC::YV12 | FourCC::I420 => y_size + 2 * (y_stride / 2) * chroma_height,
        FourCC::NV12 => y_size + y_stride * chroma_height,
        _ => y_size,
    };
    usize::try_from(len).unwrap_or(usize::MAX)
}

/// Natural line stride, or `None` if it does not fit an `i32`.
fn natural_line_stride(fourcc: FourCC, width: i32) -> Option<i32> {
    match fourcc {
        FourCC::BGRA | FourCC::BGRX | FourCC::RGBA | FourCC::RGBX => width.checked_mul(4),
        FourCC::UYVY => width.checked_mul(2),
        FourCC::YV12 | FourCC::I420 | FourCC::NV12 => Some(width),
        FourCC::UYVA => width.checked_mul(3),
        FourCC::P216 | FourCC::PA16 => width.checked_mul(4),
        FourCC::FLTp => Some(0),
    }
}

/// Calculate the natural line stride (bytes per row) for a given video format.
///
/// Saturates at `i32::MAX` for widths no buffer could hold.
pub fn calculate_line_stride(fourcc: FourCC, width: i32) -> i32 {
    natural_line_stride(fourcc, width).unwrap_or(i32::MAX)
}
