//! Frame types for video, audio, and metadata, and the closed format
//! enumerations that describe their layouts.

use num_enum::{IntoPrimitive, TryFromPrimitive};

mod audio;
mod metadata;
mod video;

pub use audio::{AudioFrame, AudioFrameBuilder};
pub use metadata::{MetadataFrame, Tally};
pub use video::{calculate_line_stride, VideoFrame, VideoFrameBuilder};

#[cfg(feature = "image-encoding")]
pub use video::ImageFormat;

/// Packs four ASCII characters into a little-endian FourCC code.
///
/// ```
/// use grafton_av::{fourcc, FourCC};
///
/// assert_eq!(fourcc(b"BGRA"), u32::from(FourCC::BGRA));
/// ```
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// Pixel and sample layout identifiers (FourCC codes).
///
/// Each value is the little-endian packing of its four-character name.
/// `FLTp` tags planar float audio and is not a valid video format.
///
/// # Examples
///
/// ```
/// use grafton_av::FourCC;
///
/// let format = FourCC::try_from(0x4152_4742).unwrap();
/// assert_eq!(format, FourCC::BGRA);
/// assert!(format.is_video());
/// ```
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum FourCC {
    /// YCbCr 4:2:2 format (16 bits per pixel) - bandwidth efficient.
    UYVY = 0x5956_5955,
    /// YCbCr 4:2:2 with alpha channel (24 bits per pixel).
    UYVA = 0x4156_5955,
    /// 16-bit YCbCr 4:2:2 format.
    P216 = 0x3631_3250,
    /// 16-bit YCbCr 4:2:2 with alpha.
    PA16 = 0x3631_4150,
    /// Planar YCbCr 4:2:0 format (12 bits per pixel).
    YV12 = 0x3231_5659,
    /// Planar YCbCr 4:2:0 format (12 bits per pixel).
    I420 = 0x3032_3449,
    /// Semi-planar YCbCr 4:2:0 format (12 bits per pixel).
    NV12 = 0x3231_564E,
    /// Blue-Green-Red-Alpha format (32 bits per pixel).
    BGRA = 0x4152_4742,
    /// Blue-Green-Red with padding (32 bits per pixel).
    BGRX = 0x5852_4742,
    /// Red-Green-Blue-Alpha format (32 bits per pixel).
    RGBA = 0x4142_4752,
    /// Red-Green-Blue with padding (32 bits per pixel).
    RGBX = 0x5842_4752,
    /// Planar 32-bit float audio.
    FLTp = 0x7054_4C46,
}

impl FourCC {
    pub fn is_video(self) -> bool {
        !matches!(self, FourCC::FLTp)
    }

    /// Packed 8-bit RGB variants (4 bytes per pixel).
    pub fn is_packed_rgb(self) -> bool {
        matches!(
            self,
            FourCC::BGRA | FourCC::BGRX | FourCC::RGBA | FourCC::RGBX
        )
    }

    /// Planar and semi-planar 4:2:0 layouts.
    pub fn is_planar_420(self) -> bool {
        matches!(self, FourCC::YV12 | FourCC::I420 | FourCC::NV12)
    }

    /// The four-character name.
    pub fn code(self) -> [u8; 4] {
        u32::from(self).to_le_bytes()
    }
}

/// Video frame structure.
///
/// Field frames carry half the lines of the full picture.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FrameType {
    /// Interleaved fields in one frame.
    Interlaced = 0,
    /// Full frames rendered sequentially.
    Progressive = 1,
    /// First (even) field of interlaced content.
    Field0 = 2,
    /// Second (odd) field of interlaced content.
    Field1 = 3,
}

/// Audio sample layout.
///
/// All layouts store little-endian samples.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AudioFormat {
    /// 32-bit float, channels stored one after the other.
    Float32Separate = 0,
    /// 32-bit float, channel-interleaved.
    Float32Interleaved = 1,
    /// 16-bit signed integer, channel-interleaved.
    Int16Interleaved = 2,
}

impl AudioFormat {
    /// Size of one sample of one channel in bytes.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioFormat::Float32Separate | AudioFormat::Float32Interleaved => 4,
            AudioFormat::Int16Interleaved => 2,
        }
    }

    pub fn is_planar(self) -> bool {
        matches!(self, AudioFormat::Float32Separate)
    }
}

/// Maximum allowed size for video frame data (100 MiB).
pub(crate) const MAX_VIDEO_BYTES: usize = 100 * 1024 * 1024;

/// Maximum allowed size for audio frame data (64 MiB).
pub(crate) const MAX_AUDIO_BYTES: usize = 64 * 1024 * 1024;
