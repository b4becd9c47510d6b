//! Picture format and opaque buffer tokens

use serde::{Deserialize, Serialize};

/// Pixel layout of a decoded picture as reported by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit 4:2:0, interleaved chroma
    Nv12,
    /// 8-bit 4:2:2, interleaved chroma
    Nv16,
    /// 10-bit packed 4:2:0
    Nv15,
    /// 8-bit 4:2:0, planar
    Yuv420p,
    /// Decoder-specific layout carried through untouched
    Unknown(u32),
}

/// Geometry of one buffer generation, announced by the decoder before the
/// first picture that uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PictureFormat {
    /// Visible width in pixels
    pub width: u32,
    /// Visible height in pixels
    pub height: u32,
    /// Row stride in bytes
    pub hor_stride: u32,
    /// Number of allocated rows (aligned height)
    pub ver_stride: u32,
    /// Pixel layout
    pub pixel_format: PixelFormat,
}

impl PictureFormat {
    /// Create a format with strides equal to the visible geometry
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self { width, height, hor_stride: width, ver_stride: height, pixel_format }
    }

    /// Override the strides
    pub fn with_strides(mut self, hor_stride: u32, ver_stride: u32) -> Self {
        self.hor_stride = hor_stride;
        self.ver_stride = ver_stride;
        self
    }

    /// Bytes to allocate per buffer: `hor_stride × 2 × ver_stride`.
    ///
    /// The doubled vertical extent leaves room for metadata some decoders
    /// append after the chroma plane.
    pub fn buffer_size(&self) -> usize {
        self.hor_stride as usize * 2 * self.ver_stride as usize
    }
}

/// Opaque token the decoder uses to identify a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HardwareIdentity(pub u64);

/// Opaque token the display subsystem uses to present a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurfaceId(pub u32);

/// Opaque token needed to release a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationHandle(pub u64);

impl std::fmt::Display for HardwareIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fb{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size_doubles_vertical_stride() {
        let format = PictureFormat::new(1280, 720, PixelFormat::Nv12).with_strides(1280, 736);
        assert_eq!(format.buffer_size(), 1280 * 2 * 736);
    }

    #[test]
    fn identity_display_is_hex() {
        assert_eq!(HardwareIdentity(255).to_string(), "0xff");
        assert_eq!(SurfaceId(3).to_string(), "fb3");
    }
}
