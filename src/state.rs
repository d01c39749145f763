use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::RgbaImage;

use crate::error::{WarpError, WarpResult};
use crate::geometry::Quad;

/// Largest result edge accepted by either render path.
pub const MAX_RESULT_DIM: u32 = 16384;
pub const DEFAULT_RESULT_SIZE: u32 = 512;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
/// Decoded RGBA8 image the quad is placed on. Read-only once built.
pub struct SourceImage {
    id: u64,
    pixels: RgbaImage,
}

impl SourceImage {
    pub fn new(pixels: RgbaImage) -> WarpResult<Self> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(WarpError::image(format!(
                "source must not be empty ({}x{})",
                pixels.width(),
                pixels.height()
            )));
        }
        Ok(Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            pixels,
        })
    }

    /// Unique per decoded image; GPU resources are keyed on it.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn as_raw(&self) -> &[u8] {
        self.pixels.as_raw()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Output rectangle size, independent of the source size.
pub struct ResultSpec {
    pub width: u32,
    pub height: u32,
}

impl ResultSpec {
    pub fn new(width: u32, height: u32) -> WarpResult<Self> {
        if width == 0 || height == 0 || width > MAX_RESULT_DIM || height > MAX_RESULT_DIM {
            return Err(WarpError::InvalidResultSize { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for ResultSpec {
    fn default() -> Self {
        Self {
            width: DEFAULT_RESULT_SIZE,
            height: DEFAULT_RESULT_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// How the result size is chosen when a new source is opened.
pub enum ResultSizePolicy {
    Fixed(u32),
    HalfSource,
}

impl Default for ResultSizePolicy {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RESULT_SIZE)
    }
}

impl ResultSizePolicy {
    pub fn resolve(self, source_width: u32, source_height: u32) -> ResultSpec {
        let (w, h) = match self {
            Self::Fixed(size) => (size, size),
            Self::HalfSource => (source_width / 2, source_height / 2),
        };
        ResultSpec {
            width: w.clamp(1, MAX_RESULT_DIM),
            height: h.clamp(1, MAX_RESULT_DIM),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Correlates an asynchronous warp request with its response.
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
/// One CPU warp job. The source handle is moved in, never the bytes.
pub struct WarpRequest {
    pub id: RequestId,
    pub quad: Quad,
    pub result: ResultSpec,
    pub source: Arc<SourceImage>,
}

#[derive(Debug)]
pub struct WarpResponse {
    pub id: RequestId,
    pub image: RgbaImage,
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgba};

    use super::*;

    #[test]
    fn source_ids_are_unique() {
        let a = SourceImage::new(ImageBuffer::from_pixel(2, 2, Rgba([0, 0, 0, 255]))).unwrap();
        let b = SourceImage::new(ImageBuffer::from_pixel(2, 2, Rgba([0, 0, 0, 255]))).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(SourceImage::new(RgbaImage::new(0, 4)).is_err());
    }

    #[test]
    fn result_spec_rejects_zero_and_oversized() {
        assert!(ResultSpec::new(0, 10).is_err());
        assert!(ResultSpec::new(10, 0).is_err());
        assert!(ResultSpec::new(MAX_RESULT_DIM + 1, 10).is_err());
        assert_eq!(
            ResultSpec::new(400, 300).unwrap(),
            ResultSpec {
                width: 400,
                height: 300
            }
        );
    }

    #[test]
    fn size_policy_resolves_against_source() {
        assert_eq!(
            ResultSizePolicy::default().resolve(800, 600),
            ResultSpec {
                width: 512,
                height: 512
            }
        );
        assert_eq!(
            ResultSizePolicy::HalfSource.resolve(800, 600),
            ResultSpec {
                width: 400,
                height: 300
            }
        );
        assert_eq!(
            ResultSizePolicy::HalfSource.resolve(1, 1),
            ResultSpec {
                width: 1,
                height: 1
            }
        );
    }
}
