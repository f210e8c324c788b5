//! Image dimensions and size utilities

use crate::camera_interface::PixelFormat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Image dimensions structure
///
/// Represents the width and height of a readout region, in binned pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
}

impl ImageSize {
    /// Create a new ImageSize
    pub fn from_width_height(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Get total number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of bytes a frame of this size occupies in the given format
    pub fn buffer_len(&self, format: PixelFormat) -> usize {
        self.pixel_count() * format.bytes_per_pixel()
    }

    /// True if both dimensions are multiples of `alignment`
    pub fn is_aligned(&self, alignment: u32) -> bool {
        alignment > 0 && self.width % alignment == 0 && self.height % alignment == 0
    }

    /// Largest alignment-safe readout for a sensor of `max` unbinned pixels.
    ///
    /// Each axis becomes `floor(max / binning / alignment) * alignment`.
    pub fn aligned_full_frame(max: ImageSize, binning: u32, alignment: u32) -> Self {
        let binning = binning.max(1);
        let alignment = alignment.max(1);
        let axis = |dim: u32| (dim / binning / alignment) * alignment;
        Self {
            width: axis(max.width),
            height: axis(max.height),
        }
    }

    /// Convert to tuple (width, height)
    pub fn to_tuple(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl From<(u32, u32)> for ImageSize {
    fn from(dimensions: (u32, u32)) -> Self {
        Self::from_width_height(dimensions.0, dimensions.1)
    }
}

impl From<ImageSize> for (u32, u32) {
    fn from(size: ImageSize) -> Self {
        size.to_tuple()
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
