//! Binary edit masks.
//!
//! The mask is a pure projection of a [`RasterBuffer`]: every pixel whose
//! alpha is exactly zero becomes WHITE (regenerate), everything else
//! BLACK (keep). The pass is a single buffer-to-buffer walk, one output
//! byte per input pixel.

use std::io::Cursor;

use image::{GrayImage, ImageFormat};

use crate::raster::{RasterBuffer, ERASED_ALPHA};
use crate::MaskError;

/// A single mask pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MaskValue {
    /// Preserve the original pixel
    Black = 0,
    /// Region to be regenerated by the provider
    White = 255,
}

impl MaskValue {
    fn from_luma(v: u8) -> Self {
        if v == MaskValue::White as u8 {
            MaskValue::White
        } else {
            MaskValue::Black
        }
    }
}

/// Width × height single-channel mask, values ∈ {0, 255}.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskBuffer {
    image: GrayImage,
}

impl MaskBuffer {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Mask value at (x, y), or `None` outside the mask.
    pub fn get(&self, x: u32, y: u32) -> Option<MaskValue> {
        self.image
            .get_pixel_checked(x, y)
            .map(|p| MaskValue::from_luma(p.0[0]))
    }

    pub fn is_white(&self, x: u32, y: u32) -> bool {
        self.get(x, y) == Some(MaskValue::White)
    }

    /// Number of WHITE (regenerate) pixels.
    pub fn white_count(&self) -> usize {
        self.image
            .as_raw()
            .iter()
            .filter(|&&v| v == MaskValue::White as u8)
            .count()
    }

    /// True when the provider would have nothing to regenerate.
    pub fn is_all_black(&self) -> bool {
        self.white_count() == 0
    }

    /// Raw luma bytes, row-major.
    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn as_image(&self) -> &GrayImage {
        &self.image
    }

    /// Encode as 8-bit grayscale PNG.
    pub fn encode_png(&self) -> Result<Vec<u8>, MaskError> {
        let mut out = Cursor::new(Vec::new());
        self.image
            .write_to(&mut out, ImageFormat::Png)
            .map_err(MaskError::Encode)?;
        Ok(out.into_inner())
    }
}

impl From<&RasterBuffer> for MaskBuffer {
    fn from(raster: &RasterBuffer) -> Self {
        extract_mask(raster)
    }
}

/// Derive the edit mask for `raster`.
///
/// Total and deterministic; `raster` is only read.
pub fn extract_mask(raster: &RasterBuffer) -> MaskBuffer {
    let (width, height) = raster.dimensions();
    let mut image = GrayImage::new(width, height);

    for (dst, px) in image.iter_mut().zip(raster.as_raw().chunks_exact(4)) {
        *dst = if px[3] == ERASED_ALPHA {
            MaskValue::White as u8
        } else {
            MaskValue::Black as u8
        };
    }

    log::trace!("Extracted {width}x{height} mask");
    MaskBuffer { image }
}
