//! RGBA raster buffers.
//!
//! A `RasterBuffer` is the decoded canvas a participant edits locally.
//! Erasing sets a pixel's alpha to 0; colour channels are left alone so
//! that an undo can restore them.

use std::io::Cursor;

use image::{ImageFormat, RgbaImage};

use crate::MaskError;

/// Alpha value that marks a pixel as erased.
pub const ERASED_ALPHA: u8 = 0;

/// Width × height RGBA8 pixel buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBuffer {
    image: RgbaImage,
}

impl RasterBuffer {
    /// Create a buffer where every pixel has the given RGBA value.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, image::Rgba(rgba)),
        }
    }

    /// Fully opaque white canvas.
    pub fn opaque(width: u32, height: u32) -> Self {
        Self::filled(width, height, [255, 255, 255, 255])
    }

    /// Wrap raw RGBA8 bytes (row-major, 4 bytes per pixel).
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self, MaskError> {
        let expected = width as usize * height as usize * 4;
        let actual = data.len();
        RgbaImage::from_raw(width, height, data)
            .map(|image| Self { image })
            .ok_or(MaskError::BufferSize {
                width,
                height,
                expected,
                actual,
            })
    }

    /// Decode any supported image format into RGBA8.
    pub fn decode(bytes: &[u8]) -> Result<Self, MaskError> {
        let decoded = image::load_from_memory(bytes).map_err(MaskError::Decode)?;
        let image = decoded.to_rgba8();
        log::debug!("Decoded raster {}x{}", image.width(), image.height());
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Number of pixels in the buffer.
    pub fn pixel_count(&self) -> usize {
        self.width() as usize * self.height() as usize
    }

    /// RGBA value at (x, y), or `None` outside the buffer.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        self.image.get_pixel_checked(x, y).map(|p| p.0)
    }

    /// Alpha channel at (x, y), or `None` outside the buffer.
    pub fn alpha(&self, x: u32, y: u32) -> Option<u8> {
        self.pixel(x, y).map(|p| p[3])
    }

    /// Mark a single pixel as erased. Returns false when out of bounds.
    pub fn erase_pixel(&mut self, x: u32, y: u32) -> bool {
        match self.image.get_pixel_mut_checked(x, y) {
            Some(px) => {
                px.0[3] = ERASED_ALPHA;
                true
            }
            None => false,
        }
    }

    /// Erase a rectangle, clipped to the buffer. Returns the number of
    /// pixels that fell inside the buffer.
    pub fn erase_rect(&mut self, x: u32, y: u32, width: u32, height: u32) -> usize {
        let x_end = x.saturating_add(width).min(self.width());
        let y_end = y.saturating_add(height).min(self.height());
        if x >= x_end || y >= y_end {
            return 0;
        }

        let stride = self.width() as usize * 4;
        let raw: &mut [u8] = &mut self.image;
        for row in y..y_end {
            let start = row as usize * stride + x as usize * 4;
            let end = row as usize * stride + x_end as usize * 4;
            for px in raw[start..end].chunks_exact_mut(4) {
                px[3] = ERASED_ALPHA;
            }
        }

        (x_end - x) as usize * (y_end - y) as usize
    }

    /// Raw RGBA8 bytes, row-major.
    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn as_image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Encode as PNG (alpha preserved).
    pub fn encode_png(&self) -> Result<Vec<u8>, MaskError> {
        let mut out = Cursor::new(Vec::new());
        self.image
            .write_to(&mut out, ImageFormat::Png)
            .map_err(MaskError::Encode)?;
        Ok(out.into_inner())
    }
}

impl From<RgbaImage> for RasterBuffer {
    fn from(image: RgbaImage) -> Self {
        Self { image }
    }
}
