//! # retouch-mask: Raster masks for provider-backed image edits
//!
//! Turns a locally edited canvas into the binary mask that external
//! inpainting/outpainting providers consume.
//!
//! ```text
//! decode(png) ──► RasterBuffer ──erase_rect()──► RasterBuffer
//!                                                    │
//!                                           extract_mask()
//!                                                    ▼
//!                     EditRequest { image_png, mask_png, prompt }
//!                                                    │
//!                                                    ▼
//!                                           ProviderGateway::edit()
//! ```
//!
//! Mask convention: WHITE = regenerate, BLACK = keep. Only an alpha of
//! exactly zero counts as erased.
//!
//! ## Modules
//!
//! - [`raster`]: RGBA buffer with local erase operations
//! - [`mask`]: single-channel mask and the extraction pass
//! - [`provider`]: seam to the external image-editing provider

pub mod mask;
pub mod provider;
pub mod raster;

pub use mask::{extract_mask, MaskBuffer, MaskValue};
pub use provider::{run_edit, EditRequest, ProviderError, ProviderGateway};
pub use raster::RasterBuffer;

use thiserror::Error;

/// Errors raised while building or encoding raster/mask buffers.
#[derive(Error, Debug)]
pub enum MaskError {
    #[error("Image decode error: {0}")]
    Decode(#[source] image::ImageError),
    #[error("Image encode error: {0}")]
    Encode(#[source] image::ImageError),
    #[error("Buffer size mismatch: expected {expected} bytes for {width}x{height}, got {actual}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}
