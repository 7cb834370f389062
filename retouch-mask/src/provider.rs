//! Seam to external image-editing providers.
//!
//! The core never talks to a provider directly; it builds an
//! [`EditRequest`] and hands it to whatever [`ProviderGateway`] the
//! application wires in. Calls are atomic and fallible. Retries and
//! backoff belong to the caller.

use async_trait::async_trait;
use thiserror::Error;

use crate::mask::extract_mask;
use crate::raster::RasterBuffer;
use crate::MaskError;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
    #[error("Provider rejected request: {0}")]
    Rejected(String),
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Mask(#[from] MaskError),
}

/// Everything a provider needs to regenerate the erased region.
#[derive(Debug, Clone)]
pub struct EditRequest {
    /// PNG of the edited canvas (alpha preserved)
    pub image_png: Vec<u8>,
    /// Grayscale PNG, WHITE = regenerate
    pub mask_png: Vec<u8>,
    /// Optional text guidance
    pub prompt: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl EditRequest {
    /// Encode `raster` and its derived mask.
    pub fn from_raster(raster: &RasterBuffer, prompt: Option<String>) -> Result<Self, MaskError> {
        let mask = extract_mask(raster);
        let image_png = raster.encode_png()?;
        let mask_png = mask.encode_png()?;
        log::debug!(
            "Built edit request {}x{} ({} pixels to regenerate)",
            raster.width(),
            raster.height(),
            mask.white_count()
        );
        Ok(Self {
            image_png,
            mask_png,
            prompt,
            width: raster.width(),
            height: raster.height(),
        })
    }

    /// Decode a provider result, rejecting images whose size differs
    /// from the request.
    pub fn decode_result(&self, bytes: &[u8]) -> Result<RasterBuffer, ProviderError> {
        let raster = RasterBuffer::decode(bytes)?;
        if raster.dimensions() != (self.width, self.height) {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {}x{}, got {}x{}",
                self.width,
                self.height,
                raster.width(),
                raster.height()
            )));
        }
        Ok(raster)
    }
}

/// An external inpainting/outpainting service.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Provider identifier (e.g., "openai", "stability").
    fn id(&self) -> &str;

    /// Submit an edit and return the provider's image bytes.
    async fn edit(&self, request: &EditRequest) -> Result<Vec<u8>, ProviderError>;
}

/// Run one provider round trip and decode the result.
pub async fn run_edit(
    gateway: &dyn ProviderGateway,
    raster: &RasterBuffer,
    prompt: Option<String>,
) -> Result<RasterBuffer, ProviderError> {
    let request = EditRequest::from_raster(raster, prompt)?;
    let bytes = gateway.edit(&request).await.inspect_err(|e| {
        log::warn!("Provider {} edit failed: {e}", gateway.id());
    })?;
    request.decode_result(&bytes)
}
