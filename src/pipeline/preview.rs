use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use image::{RgbImage, codecs::jpeg::JpegEncoder};

use crate::types::{CompositedFrame, StillImage};

/// Latest composited preview. Written only by the frame processor; read by
/// the capture session and any preview renderer.
#[derive(Clone, Debug, Default)]
pub struct PreviewSlot {
    inner: Arc<RwLock<Option<Arc<CompositedFrame>>>>,
}

impl PreviewSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: CompositedFrame) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Arc::new(frame));
    }

    pub fn latest(&self) -> Option<Arc<CompositedFrame>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Flattens the composite onto white and encodes it as JPEG.
pub fn encode_jpeg(frame: &CompositedFrame, quality: u8) -> Result<StillImage> {
    let mut rgb = Vec::with_capacity(frame.rgba.len() / 4 * 3);
    for px in frame.rgba.chunks_exact(4) {
        let alpha = px[3] as u32;
        for &channel in &px[..3] {
            let blended = (channel as u32 * alpha + 255 * (255 - alpha)) / 255;
            rgb.push(blended as u8);
        }
    }

    let image = RgbImage::from_raw(frame.width, frame.height, rgb)
        .context("composited frame buffer does not match its dimensions")?;

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode_image(&image)
        .context("failed to encode preview as JPEG")?;

    Ok(StillImage {
        jpeg,
        width: frame.width,
        height: frame.height,
    })
}
