mod common;
pub mod face;
pub mod segmentation;

use anyhow::Result;

use crate::{
    config::CaptureConfig,
    model_download::{ModelKind, ensure_model_ready},
    types::{FaceObservation, Frame, SegmentationMask},
};

pub use face::OrtFaceAnalyzer;
pub use segmentation::OrtSegmenter;

/// Face landmark stage of the frame processor.
pub trait FaceAnalyzer: Send + 'static {
    fn analyze(&mut self, frame: &Frame) -> Result<FaceObservation>;
}

/// Person segmentation stage of the frame processor.
pub trait PersonSegmenter: Send + 'static {
    fn segment(&mut self, frame: &Frame) -> Result<SegmentationMask>;
}

/// Fetches missing models if a download URL is configured and loads both
/// ONNX stages.
pub fn load_onnx_analyzers(config: &CaptureConfig) -> Result<(OrtFaceAnalyzer, OrtSegmenter)> {
    let base_url = config.model_base_url.as_deref();

    let face_path = ensure_model_ready(ModelKind::FaceLandmarks, &config.model_dir, base_url, |_| {})?;
    let segmentation_path =
        ensure_model_ready(ModelKind::PersonSegmentation, &config.model_dir, base_url, |_| {})?;

    let face = OrtFaceAnalyzer::new(&face_path, config.face.clone())?;
    let segmenter = OrtSegmenter::new(&segmentation_path)?;
    log::info!(
        "face analysis ready using {} and {}",
        face_path.display(),
        segmentation_path.display()
    );

    Ok((face, segmenter))
}
