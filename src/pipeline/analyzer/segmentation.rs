use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::{session::Session, value::Tensor};

use super::{PersonSegmenter, common};
use crate::types::{Frame, SegmentationMask};

pub const INPUT_SIZE: u32 = 256;

/// Selfie segmentation model producing a person probability per pixel.
pub struct OrtSegmenter {
    session: Session,
}

impl OrtSegmenter {
    pub fn new(model_path: &Path) -> Result<Self> {
        let session = common::load_session(model_path, "segmentation model")?;
        Ok(Self { session })
    }
}

impl PersonSegmenter for OrtSegmenter {
    fn segment(&mut self, frame: &Frame) -> Result<SegmentationMask> {
        let input = common::resize_to_square(frame, INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run segmentation session")?;

        if outputs.len() < 1 {
            return Err(anyhow!("segmentation model returned no outputs"));
        }

        let probabilities = outputs[0].try_extract_array::<f32>()?;
        let shape = probabilities.shape().to_vec();
        let values: Vec<f32> = probabilities.iter().copied().collect();
        probabilities_to_mask(&values, &shape)
    }
}

/// Accepts `[1, H, W, 1]`, `[1, 1, H, W]` or `[H, W]` shaped outputs.
pub fn probabilities_to_mask(values: &[f32], shape: &[usize]) -> Result<SegmentationMask> {
    let spatial: Vec<usize> = shape.iter().copied().filter(|&d| d > 1).collect();
    let &[height, width] = spatial.as_slice() else {
        return Err(anyhow!(
            "unexpected segmentation shape {shape:?}, need a single HxW plane"
        ));
    };
    if values.len() != height * width {
        return Err(anyhow!(
            "segmentation output has {} values for a {height}x{width} plane",
            values.len()
        ));
    }

    let alpha = values
        .iter()
        .map(|p| (p.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();

    Ok(SegmentationMask {
        alpha,
        width: width as u32,
        height: height as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nhwc_probabilities_become_alpha() {
        let mask = probabilities_to_mask(&[0.0, 1.0, 0.5, 2.0, -1.0, 0.25], &[1, 2, 3, 1]).unwrap();
        assert_eq!((mask.width, mask.height), (3, 2));
        assert_eq!(mask.alpha, vec![0, 255, 128, 255, 0, 64]);
    }

    #[test]
    fn rejects_multi_channel_output() {
        assert!(probabilities_to_mask(&[0.0; 8], &[1, 2, 2, 2]).is_err());
        assert!(probabilities_to_mask(&[0.0; 3], &[1, 1, 2, 2]).is_err());
    }
}
