use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::{session::Session, value::Tensor};

use super::{FaceAnalyzer, common};
use crate::{
    config::FaceAnalyzerConfig,
    types::{FaceObservation, Frame},
};

pub const INPUT_SIZE: u32 = 192;
pub const NUM_LANDMARKS: usize = 468;

// Mesh indices, in EAR order: corner, top, top, corner, bottom, bottom.
const RIGHT_EYE: [usize; 6] = [33, 160, 158, 133, 153, 144];
const LEFT_EYE: [usize; 6] = [362, 385, 387, 263, 373, 380];
const MOUTH_CORNERS: (usize, usize) = (61, 291);
const OUTER_EYE_CORNERS: (usize, usize) = (33, 263);

/// Face mesh landmark model: 468 points plus a face presence logit.
pub struct OrtFaceAnalyzer {
    session: Session,
    cfg: FaceAnalyzerConfig,
}

impl OrtFaceAnalyzer {
    pub fn new(model_path: &Path, cfg: FaceAnalyzerConfig) -> Result<Self> {
        let session = common::load_session(model_path, "face landmark model")?;
        Ok(Self { session, cfg })
    }
}

impl FaceAnalyzer for OrtFaceAnalyzer {
    fn analyze(&mut self, frame: &Frame) -> Result<FaceObservation> {
        let (input, _crop) = common::center_crop(frame, INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run face landmark session")?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "face landmark model returned {} outputs, expected 2",
                outputs.len()
            ));
        }

        let coords = outputs[0].try_extract_array::<f32>()?;
        let flattened: Vec<f32> = coords.iter().copied().collect();
        let landmarks = decode_landmarks(&flattened)?;

        let presence_logit = outputs[1]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .ok_or_else(|| anyhow!("empty face presence output"))?;

        Ok(observe(&landmarks, sigmoid(presence_logit), &self.cfg))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn decode_landmarks(flat: &[f32]) -> Result<Vec<[f32; 3]>> {
    if flat.len() < NUM_LANDMARKS * 3 {
        return Err(anyhow!(
            "unexpected landmarks length: got {}, need {}",
            flat.len(),
            NUM_LANDMARKS * 3
        ));
    }
    Ok(flat
        .chunks_exact(3)
        .take(NUM_LANDMARKS)
        .map(|c| [c[0], c[1], c[2]])
        .collect())
}

fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

/// Eye aspect ratio: mean lid opening over eye width.
fn eye_aspect_ratio(landmarks: &[[f32; 3]], eye: &[usize; 6]) -> f32 {
    let p = |i: usize| landmarks[eye[i]];
    let width = distance(p(0), p(3));
    if width <= f32::EPSILON {
        return 0.0;
    }
    (distance(p(1), p(5)) + distance(p(2), p(4))) / (2.0 * width)
}

pub fn observe(
    landmarks: &[[f32; 3]],
    presence: f32,
    cfg: &FaceAnalyzerConfig,
) -> FaceObservation {
    if presence < cfg.presence_threshold || landmarks.len() < NUM_LANDMARKS {
        return FaceObservation::default();
    }

    let right_ear = eye_aspect_ratio(landmarks, &RIGHT_EYE);
    let left_ear = eye_aspect_ratio(landmarks, &LEFT_EYE);

    let eye_span = distance(landmarks[OUTER_EYE_CORNERS.0], landmarks[OUTER_EYE_CORNERS.1]);
    let mouth_width = distance(landmarks[MOUTH_CORNERS.0], landmarks[MOUTH_CORNERS.1]);
    let is_smiling = eye_span > f32::EPSILON && mouth_width / eye_span >= cfg.smile_ratio;

    FaceObservation {
        face_detected: true,
        left_eye_closed: left_ear <= cfg.eye_closed_ratio,
        right_eye_closed: right_ear <= cfg.eye_closed_ratio,
        is_smiling,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_eye(landmarks: &mut [[f32; 3]], eye: &[usize; 6], cx: f32, opening: f32) {
        let cy = 80.0;
        landmarks[eye[0]] = [cx - 15.0, cy, 0.0];
        landmarks[eye[3]] = [cx + 15.0, cy, 0.0];
        landmarks[eye[1]] = [cx - 5.0, cy - opening / 2.0, 0.0];
        landmarks[eye[2]] = [cx + 5.0, cy - opening / 2.0, 0.0];
        landmarks[eye[5]] = [cx - 5.0, cy + opening / 2.0, 0.0];
        landmarks[eye[4]] = [cx + 5.0, cy + opening / 2.0, 0.0];
    }

    /// Eyes 30px wide, mouth corners `mouth` px apart.
    fn face(right_opening: f32, left_opening: f32, mouth: f32) -> Vec<[f32; 3]> {
        let mut landmarks = vec![[0.0; 3]; NUM_LANDMARKS];
        set_eye(&mut landmarks, &RIGHT_EYE, 60.0, right_opening);
        set_eye(&mut landmarks, &LEFT_EYE, 132.0, left_opening);
        landmarks[MOUTH_CORNERS.0] = [96.0 - mouth / 2.0, 140.0, 0.0];
        landmarks[MOUTH_CORNERS.1] = [96.0 + mouth / 2.0, 140.0, 0.0];
        landmarks
    }

    #[test]
    fn open_eyes_and_neutral_mouth() {
        let cfg = FaceAnalyzerConfig::default();
        let obs = observe(&face(10.0, 10.0, 40.0), 0.9, &cfg);
        assert_eq!(
            obs,
            FaceObservation {
                face_detected: true,
                left_eye_closed: false,
                right_eye_closed: false,
                is_smiling: false,
            }
        );
    }

    #[test]
    fn closed_eyes_are_reported_per_eye() {
        let cfg = FaceAnalyzerConfig::default();
        let obs = observe(&face(1.0, 10.0, 40.0), 0.9, &cfg);
        assert!(obs.right_eye_closed);
        assert!(!obs.left_eye_closed);

        let obs = observe(&face(1.0, 2.0, 40.0), 0.9, &cfg);
        assert!(obs.right_eye_closed && obs.left_eye_closed);
    }

    #[test]
    fn wide_mouth_counts_as_smile() {
        // Outer eye corners are 102px apart.
        let obs = observe(&face(10.0, 10.0, 70.0), 0.9, &FaceAnalyzerConfig::default());
        assert!(obs.is_smiling);
    }

    #[test]
    fn low_presence_means_no_face() {
        let obs = observe(&face(1.0, 1.0, 90.0), 0.2, &FaceAnalyzerConfig::default());
        assert_eq!(obs, FaceObservation::default());
    }

    #[test]
    fn short_landmark_output_is_an_error() {
        assert!(decode_landmarks(&[0.0; 30]).is_err());
        let decoded = decode_landmarks(&vec![1.0; NUM_LANDMARKS * 3 + 3]).unwrap();
        assert_eq!(decoded.len(), NUM_LANDMARKS);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
    }
}
