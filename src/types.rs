use std::{fmt, time::Instant};

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            rgba,
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    pub fn expected_len(&self) -> usize {
        (self.width as usize)
            .saturating_mul(self.height as usize)
            .saturating_mul(4)
    }
}

/// What a face analyzer saw in one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaceObservation {
    pub face_detected: bool,
    pub left_eye_closed: bool,
    pub right_eye_closed: bool,
    pub is_smiling: bool,
}

/// Foreground probability per pixel, 0 = background, 255 = person.
#[derive(Clone, Debug)]
pub struct SegmentationMask {
    pub alpha: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub struct SegmentationResult {
    /// Mask already scaled to the frame it was computed from.
    pub mask: SegmentationMask,
    pub observation: FaceObservation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaceSignals {
    pub face_detected: bool,
    pub eyes_closed: bool,
    pub is_smiling: bool,
    pub timestamp: Instant,
}

impl FaceSignals {
    pub fn none() -> Self {
        Self {
            face_detected: false,
            eyes_closed: false,
            is_smiling: false,
            timestamp: Instant::now(),
        }
    }

    pub fn from_observation(observation: &FaceObservation, timestamp: Instant) -> Self {
        let face_detected = observation.face_detected;
        Self {
            face_detected,
            eyes_closed: face_detected
                && observation.left_eye_closed
                && observation.right_eye_closed,
            is_smiling: face_detected && observation.is_smiling,
            timestamp,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompositedFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhotoSlot {
    Profile,
    Focus,
}

impl PhotoSlot {
    /// Field name on the remote user record.
    pub fn field_name(&self) -> &'static str {
        match self {
            PhotoSlot::Profile => "smallImage",
            PhotoSlot::Focus => "focusImage",
        }
    }
}

impl fmt::Display for PhotoSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PhotoSlot::Profile => "profile photo",
            PhotoSlot::Focus => "focus photo",
        })
    }
}

/// Still image taken from the live preview.
#[derive(Clone, Debug)]
pub struct StillImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub struct CapturedPhoto {
    pub slot: PhotoSlot,
    pub image: StillImage,
    /// Signals as they were when the shutter fired.
    pub signals: FaceSignals,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredPhoto {
    pub slot: PhotoSlot,
    pub location: String,
}
