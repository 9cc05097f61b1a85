use std::thread;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};

use super::{
    analyzer::{FaceAnalyzer, PersonSegmenter},
    compositor,
    preview::PreviewSlot,
};
use crate::{
    config::Background,
    types::{CompositedFrame, FaceSignals, Frame, SegmentationResult},
};

pub struct FrameProcessor<F, S> {
    face: F,
    segmenter: S,
    background: Background,
}

impl<F: FaceAnalyzer, S: PersonSegmenter> FrameProcessor<F, S> {
    pub fn new(face: F, segmenter: S, background: Background) -> Self {
        Self {
            face,
            segmenter,
            background,
        }
    }

    /// Runs both models on the same frame concurrently, then composites.
    pub fn process(&mut self, frame: &Frame) -> Result<(SegmentationResult, CompositedFrame)> {
        let Self {
            face,
            segmenter,
            background,
        } = self;

        let (observation, mask) =
            rayon::join(|| face.analyze(frame), || segmenter.segment(frame));
        let observation = observation?;
        let mask = compositor::scale_mask(&mask?, frame.width, frame.height)?;
        let composited = compositor::composite(frame, &mask, *background)?;

        Ok((SegmentationResult { mask, observation }, composited))
    }
}

/// Spawns the processing worker. It exits once the frame senders are gone or
/// nobody listens for signals any more.
pub fn start_frame_processor<F, S>(
    mut processor: FrameProcessor<F, S>,
    frame_rx: Receiver<Frame>,
    preview: PreviewSlot,
    signal_tx: Sender<FaceSignals>,
) -> thread::JoinHandle<()>
where
    F: FaceAnalyzer,
    S: PersonSegmenter,
{
    thread::spawn(move || {
        while let Some(frame) = recv_latest_frame(&frame_rx) {
            match processor.process(&frame) {
                Ok((result, composited)) => {
                    preview.publish(composited);
                    let signals = FaceSignals::from_observation(&result.observation, frame.timestamp);
                    if signal_tx.send(signals).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::warn!("dropping frame, face analysis failed: {err:?}");
                }
            }
        }
        log::debug!("frame processor stopped");
    })
}

fn recv_latest_frame(frame_rx: &Receiver<Frame>) -> Option<Frame> {
    let mut frame = frame_rx.recv().ok()?;
    // Skip anything that queued up while the last frame was processed.
    while let Ok(newer) = frame_rx.try_recv() {
        frame = newer;
    }
    Some(frame)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use anyhow::anyhow;
    use crossbeam_channel::{bounded, unbounded};

    use super::*;
    use crate::types::{FaceObservation, SegmentationMask};

    /// Returns whatever observation the test last scripted.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedFace {
        pub observation: Arc<Mutex<Option<FaceObservation>>>,
    }

    impl ScriptedFace {
        pub(crate) fn set(&self, observation: Option<FaceObservation>) {
            *self.observation.lock().unwrap() = observation;
        }
    }

    impl FaceAnalyzer for ScriptedFace {
        fn analyze(&mut self, _frame: &Frame) -> Result<FaceObservation> {
            self.observation
                .lock()
                .unwrap()
                .ok_or_else(|| anyhow!("landmark model failed"))
        }
    }

    /// Left half of the model plane is the person.
    pub(crate) struct HalfSegmenter;

    impl PersonSegmenter for HalfSegmenter {
        fn segment(&mut self, _frame: &Frame) -> Result<SegmentationMask> {
            Ok(SegmentationMask {
                alpha: vec![255, 0, 255, 0],
                width: 2,
                height: 2,
            })
        }
    }

    pub(crate) fn face(eyes_closed: bool) -> FaceObservation {
        FaceObservation {
            face_detected: true,
            left_eye_closed: eyes_closed,
            right_eye_closed: eyes_closed,
            is_smiling: false,
        }
    }

    #[test]
    fn process_scales_mask_and_composites() {
        let scripted = ScriptedFace::default();
        scripted.set(Some(face(false)));
        let mut processor = FrameProcessor::new(scripted, HalfSegmenter, Background::Transparent);

        let frame = Frame::new(vec![100; 8 * 4 * 4], 8, 4);
        let (result, composited) = processor.process(&frame).unwrap();

        assert_eq!((result.mask.width, result.mask.height), (8, 4));
        assert!(result.observation.face_detected);
        assert_eq!((composited.width, composited.height), (8, 4));
        // Leftmost column is subject, rightmost is background.
        assert_eq!(composited.rgba[3], 255);
        assert_eq!(composited.rgba[7 * 4 + 3], 0);
    }

    #[test]
    fn failed_frames_are_dropped_and_the_stream_continues() {
        let scripted = ScriptedFace::default();
        let processor =
            FrameProcessor::new(scripted.clone(), HalfSegmenter, Background::Transparent);
        let (frame_tx, frame_rx) = bounded(1);
        let (signal_tx, signal_rx) = unbounded();
        let preview = PreviewSlot::new();
        let handle = start_frame_processor(processor, frame_rx, preview.clone(), signal_tx);

        frame_tx.send(Frame::new(vec![0; 4 * 4 * 4], 4, 4)).unwrap();
        assert!(signal_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(preview.latest().is_none());

        scripted.set(Some(face(true)));
        frame_tx.send(Frame::new(vec![0; 4 * 4 * 4], 4, 4)).unwrap();
        let signals = signal_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(signals.face_detected && signals.eyes_closed);
        assert!(preview.latest().is_some());

        drop(frame_tx);
        handle.join().unwrap();
    }
}
