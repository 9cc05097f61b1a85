//! Capture flow coordinator.
//!
//! Owns the capture session, the frame processor worker and the liveness
//! machine. Everything that mutates liveness state happens on the thread
//! that calls [`run_capture_flow`]; workers only talk to it over channels.

use std::{
    collections::VecDeque,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, after, bounded, never, select, unbounded};

use crate::{
    config::CaptureConfig,
    error::CaptureError,
    liveness::{Effect, LivenessEvent, LivenessMachine, LivenessState, Prompt},
    pipeline::{
        CameraPermission, CaptureSession, FrameProcessor, FrameSourceFactory, PreviewSlot,
        SessionStatus,
        analyzer::{FaceAnalyzer, PersonSegmenter},
        start_frame_processor,
    },
    publisher::{Completion, PhotoStore, PersistOutcome, ResultPublisher},
    types::{CapturedPhoto, FaceSignals, PhotoSlot},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserInput {
    Begin,
    TapPreview,
    Cancel,
}

/// What a UI needs to redraw.
#[derive(Clone, Copy, Debug)]
pub enum FlowUpdate {
    State {
        state: LivenessState,
        prompt: Prompt,
    },
    Signals(FaceSignals),
}

pub struct FlowParts<F, S> {
    pub camera: Arc<dyn FrameSourceFactory>,
    pub permission: Box<dyn CameraPermission>,
    pub face: F,
    pub segmenter: S,
    pub store: Arc<dyn PhotoStore>,
    /// Composited frames for the preview surface.
    pub preview: PreviewSlot,
}

/// Runs one liveness capture to completion on the calling thread and
/// returns the state it ended in. `completion` fires exactly once.
pub fn run_capture_flow<F, S>(
    parts: FlowParts<F, S>,
    config: &CaptureConfig,
    input_rx: Receiver<UserInput>,
    update_tx: Sender<FlowUpdate>,
    completion: Completion,
) -> LivenessState
where
    F: FaceAnalyzer,
    S: PersonSegmenter,
{
    let FlowParts {
        camera,
        permission,
        face,
        segmenter,
        store,
        preview,
    } = parts;

    let (frame_tx, frame_rx) = bounded(1);
    let (signal_tx, signal_rx) = unbounded();
    let (outcome_tx, outcome_rx) = unbounded();

    let processor = FrameProcessor::new(face, segmenter, config.background);
    let processor_handle = start_frame_processor(processor, frame_rx, preview.clone(), signal_tx);

    let session = CaptureSession::new(camera, permission, frame_tx, preview, config.jpeg_quality);
    let mut driver = FlowDriver {
        machine: LivenessMachine::new(config.recapture_delay, config.finish_settle),
        session,
        publisher: ResultPublisher::new(store, outcome_tx),
        update_tx,
        completion,
        latest: FaceSignals::none(),
        recapture: None,
        signals_open: true,
        camera_denied: false,
        done: false,
    };
    driver.run(&input_rx, &signal_rx, &outcome_rx);

    let state = driver.machine.state();
    // Dropping the session releases the last frame sender, which ends the
    // processor loop.
    drop(driver);
    drop(signal_rx);
    if processor_handle.join().is_err() {
        log::error!("frame processor panicked");
    }
    log::info!("capture flow ended in {state}");
    state
}

struct FlowDriver {
    machine: LivenessMachine,
    session: CaptureSession,
    publisher: ResultPublisher,
    update_tx: Sender<FlowUpdate>,
    completion: Completion,
    latest: FaceSignals,
    recapture: Option<Receiver<Instant>>,
    signals_open: bool,
    camera_denied: bool,
    done: bool,
}

impl FlowDriver {
    fn run(
        &mut self,
        input_rx: &Receiver<UserInput>,
        signal_rx: &Receiver<FaceSignals>,
        outcome_rx: &Receiver<PersistOutcome>,
    ) {
        self.publish_state(self.machine.current_prompt());

        match self.session.begin() {
            Ok(SessionStatus::Running) => {}
            Ok(SessionStatus::PermissionDenied) => {
                self.camera_denied = true;
                self.publish_state(Prompt::CameraAccessNeeded);
            }
            Err(err) => {
                log::error!("could not start capture session: {err}");
                self.finish(Err(err), Duration::ZERO);
                return;
            }
        }

        while !self.done {
            let signals = if self.signals_open {
                signal_rx.clone()
            } else {
                never()
            };
            let recapture = self.recapture.clone().unwrap_or_else(never);

            select! {
                recv(input_rx) -> input => match input {
                    // Without a camera there is nothing to scan or capture.
                    Ok(UserInput::Begin | UserInput::TapPreview) if self.camera_denied => {
                        self.publish_state(Prompt::CameraAccessNeeded);
                    }
                    Ok(UserInput::Begin) => self.dispatch(LivenessEvent::BeginTapped, signal_rx),
                    Ok(UserInput::TapPreview) => {
                        self.dispatch(LivenessEvent::PreviewTapped, signal_rx)
                    }
                    Ok(UserInput::Cancel) | Err(_) => {
                        self.dispatch(LivenessEvent::Cancelled, signal_rx)
                    }
                },
                recv(signals) -> received => match received {
                    Ok(signals) => {
                        let signals = drain_latest(signals, signal_rx);
                        self.absorb_signals(signals);
                        self.dispatch(LivenessEvent::Signals(signals), signal_rx);
                    }
                    Err(_) => {
                        log::error!("frame processor went away");
                        self.signals_open = false;
                    }
                },
                recv(outcome_rx) -> outcome => {
                    if let Ok(outcome) = outcome {
                        log::debug!("upload {} for {} finished", outcome.ticket, outcome.slot);
                        self.dispatch(
                            LivenessEvent::PersistFinished {
                                ticket: outcome.ticket,
                                result: outcome.result,
                            },
                            signal_rx,
                        );
                    }
                }
                recv(recapture) -> _ => {
                    self.recapture = None;
                    self.dispatch(LivenessEvent::RecaptureDue, signal_rx);
                }
            }
        }
    }

    fn dispatch(&mut self, event: LivenessEvent, signal_rx: &Receiver<FaceSignals>) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for effect in self.machine.handle(event) {
                self.apply(effect, signal_rx, &mut queue);
            }
        }
    }

    fn apply(
        &mut self,
        effect: Effect,
        signal_rx: &Receiver<FaceSignals>,
        queue: &mut VecDeque<LivenessEvent>,
    ) {
        match effect {
            Effect::Prompt(prompt) => self.publish_state(prompt),
            Effect::TakePhoto(slot) => {
                // Guards are checked against the freshest analysis.
                if let Ok(first) = signal_rx.try_recv() {
                    let signals = drain_latest(first, signal_rx);
                    self.absorb_signals(signals);
                    queue.push_back(LivenessEvent::Signals(signals));
                }
                queue.push_back(self.shoot(slot));
            }
            Effect::Persist { ticket, photo } => self.publisher.persist(ticket, photo),
            Effect::ScheduleRecapture(delay) => self.recapture = Some(after(delay)),
            Effect::Complete { result, settle } => self.finish(result, settle),
        }
    }

    fn shoot(&self, slot: PhotoSlot) -> LivenessEvent {
        match self.session.capture_photo() {
            Ok(Some(image)) => LivenessEvent::PhotoCaptured(CapturedPhoto {
                slot,
                image,
                signals: self.latest,
            }),
            Ok(None) => {
                log::warn!("no preview frame to capture the {slot} from");
                LivenessEvent::CaptureUnavailable
            }
            Err(err) => {
                log::warn!("capturing the {slot} failed: {err:?}");
                LivenessEvent::CaptureUnavailable
            }
        }
    }

    fn absorb_signals(&mut self, signals: FaceSignals) {
        self.latest = signals;
        let _ = self.update_tx.send(FlowUpdate::Signals(signals));
    }

    fn publish_state(&self, prompt: Prompt) {
        let _ = self.update_tx.send(FlowUpdate::State {
            state: self.machine.state(),
            prompt,
        });
    }

    /// Tears everything down before the caller hears about it.
    fn finish(&mut self, result: Result<(), CaptureError>, settle: Duration) {
        self.session.stop();
        self.publisher.cancel();
        self.recapture = None;
        if !settle.is_zero() {
            thread::sleep(settle);
        }
        self.completion.fire(result);
        self.done = true;
    }
}

fn drain_latest(first: FaceSignals, signal_rx: &Receiver<FaceSignals>) -> FaceSignals {
    let mut latest = first;
    while let Ok(newer) = signal_rx.try_recv() {
        latest = newer;
    }
    latest
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::RecvTimeoutError;

    use super::*;
    use crate::{
        config::Background,
        error::StoreError,
        pipeline::{
            AlwaysAuthorized, Authorization,
            camera::tests::SyntheticCamera,
            processor::tests::{HalfSegmenter, ScriptedFace, face},
        },
        publisher::tests::MemoryStore,
    };

    const WAIT: Duration = Duration::from_secs(5);

    struct Denied;

    impl CameraPermission for Denied {
        fn status(&self) -> Authorization {
            Authorization::Denied
        }

        fn request(&self) -> bool {
            false
        }
    }

    struct Harness {
        input_tx: Sender<UserInput>,
        update_rx: Receiver<FlowUpdate>,
        result_rx: Receiver<Result<(), CaptureError>>,
        flow: thread::JoinHandle<LivenessState>,
    }

    impl Harness {
        fn start(
            scripted: ScriptedFace,
            store: Arc<MemoryStore>,
            permission: Box<dyn CameraPermission>,
            recapture_delay: Duration,
        ) -> Self {
            Self::with_camera(
                SyntheticCamera::new(),
                scripted,
                store,
                permission,
                recapture_delay,
            )
        }

        fn with_camera(
            camera: Arc<dyn FrameSourceFactory>,
            scripted: ScriptedFace,
            store: Arc<MemoryStore>,
            permission: Box<dyn CameraPermission>,
            recapture_delay: Duration,
        ) -> Self {
            let config = CaptureConfig {
                background: Background::Solid([0, 0, 0, 255]),
                recapture_delay,
                finish_settle: Duration::ZERO,
                ..CaptureConfig::default()
            };
            let parts = FlowParts {
                camera,
                permission,
                face: scripted,
                segmenter: HalfSegmenter,
                store,
                preview: PreviewSlot::new(),
            };
            let (input_tx, input_rx) = unbounded();
            let (update_tx, update_rx) = unbounded();
            let (result_tx, result_rx) = unbounded();
            let completion = Completion::new(move |result| {
                let _ = result_tx.send(result);
            });

            let flow = thread::spawn(move || {
                run_capture_flow(parts, &config, input_rx, update_tx, completion)
            });
            Self {
                input_tx,
                update_rx,
                result_rx,
                flow,
            }
        }

        fn send(&self, input: UserInput) {
            self.input_tx.send(input).unwrap();
        }

        fn wait_for(&self, mut matches: impl FnMut(&FlowUpdate) -> bool) -> FlowUpdate {
            let deadline = Instant::now() + WAIT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.update_rx.recv_timeout(remaining) {
                    Ok(update) if matches(&update) => return update,
                    Ok(_) => {}
                    Err(RecvTimeoutError::Timeout) => panic!("timed out waiting for update"),
                    Err(RecvTimeoutError::Disconnected) => panic!("flow ended early"),
                }
            }
        }

        fn wait_for_state(&self, wanted: LivenessState) -> Prompt {
            match self.wait_for(
                |u| matches!(u, FlowUpdate::State { state, .. } if *state == wanted),
            ) {
                FlowUpdate::State { prompt, .. } => prompt,
                FlowUpdate::Signals(_) => unreachable!(),
            }
        }

        /// Joins the flow; returns its end state, every completion it fired
        /// and the updates nobody waited for.
        fn finish(self) -> (LivenessState, Vec<Result<(), CaptureError>>, Vec<FlowUpdate>) {
            let state = self.flow.join().unwrap();
            (
                state,
                self.result_rx.try_iter().collect(),
                self.update_rx.try_iter().collect(),
            )
        }
    }

    fn eyes_closed_seen(update: &FlowUpdate) -> bool {
        matches!(update, FlowUpdate::Signals(s) if s.face_detected && s.eyes_closed)
    }

    #[test]
    fn open_then_closed_eyes_finishes_with_both_photos() {
        let scripted = ScriptedFace::default();
        scripted.set(Some(face(false)));
        let store = Arc::new(MemoryStore::default());
        let harness = Harness::start(
            scripted.clone(),
            store.clone(),
            Box::new(AlwaysAuthorized),
            Duration::from_secs(30),
        );

        harness.send(UserInput::Begin);
        harness.wait_for(|u| {
            matches!(
                u,
                FlowUpdate::State {
                    state: LivenessState::ScanEyesOpen,
                    prompt: Prompt::TapToCapture,
                }
            )
        });
        harness.send(UserInput::TapPreview);
        harness.wait_for_state(LivenessState::ScanEyesClosed);

        scripted.set(Some(face(true)));
        harness.wait_for(eyes_closed_seen);
        harness.send(UserInput::TapPreview);
        assert_eq!(harness.wait_for_state(LivenessState::Finish), Prompt::Done);

        let (state, results, _) = harness.finish();
        assert_eq!(state, LivenessState::Finish);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());

        let stored = store.stored.lock().unwrap();
        let slots: Vec<_> = stored.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![PhotoSlot::Profile, PhotoSlot::Focus]);
        assert!(stored.iter().all(|(_, jpeg)| jpeg.starts_with(&[0xff, 0xd8])));
    }

    #[test]
    fn open_eyes_at_focus_capture_asks_again() {
        let scripted = ScriptedFace::default();
        scripted.set(Some(face(false)));
        let store = Arc::new(MemoryStore::default());
        let harness = Harness::start(
            scripted,
            store.clone(),
            Box::new(AlwaysAuthorized),
            Duration::from_secs(30),
        );

        harness.send(UserInput::Begin);
        harness.wait_for(|u| matches!(u, FlowUpdate::State { prompt: Prompt::TapToCapture, .. }));
        harness.send(UserInput::TapPreview);
        harness.wait_for_state(LivenessState::ScanEyesClosed);

        harness.send(UserInput::TapPreview);
        harness.wait_for_state(LivenessState::CaptureEyesClosed);
        assert_eq!(
            harness.wait_for_state(LivenessState::ScanEyesClosed),
            Prompt::PleaseCloseEyes
        );

        harness.send(UserInput::Cancel);
        let (state, results, _) = harness.finish();
        assert_eq!(state, LivenessState::ScanEyesClosed);
        assert!(matches!(results.as_slice(), [Err(CaptureError::Cancelled)]));
        assert_eq!(store.stored.lock().unwrap().len(), 1);
    }

    #[test]
    fn upload_failure_completes_once_with_error() {
        let scripted = ScriptedFace::default();
        scripted.set(Some(face(false)));
        let store = Arc::new(MemoryStore {
            fail_slot: Some(PhotoSlot::Profile),
            ..Default::default()
        });
        let harness = Harness::start(
            scripted,
            store,
            Box::new(AlwaysAuthorized),
            Duration::from_secs(30),
        );

        harness.send(UserInput::Begin);
        harness.wait_for(|u| matches!(u, FlowUpdate::State { prompt: Prompt::TapToCapture, .. }));
        harness.send(UserInput::TapPreview);
        assert_eq!(
            harness.wait_for_state(LivenessState::Error),
            Prompt::SaveFailed
        );

        let (state, results, _) = harness.finish();
        assert_eq!(state, LivenessState::Error);
        assert!(matches!(
            results.as_slice(),
            [Err(CaptureError::Persistence {
                slot: PhotoSlot::Profile,
                source: StoreError::Rejected { status: 503 },
            })]
        ));
    }

    #[test]
    fn denied_camera_stays_passive_until_cancelled() {
        let scripted = ScriptedFace::default();
        scripted.set(Some(face(false)));
        let harness = Harness::start(
            scripted,
            Arc::new(MemoryStore::default()),
            Box::new(Denied),
            Duration::from_secs(30),
        );

        harness.wait_for(|u| {
            matches!(u, FlowUpdate::State { prompt: Prompt::CameraAccessNeeded, .. })
        });
        harness.send(UserInput::Begin);
        harness.send(UserInput::TapPreview);
        for _ in 0..2 {
            let update = harness.wait_for(|u| matches!(u, FlowUpdate::State { .. }));
            assert!(matches!(
                update,
                FlowUpdate::State {
                    state: LivenessState::Initial,
                    prompt: Prompt::CameraAccessNeeded,
                }
            ));
        }

        harness.send(UserInput::Cancel);
        let (state, results, updates) = harness.finish();
        assert_eq!(state, LivenessState::Initial);
        assert!(matches!(results.as_slice(), [Err(CaptureError::Cancelled)]));
        assert!(updates.iter().all(|u| !matches!(
            u,
            FlowUpdate::State {
                prompt: Prompt::CenterFace | Prompt::TapToCapture,
                ..
            }
        )));
    }

    #[test]
    fn closing_the_input_channel_cancels() {
        let harness = Harness::start(
            ScriptedFace::default(),
            Arc::new(MemoryStore::default()),
            Box::new(AlwaysAuthorized),
            Duration::from_secs(30),
        );
        harness.wait_for_state(LivenessState::Initial);

        let Harness {
            input_tx,
            result_rx,
            flow,
            ..
        } = harness;
        drop(input_tx);
        assert_eq!(flow.join().unwrap(), LivenessState::Initial);
        assert!(matches!(
            result_rx.recv_timeout(WAIT),
            Ok(Err(CaptureError::Cancelled))
        ));
    }

    #[test]
    fn open_eyes_at_focus_capture_retries_on_its_own() {
        let scripted = ScriptedFace::default();
        scripted.set(Some(face(false)));
        let store = Arc::new(MemoryStore::default());
        let harness = Harness::start(
            scripted.clone(),
            store.clone(),
            Box::new(AlwaysAuthorized),
            Duration::from_millis(50),
        );

        harness.send(UserInput::Begin);
        harness.wait_for(|u| matches!(u, FlowUpdate::State { prompt: Prompt::TapToCapture, .. }));
        harness.send(UserInput::TapPreview);
        harness.wait_for_state(LivenessState::ScanEyesClosed);
        harness.send(UserInput::TapPreview);
        harness.wait_for(|u| {
            matches!(u, FlowUpdate::State { prompt: Prompt::PleaseCloseEyes, .. })
        });

        // No further taps: the scheduled re-capture takes the focus photo
        // once the eyes are closed.
        scripted.set(Some(face(true)));
        assert_eq!(harness.wait_for_state(LivenessState::Finish), Prompt::Done);

        let (state, results, _) = harness.finish();
        assert_eq!(state, LivenessState::Finish);
        assert!(matches!(results.as_slice(), [Ok(())]));
        let slots: Vec<_> = store.stored.lock().unwrap().iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![PhotoSlot::Profile, PhotoSlot::Focus]);
    }

    #[test]
    fn cancel_during_upload_discards_its_result() {
        let scripted = ScriptedFace::default();
        scripted.set(Some(face(false)));
        let (release_tx, release_rx) = bounded(1);
        let store = Arc::new(MemoryStore {
            gate: Some(release_rx),
            ..Default::default()
        });
        let harness = Harness::start(
            scripted,
            store.clone(),
            Box::new(AlwaysAuthorized),
            Duration::from_secs(30),
        );

        harness.send(UserInput::Begin);
        harness.wait_for(|u| matches!(u, FlowUpdate::State { prompt: Prompt::TapToCapture, .. }));
        harness.send(UserInput::TapPreview);
        harness.wait_for_state(LivenessState::CaptureEyesOpen);

        harness.send(UserInput::Cancel);
        let (state, results, updates) = harness.finish();
        release_tx.send(()).unwrap();

        assert_eq!(state, LivenessState::CaptureEyesOpen);
        assert!(matches!(results.as_slice(), [Err(CaptureError::Cancelled)]));
        assert!(updates.iter().all(|u| !matches!(
            u,
            FlowUpdate::State {
                state: LivenessState::ScanEyesClosed | LivenessState::Error,
                ..
            }
        )));

        // The upload itself still runs to the end.
        let deadline = Instant::now() + WAIT;
        while store.stored.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(store.stored.lock().unwrap().len(), 1);
    }

    #[test]
    fn camera_that_cannot_open_fails_the_flow() {
        let camera = Arc::new(SyntheticCamera {
            opened: Default::default(),
            fail_open: true,
        });
        let harness = Harness::with_camera(
            camera,
            ScriptedFace::default(),
            Arc::new(MemoryStore::default()),
            Box::new(AlwaysAuthorized),
            Duration::from_secs(30),
        );

        let (state, results, _) = harness.finish();
        assert_eq!(state, LivenessState::Initial);
        assert!(matches!(
            results.as_slice(),
            [Err(CaptureError::DeviceConfiguration(msg))] if msg.contains("no such device")
        ));
    }
}
