//! Liveness capture state machine.
//!
//! The machine is a plain value driven by [`LivenessEvent`]s and answering
//! with [`Effect`]s for the caller to carry out. It never touches the camera
//! or the network itself, which keeps every transition synchronous and lets
//! the owning thread be the only writer of [`LivenessState`].

use std::{fmt, time::Duration};

use crate::{
    error::{CaptureError, StoreError},
    types::{CapturedPhoto, FaceSignals, PhotoSlot, StoredPhoto},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessState {
    Initial,
    ScanEyesOpen,
    CaptureEyesOpen,
    ScanEyesClosed,
    CaptureEyesClosed,
    Error,
    Finish,
}

impl LivenessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LivenessState::Error | LivenessState::Finish)
    }

    pub fn is_capturing(&self) -> bool {
        matches!(
            self,
            LivenessState::CaptureEyesOpen | LivenessState::CaptureEyesClosed
        )
    }

    /// Slot a photo taken in this state belongs to.
    pub fn capture_slot(&self) -> Option<PhotoSlot> {
        match self {
            LivenessState::CaptureEyesOpen => Some(PhotoSlot::Profile),
            LivenessState::CaptureEyesClosed => Some(PhotoSlot::Focus),
            _ => None,
        }
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LivenessState::Initial => "initial",
            LivenessState::ScanEyesOpen => "scan-eyes-open",
            LivenessState::CaptureEyesOpen => "capture-eyes-open",
            LivenessState::ScanEyesClosed => "scan-eyes-closed",
            LivenessState::CaptureEyesClosed => "capture-eyes-closed",
            LivenessState::Error => "error",
            LivenessState::Finish => "finish",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prompt {
    Begin,
    CenterFace,
    TapToCapture,
    CloseEyesAndTap,
    PleaseCloseEyes,
    HoldStill,
    SaveFailed,
    Done,
    CameraAccessNeeded,
}

impl Prompt {
    pub fn text(&self) -> &'static str {
        match self {
            Prompt::Begin => "Let's take your picture. Tap Begin when you're ready.",
            Prompt::CenterFace => "Center your face in the frame.",
            Prompt::TapToCapture => "Looking good! Tap the preview to take your photo.",
            Prompt::CloseEyesAndTap => "Now close your eyes and tap the preview.",
            Prompt::PleaseCloseEyes => "Please close your eyes.",
            Prompt::HoldStill => "Hold still...",
            Prompt::SaveFailed => "We couldn't save your photo. Please try again.",
            Prompt::Done => "All done!",
            Prompt::CameraAccessNeeded => "Camera access is needed to take your picture.",
        }
    }
}

#[derive(Debug)]
pub enum LivenessEvent {
    BeginTapped,
    PreviewTapped,
    Signals(FaceSignals),
    /// The shutter fired. Carries the signals sampled at that instant.
    PhotoCaptured(CapturedPhoto),
    /// The camera had nothing to capture.
    CaptureUnavailable,
    PersistFinished {
        ticket: u64,
        result: Result<StoredPhoto, StoreError>,
    },
    RecaptureDue,
    Cancelled,
}

#[derive(Debug)]
pub enum Effect {
    Prompt(Prompt),
    TakePhoto(PhotoSlot),
    Persist { ticket: u64, photo: CapturedPhoto },
    ScheduleRecapture(Duration),
    Complete {
        result: Result<(), CaptureError>,
        settle: Duration,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedSlots {
    pub profile: Option<StoredPhoto>,
    pub focus: Option<StoredPhoto>,
}

impl PersistedSlots {
    fn record(&mut self, stored: StoredPhoto) {
        match stored.slot {
            PhotoSlot::Profile => self.profile = Some(stored),
            PhotoSlot::Focus => self.focus = Some(stored),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.profile.is_some() && self.focus.is_some()
    }
}

#[derive(Debug)]
pub struct LivenessMachine {
    state: LivenessState,
    latest: FaceSignals,
    persisted: PersistedSlots,
    pending: Option<(u64, PhotoSlot)>,
    next_ticket: u64,
    recapture_pending: bool,
    completed: bool,
    recapture_delay: Duration,
    finish_settle: Duration,
}

impl LivenessMachine {
    pub fn new(recapture_delay: Duration, finish_settle: Duration) -> Self {
        Self {
            state: LivenessState::Initial,
            latest: FaceSignals::none(),
            persisted: PersistedSlots::default(),
            pending: None,
            next_ticket: 1,
            recapture_pending: false,
            completed: false,
            recapture_delay,
            finish_settle,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn persisted(&self) -> &PersistedSlots {
        &self.persisted
    }

    /// Once the completion has been handed out nothing changes any more.
    pub fn is_done(&self) -> bool {
        self.completed
    }

    /// Prompt for the current state, for a UI that attaches late.
    pub fn current_prompt(&self) -> Prompt {
        match self.state {
            LivenessState::Initial => Prompt::Begin,
            LivenessState::ScanEyesOpen if self.latest.face_detected => Prompt::TapToCapture,
            LivenessState::ScanEyesClosed if self.latest.face_detected => Prompt::CloseEyesAndTap,
            LivenessState::ScanEyesOpen | LivenessState::ScanEyesClosed => Prompt::CenterFace,
            LivenessState::CaptureEyesOpen | LivenessState::CaptureEyesClosed => Prompt::HoldStill,
            LivenessState::Error => Prompt::SaveFailed,
            LivenessState::Finish => Prompt::Done,
        }
    }

    pub fn handle(&mut self, event: LivenessEvent) -> Vec<Effect> {
        if self.completed {
            log::debug!("ignoring {event:?} after completion");
            return Vec::new();
        }

        match event {
            LivenessEvent::BeginTapped => self.on_begin(),
            LivenessEvent::PreviewTapped => self.on_tap(),
            LivenessEvent::Signals(signals) => self.on_signals(signals),
            LivenessEvent::PhotoCaptured(photo) => self.on_captured(photo),
            LivenessEvent::CaptureUnavailable => self.on_capture_unavailable(),
            LivenessEvent::PersistFinished { ticket, result } => self.on_persisted(ticket, result),
            LivenessEvent::RecaptureDue => self.on_recapture_due(),
            LivenessEvent::Cancelled => self.on_cancelled(),
        }
    }

    fn transition(&mut self, to: LivenessState) {
        log::info!("liveness: {} -> {}", self.state, to);
        self.state = to;
    }

    fn on_begin(&mut self) -> Vec<Effect> {
        if self.state != LivenessState::Initial {
            return Vec::new();
        }
        self.transition(LivenessState::ScanEyesOpen);
        vec![Effect::Prompt(self.current_prompt())]
    }

    fn on_tap(&mut self) -> Vec<Effect> {
        let next = match self.state {
            LivenessState::ScanEyesOpen => LivenessState::CaptureEyesOpen,
            LivenessState::ScanEyesClosed => LivenessState::CaptureEyesClosed,
            // Taps while a capture is in flight are ignored.
            _ => return Vec::new(),
        };
        if !self.latest.face_detected {
            return vec![Effect::Prompt(Prompt::CenterFace)];
        }
        self.recapture_pending = false;
        self.start_capture(next)
    }

    fn start_capture(&mut self, capture_state: LivenessState) -> Vec<Effect> {
        self.transition(capture_state);
        match capture_state.capture_slot() {
            Some(slot) => vec![Effect::Prompt(Prompt::HoldStill), Effect::TakePhoto(slot)],
            None => Vec::new(),
        }
    }

    fn on_signals(&mut self, signals: FaceSignals) -> Vec<Effect> {
        let face_changed = signals.face_detected != self.latest.face_detected;
        self.latest = signals;

        let scanning = matches!(
            self.state,
            LivenessState::ScanEyesOpen | LivenessState::ScanEyesClosed
        );
        if scanning && face_changed {
            vec![Effect::Prompt(self.current_prompt())]
        } else {
            Vec::new()
        }
    }

    fn on_captured(&mut self, photo: CapturedPhoto) -> Vec<Effect> {
        if self.pending.is_some() || self.state.capture_slot() != Some(photo.slot) {
            log::warn!("discarding unexpected {} capture in {}", photo.slot, self.state);
            return Vec::new();
        }

        match self.state {
            LivenessState::CaptureEyesOpen if !photo.signals.face_detected => {
                self.transition(LivenessState::ScanEyesOpen);
                vec![Effect::Prompt(Prompt::CenterFace)]
            }
            LivenessState::CaptureEyesClosed if !photo.signals.eyes_closed => {
                log::info!("eyes were open at capture time, asking again");
                self.transition(LivenessState::ScanEyesClosed);
                self.recapture_pending = true;
                vec![
                    Effect::Prompt(Prompt::PleaseCloseEyes),
                    Effect::ScheduleRecapture(self.recapture_delay),
                ]
            }
            _ => {
                let ticket = self.next_ticket;
                self.next_ticket += 1;
                self.pending = Some((ticket, photo.slot));
                vec![Effect::Persist { ticket, photo }]
            }
        }
    }

    fn on_capture_unavailable(&mut self) -> Vec<Effect> {
        let back_to = match self.state {
            LivenessState::CaptureEyesOpen if self.pending.is_none() => LivenessState::ScanEyesOpen,
            LivenessState::CaptureEyesClosed if self.pending.is_none() => {
                LivenessState::ScanEyesClosed
            }
            _ => return Vec::new(),
        };
        self.transition(back_to);
        vec![Effect::Prompt(self.current_prompt())]
    }

    fn on_persisted(&mut self, ticket: u64, result: Result<StoredPhoto, StoreError>) -> Vec<Effect> {
        let Some((pending_ticket, slot)) = self.pending else {
            log::debug!("ignoring persistence result {ticket} with nothing pending");
            return Vec::new();
        };
        if pending_ticket != ticket {
            log::debug!("ignoring stale persistence result {ticket}");
            return Vec::new();
        }
        self.pending = None;

        match result {
            Err(source) => {
                log::error!("failed to persist {slot}: {source}");
                self.transition(LivenessState::Error);
                self.completed = true;
                vec![
                    Effect::Prompt(Prompt::SaveFailed),
                    Effect::Complete {
                        result: Err(CaptureError::Persistence { slot, source }),
                        settle: Duration::ZERO,
                    },
                ]
            }
            Ok(stored) => {
                log::info!("persisted {slot} at {}", stored.location);
                self.persisted.record(stored);
                match self.state {
                    LivenessState::CaptureEyesOpen => {
                        self.transition(LivenessState::ScanEyesClosed);
                        vec![Effect::Prompt(self.current_prompt())]
                    }
                    LivenessState::CaptureEyesClosed if self.persisted.is_complete() => {
                        self.transition(LivenessState::Finish);
                        self.completed = true;
                        vec![
                            Effect::Prompt(Prompt::Done),
                            Effect::Complete {
                                result: Ok(()),
                                settle: self.finish_settle,
                            },
                        ]
                    }
                    LivenessState::CaptureEyesClosed => {
                        // Focus saved but the profile slot is missing.
                        self.transition(LivenessState::ScanEyesOpen);
                        vec![Effect::Prompt(self.current_prompt())]
                    }
                    _ => Vec::new(),
                }
            }
        }
    }

    fn on_recapture_due(&mut self) -> Vec<Effect> {
        if !self.recapture_pending || self.state != LivenessState::ScanEyesClosed {
            return Vec::new();
        }
        self.recapture_pending = false;
        if !self.latest.face_detected {
            return vec![Effect::Prompt(Prompt::CenterFace)];
        }
        self.start_capture(LivenessState::CaptureEyesClosed)
    }

    fn on_cancelled(&mut self) -> Vec<Effect> {
        log::info!("liveness capture cancelled in {}", self.state);
        self.pending = None;
        self.recapture_pending = false;
        self.completed = true;
        vec![Effect::Complete {
            result: Err(CaptureError::Cancelled),
            settle: Duration::ZERO,
        }]
    }
}
