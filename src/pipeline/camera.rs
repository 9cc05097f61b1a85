use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Sender, bounded};

use super::preview::{self, PreviewSlot};
use crate::{
    error::CaptureError,
    types::{Frame, StillImage},
};

/// A camera that is open and streaming. Not required to be `Send`: some
/// backends must be opened and read on the same thread.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame>;
}

pub trait FrameSourceFactory: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn FrameSource>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authorization {
    Authorized,
    Denied,
    NotDetermined,
}

pub trait CameraPermission: Send + Sync {
    fn status(&self) -> Authorization;

    /// Prompts the user and blocks until they answer.
    fn request(&self) -> bool;
}

/// For platforms without a media-authorization prompt.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAuthorized;

impl CameraPermission for AlwaysAuthorized {
    fn status(&self) -> Authorization {
        Authorization::Authorized
    }

    fn request(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    PermissionDenied,
}

#[derive(Debug)]
struct CameraStream {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CameraStream {
    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Owns the camera. Nothing else starts or stops it.
pub struct CaptureSession {
    factory: Arc<dyn FrameSourceFactory>,
    permission: Box<dyn CameraPermission>,
    frame_tx: Sender<Frame>,
    preview: PreviewSlot,
    jpeg_quality: u8,
    stream: Option<CameraStream>,
}

impl CaptureSession {
    pub fn new(
        factory: Arc<dyn FrameSourceFactory>,
        permission: Box<dyn CameraPermission>,
        frame_tx: Sender<Frame>,
        preview: PreviewSlot,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            factory,
            permission,
            frame_tx,
            preview,
            jpeg_quality,
            stream: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    pub fn begin(&mut self) -> Result<SessionStatus, CaptureError> {
        if self.is_running() {
            return Ok(SessionStatus::Running);
        }

        let granted = match self.permission.status() {
            Authorization::Authorized => true,
            Authorization::Denied => false,
            Authorization::NotDetermined => self.permission.request(),
        };
        if !granted {
            log::info!("camera permission denied; capture session not started");
            return Ok(SessionStatus::PermissionDenied);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let factory = self.factory.clone();
        let frame_tx = self.frame_tx.clone();
        let (opened_tx, opened_rx) = bounded(1);

        let handle = thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || run_capture_loop(factory, frame_tx, stop_flag, opened_tx))
            .map_err(CaptureError::device)?;

        // The capture thread holds the only open camera and reports once.
        let opened = opened_rx
            .recv()
            .unwrap_or_else(|_| Err(anyhow!("capture thread exited before opening the camera")));
        if let Err(err) = opened {
            let _ = handle.join();
            return Err(CaptureError::device(err));
        }

        log::info!("capture session started");
        self.stream = Some(CameraStream {
            stop,
            handle: Some(handle),
        });
        Ok(SessionStatus::Running)
    }

    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.halt();
            self.preview.clear();
            log::info!("capture session stopped");
        }
    }

    /// Still image of the current composited preview, or `None` if the
    /// session is not running or nothing has been composited yet.
    pub fn capture_photo(&self) -> Result<Option<StillImage>> {
        if !self.is_running() {
            return Ok(None);
        }
        let Some(frame) = self.preview.latest() else {
            return Ok(None);
        };
        preview::encode_jpeg(&frame, self.jpeg_quality).map(Some)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_loop(
    factory: Arc<dyn FrameSourceFactory>,
    frame_tx: Sender<Frame>,
    stop_flag: Arc<AtomicBool>,
    opened_tx: Sender<Result<()>>,
) {
    let mut source = match factory.open() {
        Ok(source) => {
            let _ = opened_tx.send(Ok(()));
            source
        }
        Err(err) => {
            log::error!("failed to open camera: {err:?}");
            let _ = opened_tx.send(Err(err));
            return;
        }
    };

    while !stop_flag.load(Ordering::Relaxed) {
        let read_start = Instant::now();
        match source.next_frame() {
            // Drop if the processor is busy.
            Ok(frame) => {
                let _ = frame_tx.try_send(frame);
            }
            Err(err) => {
                log::warn!(
                    "camera frame read failed (after {:?}): {err:?}",
                    read_start.elapsed()
                );
            }
        }
    }
}
