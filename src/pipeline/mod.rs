pub mod analyzer;
pub mod camera;
pub mod compositor;
#[cfg(feature = "camera-nokhwa")]
pub mod nokhwa_backend;
pub mod preview;
pub mod processor;
pub mod rgba_converter;

pub use camera::{
    AlwaysAuthorized, Authorization, CameraPermission, CaptureSession, FrameSource,
    FrameSourceFactory, SessionStatus,
};
pub use preview::PreviewSlot;
pub use processor::{FrameProcessor, start_frame_processor};
