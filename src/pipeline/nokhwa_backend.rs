use anyhow::{Result, anyhow};
use crossbeam_channel::bounded;
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    query,
    utils::{
        ApiBackend, CameraIndex, CameraInfo, FrameFormat, RequestedFormat, RequestedFormatType,
    },
};

use super::{
    camera::{Authorization, CameraPermission, FrameSource, FrameSourceFactory},
    rgba_converter::{self, PixelFormat, RawImage},
};
use crate::types::Frame;

// Prefer pixel formats that are widely supported on macOS (the built-in cameras
// often reject YUYV even though Nokhwa reports it).
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
    FrameFormat::GRAY,
];

fn requested_formats() -> [RequestedFormat<'static>; 4] {
    [
        // Selfie capture wants detail over frame rate.
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestResolution,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: CameraIndex,
    pub label: String,
}

pub fn available_cameras() -> Result<Vec<CameraDevice>> {
    let cameras = query(ApiBackend::Auto)?;
    Ok(cameras
        .into_iter()
        .map(|info: CameraInfo| CameraDevice {
            index: info.index().clone(),
            label: info.human_name(),
        })
        .collect())
}

fn build_camera(index: &CameraIndex) -> Result<Camera> {
    let mut last_err = None;

    for requested in requested_formats() {
        match Camera::new(index.clone(), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
}

pub struct NokhwaCamera {
    index: CameraIndex,
    mirror: bool,
}

impl NokhwaCamera {
    pub fn new(index: CameraIndex, mirror: bool) -> Self {
        Self { index, mirror }
    }
}

impl FrameSourceFactory for NokhwaCamera {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        let camera = build_camera(&self.index)?;
        log::info!(
            "opened camera {:?} at {:?}",
            self.index,
            camera.camera_format()
        );
        Ok(Box::new(NokhwaSource {
            camera,
            mirror: self.mirror,
        }))
    }
}

struct NokhwaSource {
    camera: Camera,
    mirror: bool,
}

impl FrameSource for NokhwaSource {
    fn next_frame(&mut self) -> Result<Frame> {
        let buffer = self.camera.frame()?;
        let resolution = buffer.resolution();
        let raw = RawImage {
            format: pixel_format(buffer.source_frame_format()),
            data: buffer.buffer(),
            width: resolution.width_x,
            height: resolution.height_y,
        };
        rgba_converter::decode_frame(&raw, self.mirror)
    }
}

impl Drop for NokhwaSource {
    fn drop(&mut self) {
        if let Err(err) = self.camera.stop_stream() {
            log::warn!("failed to stop camera stream: {err:?}");
        }
    }
}

fn pixel_format(format: FrameFormat) -> PixelFormat {
    match format {
        FrameFormat::NV12 => PixelFormat::Nv12,
        FrameFormat::YUYV => PixelFormat::Yuyv,
        FrameFormat::MJPEG => PixelFormat::Mjpeg,
        FrameFormat::RAWRGB => PixelFormat::Rgb,
        FrameFormat::RAWBGR => PixelFormat::Bgr,
        FrameFormat::GRAY => PixelFormat::Gray,
    }
}

/// The OS media-authorization prompt, where the platform has one.
#[derive(Clone, Copy, Debug, Default)]
pub struct NokhwaPermission;

impl CameraPermission for NokhwaPermission {
    fn status(&self) -> Authorization {
        if nokhwa::nokhwa_check() {
            Authorization::Authorized
        } else {
            Authorization::NotDetermined
        }
    }

    fn request(&self) -> bool {
        let (tx, rx) = bounded(1);
        nokhwa::nokhwa_initialize(move |granted| {
            let _ = tx.try_send(granted);
        });
        rx.recv().unwrap_or(false)
    }
}
