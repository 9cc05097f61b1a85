use std::path::Path;

use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use ort::session::{Session, builder::GraphOptimizationLevel};
use rayon::prelude::*;

use crate::types::Frame;

pub fn load_session(model_path: &Path, label: &str) -> Result<Session> {
    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(2)?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load {label} from {}", model_path.display()))
}

fn check_frame(frame: &Frame) -> Result<()> {
    if frame.rgba.len() != frame.expected_len() || frame.width == 0 || frame.height == 0 {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.rgba.len(),
            frame.expected_len()
        ));
    }
    Ok(())
}

fn to_nhwc(rgba: &[u8], size: u32) -> Result<Array4<f32>> {
    let normalized: Vec<f32> = rgba
        .par_chunks_exact(4)
        .flat_map_iter(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect();
    Array4::<f32>::from_shape_vec((1, size as usize, size as usize, 3), normalized)
        .map_err(|err| anyhow!("failed to build input tensor: {err}"))
}

/// Stretches the whole frame to `size`x`size`. Segmentation output is
/// stretched back, so aspect ratio does not need preserving.
pub fn resize_to_square(frame: &Frame, size: u32) -> Result<Array4<f32>> {
    check_frame(frame)?;

    let src = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba.clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst = fir::images::Image::new(size, size, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    fir::Resizer::new()
        .resize(&src, &mut dst, Some(&options))
        .context("fast resize failed")?;

    to_nhwc(&dst.into_vec(), size)
}

/// Maps points in a square center crop back to frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CenterCrop {
    pub left: f32,
    pub top: f32,
    pub side: f32,
    pub output_size: u32,
}

impl CenterCrop {
    pub fn for_frame(frame: &Frame, output_size: u32) -> Self {
        let side = frame.width.min(frame.height) as f32;
        Self {
            left: (frame.width as f32 - side) / 2.0,
            top: (frame.height as f32 - side) / 2.0,
            side,
            output_size,
        }
    }

    pub fn project(&self, x: f32, y: f32) -> (f32, f32) {
        let scale = self.side / self.output_size as f32;
        (self.left + x * scale, self.top + y * scale)
    }
}

/// Samples the largest centered square of the frame at `output_size`.
/// Selfie framing keeps the face near the center, so no detector pass is
/// needed before the landmark model.
pub fn center_crop(frame: &Frame, output_size: u32) -> Result<(Array4<f32>, CenterCrop)> {
    check_frame(frame)?;
    let crop = CenterCrop::for_frame(frame, output_size);

    let mut data = vec![0f32; output_size as usize * output_size as usize * 3];
    data.par_chunks_mut(output_size as usize * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..output_size as usize {
                let (sx, sy) = crop.project(x as f32 + 0.5, y as f32 + 0.5);
                let rgb = sample_rgb(frame, sx - 0.5, sy - 0.5);
                row[x * 3..x * 3 + 3].copy_from_slice(&rgb);
            }
        });

    let input = Array4::<f32>::from_shape_vec(
        (1, output_size as usize, output_size as usize, 3),
        data,
    )
    .map_err(|err| anyhow!("failed to build crop tensor: {err}"))?;

    Ok((input, crop))
}

fn sample_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    if x.is_nan() || y.is_nan() {
        return [0.0, 0.0, 0.0];
    }
    let max_x = (frame.width - 1) as f32;
    let max_y = (frame.height - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor();
    let y0 = y.floor();
    let x1 = (x0 + 1.0).min(max_x);
    let y1 = (y0 + 1.0).min(max_y);

    let fetch = |cx: f32, cy: f32| -> [f32; 3] {
        let idx = ((cy as u32 * frame.width + cx as u32) as usize) * 4;
        [
            frame.rgba[idx] as f32 / 255.0,
            frame.rgba[idx + 1] as f32 / 255.0,
            frame.rgba[idx + 2] as f32 / 255.0,
        ]
    };

    let fx = x - x0;
    let fy = y - y0;
    let c00 = fetch(x0, y0);
    let c10 = fetch(x1, y0);
    let c01 = fetch(x0, y1);
    let c11 = fetch(x1, y1);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    [
        lerp(lerp(c00[0], c10[0], fx), lerp(c01[0], c11[0], fx), fy),
        lerp(lerp(c00[1], c10[1], fx), lerp(c01[1], c11[1], fx), fy),
        lerp(lerp(c00[2], c10[2], fx), lerp(c01[2], c11[2], fx), fy),
    ]
}
