use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use rayon::prelude::*;

use crate::{
    config::Background,
    types::{CompositedFrame, Frame, SegmentationMask},
};

/// Resamples a model-resolution mask to the frame it belongs to.
pub fn scale_mask(mask: &SegmentationMask, width: u32, height: u32) -> Result<SegmentationMask> {
    if mask.alpha.len() != mask.width as usize * mask.height as usize {
        return Err(anyhow!(
            "mask buffer size mismatch: got {}, expected {}",
            mask.alpha.len(),
            mask.width as usize * mask.height as usize
        ));
    }
    if (mask.width, mask.height) == (width, height) {
        return Ok(mask.clone());
    }

    let src = fir::images::Image::from_vec_u8(
        mask.width,
        mask.height,
        mask.alpha.clone(),
        fir::PixelType::U8,
    )?;
    let mut dst = fir::images::Image::new(width, height, fir::PixelType::U8);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    fir::Resizer::new()
        .resize(&src, &mut dst, Some(&options))
        .context("mask resize failed")?;

    Ok(SegmentationMask {
        alpha: dst.into_vec(),
        width,
        height,
    })
}

/// Desaturates the subject and blends it over `background` using `mask`,
/// which must already match the frame size.
pub fn composite(
    frame: &Frame,
    mask: &SegmentationMask,
    background: Background,
) -> Result<CompositedFrame> {
    if frame.rgba.len() != frame.expected_len() {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.rgba.len(),
            frame.expected_len()
        ));
    }
    if (mask.width, mask.height) != (frame.width, frame.height) {
        return Err(anyhow!(
            "mask is {}x{} but frame is {}x{}",
            mask.width,
            mask.height,
            frame.width,
            frame.height
        ));
    }

    let bg = background.rgba();
    let mut rgba = vec![0u8; frame.rgba.len()];
    rgba.par_chunks_mut(4)
        .zip(frame.rgba.par_chunks_exact(4))
        .zip(mask.alpha.par_iter())
        .for_each(|((dst, src), &alpha)| {
            let gray = luma(src[0], src[1], src[2]);
            let a = alpha as u32;
            let mix = |fg: u8, back: u8| ((fg as u32 * a + back as u32 * (255 - a)) / 255) as u8;
            dst[0] = mix(gray, bg[0]);
            dst[1] = mix(gray, bg[1]);
            dst[2] = mix(gray, bg[2]);
            dst[3] = mix(255, bg[3]);
        });

    Ok(CompositedFrame {
        rgba,
        width: frame.width,
        height: frame.height,
        timestamp: frame.timestamp,
    })
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    // Rec. 601 weights scaled to 1000.
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_2x1() -> Frame {
        Frame::new(vec![255, 0, 0, 255, 0, 0, 255, 255], 2, 1)
    }

    #[test]
    fn subject_is_gray_and_background_transparent() {
        let mask = SegmentationMask {
            alpha: vec![255, 0],
            width: 2,
            height: 1,
        };
        let out = composite(&frame_2x1(), &mask, Background::Transparent).unwrap();

        // Pure red desaturates to its luma.
        assert_eq!(&out.rgba[..4], &[76, 76, 76, 255]);
        assert_eq!(&out.rgba[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn solid_background_shows_through_partial_mask() {
        let mask = SegmentationMask {
            alpha: vec![0, 128],
            width: 2,
            height: 1,
        };
        let out = composite(&frame_2x1(), &mask, Background::Solid([200, 100, 0, 255])).unwrap();

        assert_eq!(&out.rgba[..4], &[200, 100, 0, 255]);
        let blended = &out.rgba[4..];
        assert!(blended[0] < 200 && blended[0] > 14);
        assert_eq!(blended[3], 255);
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let mask = SegmentationMask {
            alpha: vec![255],
            width: 1,
            height: 1,
        };
        assert!(composite(&frame_2x1(), &mask, Background::Transparent).is_err());
    }

    #[test]
    fn scale_mask_matches_frame_dimensions() {
        let mask = SegmentationMask {
            alpha: vec![255; 16 * 16],
            width: 16,
            height: 16,
        };
        let scaled = scale_mask(&mask, 64, 48).unwrap();
        assert_eq!((scaled.width, scaled.height), (64, 48));
        assert_eq!(scaled.alpha.len(), 64 * 48);
        assert!(scaled.alpha.iter().all(|&a| a >= 250));
    }
}
