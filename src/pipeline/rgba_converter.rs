use anyhow::{Result, anyhow};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

use crate::types::Frame;

/// Raw layouts a camera backend may hand us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Nv12,
    Yuyv,
    Mjpeg,
    Rgb,
    Bgr,
    Gray,
}

pub struct RawImage<'a> {
    pub format: PixelFormat,
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// Decodes a raw camera buffer into an RGBA frame, optionally mirrored
/// left-to-right the way a front camera preview is shown.
pub fn decode_frame(raw: &RawImage<'_>, mirror: bool) -> Result<Frame> {
    let (width, height) = (raw.width, raw.height);
    if width == 0 || height == 0 {
        return Err(anyhow!("empty camera frame {width}x{height}"));
    }

    let mut rgba = match raw.format {
        PixelFormat::Nv12 => nv12_to_rgba(raw.data, width, height)?,
        PixelFormat::Yuyv => yuyv_to_rgba(raw.data, width, height)?,
        PixelFormat::Mjpeg => mjpeg_to_rgba(raw.data, width, height)?,
        PixelFormat::Rgb => packed_to_rgba(raw.data, width, height, 3, |px| [px[0], px[1], px[2]])?,
        PixelFormat::Bgr => packed_to_rgba(raw.data, width, height, 3, |px| [px[2], px[1], px[0]])?,
        PixelFormat::Gray => packed_to_rgba(raw.data, width, height, 1, |px| [px[0], px[0], px[0]])?,
    };

    if mirror {
        mirror_rows(&mut rgba, width);
    }

    Ok(Frame::new(rgba, width, height))
}

fn ensure_len(label: &str, data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(anyhow!(
            "{label} buffer too small: got {}, expected {expected}",
            data.len()
        ));
    }
    Ok(())
}

fn nv12_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let y_len = width as usize * height as usize;
    let uv_len = y_len / 2;
    ensure_len("NV12", data, y_len + uv_len)?;

    let image = YuvBiPlanarImage {
        y_plane: &data[..y_len],
        y_stride: width,
        uv_plane: &data[y_len..y_len + uv_len],
        uv_stride: width,
        width,
        height,
    };

    let mut rgba = vec![0u8; y_len * 4];
    yuv_nv12_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12→RGBA failed: {err:?}"))?;

    Ok(rgba)
}

fn yuyv_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    ensure_len("YUYV", data, width as usize * height as usize * 2)?;

    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };

    let mut rgba = vec![0u8; width as usize * height as usize * 4];
    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV422→RGBA failed: {err:?}"))?;

    Ok(rgba)
}

fn mjpeg_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgba = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;

    // Some drivers report a resolution that differs from the encoded stream.
    ensure_len("MJPEG", &rgba, width as usize * height as usize * 4)?;
    Ok(rgba)
}

fn packed_to_rgba<F>(
    data: &[u8],
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
    to_rgb: F,
) -> Result<Vec<u8>>
where
    F: Fn(&[u8]) -> [u8; 3] + Sync,
{
    let pixels = width as usize * height as usize;
    ensure_len("packed", data, pixels * bytes_per_pixel)?;

    let mut rgba = vec![0u8; pixels * 4];
    rgba.par_chunks_mut(4)
        .zip(data.par_chunks_exact(bytes_per_pixel))
        .for_each(|(dst, src)| {
            let [r, g, b] = to_rgb(src);
            dst.copy_from_slice(&[r, g, b, 255]);
        });

    Ok(rgba)
}

fn mirror_rows(rgba: &mut [u8], width: u32) {
    let stride = width as usize * 4;
    rgba.par_chunks_mut(stride).for_each(|row| {
        let pixels = row.len() / 4;
        for x in 0..pixels / 2 {
            let mirrored = pixels - 1 - x;
            for c in 0..4 {
                row.swap(x * 4 + c, mirrored * 4 + c);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_is_swapped_and_mirrored() {
        // Two pixels: blue then red, in BGR order.
        let data = [255, 0, 0, 0, 0, 255];
        let raw = RawImage {
            format: PixelFormat::Bgr,
            data: &data,
            width: 2,
            height: 1,
        };

        let frame = decode_frame(&raw, false).unwrap();
        assert_eq!(frame.rgba, vec![0, 0, 255, 255, 255, 0, 0, 255]);

        let mirrored = decode_frame(&raw, true).unwrap();
        assert_eq!(mirrored.rgba, vec![255, 0, 0, 255, 0, 0, 255, 255]);
    }

    #[test]
    fn gray_expands_to_opaque_rgba() {
        let data = [10, 200];
        let raw = RawImage {
            format: PixelFormat::Gray,
            data: &data,
            width: 1,
            height: 2,
        };
        let frame = decode_frame(&raw, true).unwrap();
        assert_eq!(frame.rgba, vec![10, 10, 10, 255, 200, 200, 200, 255]);
        assert_eq!(frame.expected_len(), frame.rgba.len());
    }

    #[test]
    fn short_buffers_are_rejected() {
        let data = [0u8; 5];
        let raw = RawImage {
            format: PixelFormat::Rgb,
            data: &data,
            width: 2,
            height: 1,
        };
        assert!(decode_frame(&raw, false).is_err());

        let raw = RawImage {
            format: PixelFormat::Yuyv,
            data: &data,
            width: 4,
            height: 4,
        };
        assert!(decode_frame(&raw, false).is_err());
    }
}
