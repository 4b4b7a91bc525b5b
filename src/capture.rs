//! Surface capture
//!
//! Reads the sorted surface back, decodes each packed cell into four 8-bit
//! channels and writes the result as a 24-bit bitmap (alpha is dropped on write).

use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat, RgbaImage};
use log::info;

use crate::device::{ComputeDevice, SurfaceReadback};
use crate::error::CaptureError;

/// File name of the capture inside the screenshot directory.
pub const CAPTURE_FILE_NAME: &str = "VisualizeTexture.bmp";

/// Pack four channels into a cell, `r` in the lowest byte.
pub fn pack_pixel([r, g, b, a]: [u8; 4]) -> u32 {
    r as u32 | (g as u32) << 8 | (b as u32) << 16 | (a as u32) << 24
}

/// Split a cell into `[r, g, b, a]`.
pub fn decode_pixel(encoded: u32) -> [u8; 4] {
    let r = (encoded & 0x0000_00FF) as u8;
    let g = ((encoded & 0x0000_FF00) >> 8) as u8;
    let b = ((encoded & 0x00FF_0000) >> 16) as u8;
    let a = ((encoded & 0xFF00_0000) >> 24) as u8;
    [r, g, b, a]
}

/// Decode a readback into an RGBA image, advancing by the row stride between rows.
pub fn decode_surface(readback: &SurfaceReadback) -> Result<RgbaImage, CaptureError> {
    let width = readback.width as usize;
    let height = readback.height as usize;
    let row_bytes = width * 4;

    if width == 0 || height == 0 || readback.bytes.is_empty() {
        return Err(CaptureError::NoPixels);
    }
    if readback.row_stride < row_bytes {
        return Err(CaptureError::Stride {
            stride: readback.row_stride,
            width: readback.width,
        });
    }
    let expected = readback.row_stride * (height - 1) + row_bytes;
    if readback.bytes.len() < expected {
        return Err(CaptureError::Truncated {
            actual: readback.bytes.len(),
            expected,
        });
    }

    let mut pixels = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * readback.row_stride;
        for cell in readback.bytes[start..start + row_bytes].chunks_exact(4) {
            let encoded = u32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]);
            pixels.extend_from_slice(&decode_pixel(encoded));
        }
    }

    RgbaImage::from_raw(readback.width, readback.height, pixels).ok_or(CaptureError::NoPixels)
}

/// Write `image` as a 24-bit bitmap into `dir`, creating it if needed.
pub fn write_bitmap(image: &RgbaImage, dir: &Path) -> Result<PathBuf, CaptureError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(CAPTURE_FILE_NAME);
    let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
    rgb.save_with_format(&path, ImageFormat::Bmp)?;
    Ok(path)
}

/// Read `surface` back from `device` and save it into `dir`.
pub fn capture_surface<D: ComputeDevice>(
    device: &mut D,
    surface: &D::Surface,
    dir: &Path,
) -> Result<PathBuf, CaptureError> {
    let readback = device.read_surface(surface)?;
    let image = decode_surface(&readback)?;
    let path = write_bitmap(&image, dir)?;
    info!("Content was saved to \"{}\"", path.display());
    Ok(path)
}
