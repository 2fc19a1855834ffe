// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Decoded picture handed over by the producer.

use crate::{Error, Result, config::PixelFormat};

/// One decoded frame.
///
/// CPU formats carry their pixels in `data`, laid out as described by
/// [`PixelFormat::frame_size`]. Hardware pictures carry an opaque surface
/// handle instead and leave `data` empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPicture {
    /// Pixel layout.
    pub format: PixelFormat,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel data, empty for hardware pictures.
    pub data: Vec<u8>,
    /// Decoder surface handle for hardware pictures.
    pub surface: Option<u64>,
}

impl VideoPicture {
    /// Wraps CPU pixel data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArg`] if `data` is too small for the
    /// dimensions, or if `format` is [`PixelFormat::Hardware`].
    pub fn new(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let Some(expected) = format.frame_size(width, height) else {
            return Err(Error::InvalidArg(
                "Hardware pictures are created with VideoPicture::hardware.".to_string(),
            ));
        };
        if data.len() < expected {
            return Err(Error::InvalidArg(format!(
                "{width}x{height} {format:?} needs {expected} bytes, got {}.",
                data.len()
            )));
        }
        Ok(Self {
            format,
            width,
            height,
            data,
            surface: None,
        })
    }

    /// Creates a zero-filled (black for BGRA, green for YUV) picture.
    pub fn blank(format: PixelFormat, width: u32, height: u32) -> Self {
        let size = format.frame_size(width, height).unwrap_or(0);
        Self {
            format,
            width,
            height,
            data: vec![0; size],
            surface: None,
        }
    }

    /// Wraps a hardware decoder surface.
    pub fn hardware(width: u32, height: u32, surface: u64) -> Self {
        Self {
            format: PixelFormat::Hardware,
            width,
            height,
            data: Vec::new(),
            surface: Some(surface),
        }
    }

    /// Returns the BGRA value of the pixel at (`x`, `y`).
    ///
    /// YUV formats are converted with BT.601 limited-range coefficients.
    /// Out-of-range coordinates and hardware pictures give opaque black.
    pub fn bgra_at(&self, x: u32, y: u32) -> [u8; 4] {
        const BLACK: [u8; 4] = [0, 0, 0, 255];
        if x >= self.width || y >= self.height {
            return BLACK;
        }
        let (w, h) = (self.width as usize, self.height as usize);
        let (x, y) = (x as usize, y as usize);
        let sample = |i: usize| self.data.get(i).copied();
        let yuv = match self.format {
            PixelFormat::Bgra => {
                let i = (y * w + x) * 4;
                return match self.data.get(i..i + 4) {
                    Some(px) => [px[0], px[1], px[2], px[3]],
                    None => BLACK,
                };
            }
            PixelFormat::Yuv420p => {
                let cw = w.div_ceil(2);
                let chroma = cw * h.div_ceil(2);
                let ci = (y / 2) * cw + x / 2;
                (
                    sample(y * w + x),
                    sample(w * h + ci),
                    sample(w * h + chroma + ci),
                )
            }
            PixelFormat::Nv12 => {
                let ci = w * h + (y / 2) * w.div_ceil(2) * 2 + (x / 2) * 2;
                (sample(y * w + x), sample(ci), sample(ci + 1))
            }
            PixelFormat::Yuyv422 => {
                let row = y * w.div_ceil(2) * 4;
                let pair = row + (x / 2) * 4;
                let luma = if x % 2 == 0 { pair } else { pair + 2 };
                (sample(luma), sample(pair + 1), sample(pair + 3))
            }
            PixelFormat::Hardware => return BLACK,
        };
        match yuv {
            (Some(y), Some(u), Some(v)) => yuv_to_bgra(y, u, v),
            _ => BLACK,
        }
    }
}

fn yuv_to_bgra(y: u8, u: u8, v: u8) -> [u8; 4] {
    let c = 1.164 * (f32::from(y) - 16.0);
    let d = f32::from(u) - 128.0;
    let e = f32::from(v) - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    let r = clamp(c + 1.596 * e);
    let g = clamp(c - 0.392 * d - 0.813 * e);
    let b = clamp(c + 2.017 * d);
    [b, g, r, 255]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_buffers() {
        assert!(VideoPicture::new(PixelFormat::Bgra, 2, 2, vec![0; 15]).is_err());
        assert!(VideoPicture::new(PixelFormat::Bgra, 2, 2, vec![0; 16]).is_ok());
        assert!(VideoPicture::new(PixelFormat::Hardware, 2, 2, Vec::new()).is_err());
    }

    #[test]
    fn bgra_passthrough() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let picture = VideoPicture::new(PixelFormat::Bgra, 2, 1, data).unwrap();
        assert_eq!(picture.bgra_at(1, 0), [5, 6, 7, 8]);
        assert_eq!(picture.bgra_at(2, 0), [0, 0, 0, 255]);
    }

    #[test]
    fn yuv_white_and_black() {
        let mut picture = VideoPicture::blank(PixelFormat::Yuv420p, 2, 2);
        picture.data.fill(128);
        picture.data[0] = 235;
        picture.data[1] = 16;
        assert_eq!(picture.bgra_at(0, 0), [255, 255, 255, 255]);
        assert_eq!(picture.bgra_at(1, 0), [0, 0, 0, 255]);
    }

    #[test]
    fn hardware_has_no_pixels() {
        let picture = VideoPicture::hardware(16, 16, 7);
        assert_eq!(picture.surface, Some(7));
        assert_eq!(picture.bgra_at(0, 0), [0, 0, 0, 255]);
    }
}
