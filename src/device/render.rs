//! Image normalization for the attached display
//!
//! Every payload sent to the display has the same canvas size and color depth.
//! Stills and animation frames are letterboxed onto a white canvas, then encoded
//! either as JPEG (self-describing length) or raw big-endian RGB565.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use image::codecs::gif::GifDecoder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{AnimationDecoder, DynamicImage, Rgb, RgbImage};
use serde::Deserialize;

use crate::{Error, Result};

/// Fixed drawing surface of the display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canvas {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Default for Canvas {
    fn default() -> Self {
        Self {
            width: 240,
            height: 240,
        }
    }
}

/// Wire encoding of an image payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Baseline JPEG
    #[default]
    Jpeg,
    /// Raw 16-bit 5-6-5, big-endian, row-major
    Rgb565,
}

/// Turns image assets into encoded display payloads
#[derive(Debug, Clone)]
pub struct Renderer {
    canvas: Canvas,
    format: PixelFormat,
    jpeg_quality: u8,
}

impl Renderer {
    /// Create a renderer for a canvas and wire format
    ///
    /// # Errors
    ///
    /// Returns error if the canvas has a zero dimension
    pub fn new(canvas: Canvas, format: PixelFormat, jpeg_quality: u8) -> Result<Self> {
        if canvas.width == 0 || canvas.height == 0 {
            return Err(Error::Display(format!(
                "invalid canvas {}x{}",
                canvas.width, canvas.height
            )));
        }

        Ok(Self {
            canvas,
            format,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        })
    }

    /// Canvas this renderer targets
    #[must_use]
    pub const fn canvas(&self) -> Canvas {
        self.canvas
    }

    /// Decode, normalize and encode a still image
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be decoded
    pub fn still(&self, path: &Path) -> Result<Vec<u8>> {
        let img = image::open(path)?;
        let normalized = self.normalize(&img);
        tracing::trace!(path = %path.display(), "rendered still");
        self.encode(&normalized)
    }

    /// Decode every frame of an animated GIF and encode each one
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be decoded or holds no frames
    pub fn animation(&self, path: &Path) -> Result<Vec<Vec<u8>>> {
        let reader = BufReader::new(File::open(path)?);
        let frames = GifDecoder::new(reader)?.into_frames().collect_frames()?;

        if frames.is_empty() {
            return Err(Error::Display(format!(
                "animation has no frames: {}",
                path.display()
            )));
        }

        let encoded = frames
            .into_iter()
            .map(|frame| {
                let img = DynamicImage::ImageRgba8(frame.into_buffer());
                self.encode(&self.normalize(&img))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(path = %path.display(), frames = encoded.len(), "animation precomputed");
        Ok(encoded)
    }

    /// Brightness ramp from black up to the image, `steps` payloads long
    ///
    /// The last payload is the image at full brightness.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be decoded
    pub fn fade(&self, path: &Path, steps: u32) -> Result<Vec<Vec<u8>>> {
        let target = self.normalize(&image::open(path)?);
        let steps = steps.max(1);

        (1..=steps)
            .map(|step| {
                #[allow(clippy::cast_precision_loss)]
                let level = step as f32 / steps as f32;
                self.encode(&scale_brightness(&target, level))
            })
            .collect()
    }

    /// All-white payload used to blank the screen
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn blank(&self) -> Result<Vec<u8>> {
        let white = RgbImage::from_pixel(self.canvas.width, self.canvas.height, Rgb([255; 3]));
        self.encode(&white)
    }

    /// Fit an image inside the canvas, preserving aspect, centered on white
    fn normalize(&self, img: &DynamicImage) -> RgbImage {
        let Canvas { width, height } = self.canvas;
        let fitted = img.resize(width, height, FilterType::Triangle).to_rgb8();

        if fitted.width() == width && fitted.height() == height {
            return fitted;
        }

        let mut canvas = RgbImage::from_pixel(width, height, Rgb([255; 3]));
        let x = i64::from((width - fitted.width()) / 2);
        let y = i64::from((height - fitted.height()) / 2);
        imageops::overlay(&mut canvas, &fitted, x, y);
        canvas
    }

    fn encode(&self, img: &RgbImage) -> Result<Vec<u8>> {
        match self.format {
            PixelFormat::Jpeg => {
                let mut out = Vec::new();
                JpegEncoder::new_with_quality(&mut out, self.jpeg_quality).encode_image(img)?;
                Ok(out)
            }
            PixelFormat::Rgb565 => Ok(to_rgb565(img)),
        }
    }
}

/// Pack RGB888 pixels into big-endian RGB565
fn to_rgb565(img: &RgbImage) -> Vec<u8> {
    let mut out = Vec::with_capacity(img.as_raw().len() / 3 * 2);
    for Rgb([r, g, b]) in img.pixels() {
        let packed =
            ((u16::from(*r) >> 3) << 11) | ((u16::from(*g) >> 2) << 5) | (u16::from(*b) >> 3);
        out.extend_from_slice(&packed.to_be_bytes());
    }
    out
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale_brightness(img: &RgbImage, level: f32) -> RgbImage {
    let level = level.clamp(0.0, 1.0);
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        for channel in &mut pixel.0 {
            *channel = (f32::from(*channel) * level).round() as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_canvas() -> Canvas {
        Canvas {
            width: 8,
            height: 4,
        }
    }

    #[test]
    fn rejects_empty_canvas() {
        let canvas = Canvas {
            width: 0,
            height: 10,
        };
        assert!(Renderer::new(canvas, PixelFormat::Jpeg, 80).is_err());
    }

    #[test]
    fn rgb565_blank_has_fixed_length() {
        let renderer = Renderer::new(small_canvas(), PixelFormat::Rgb565, 80).unwrap();
        let blank = renderer.blank().unwrap();
        assert_eq!(blank.len(), 8 * 4 * 2);
        assert!(blank.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn jpeg_blank_is_a_jpeg() {
        let renderer = Renderer::new(small_canvas(), PixelFormat::Jpeg, 80).unwrap();
        let blank = renderer.blank().unwrap();
        assert_eq!(&blank[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn rgb565_packing() {
        let img = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        assert_eq!(to_rgb565(&img), vec![0xF8, 0x00]);

        let img = RgbImage::from_pixel(1, 1, Rgb([0, 0, 255]));
        assert_eq!(to_rgb565(&img), vec![0x00, 0x1F]);
    }

    #[test]
    fn still_is_letterboxed_to_canvas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        RgbImage::from_pixel(16, 2, Rgb([0, 0, 0])).save(&path).unwrap();

        let renderer = Renderer::new(small_canvas(), PixelFormat::Rgb565, 80).unwrap();
        let payload = renderer.still(&path).unwrap();
        assert_eq!(payload.len(), 8 * 4 * 2);
        // top-left corner is letterbox white, center row is the black image
        assert_eq!(&payload[..2], &[0xFF, 0xFF]);
        let row_one = 8 * 2;
        assert_eq!(&payload[row_one..row_one + 2], &[0x00, 0x00]);
    }

    #[test]
    fn fade_ends_at_full_brightness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logo.png");
        RgbImage::from_pixel(8, 4, Rgb([200, 200, 200])).save(&path).unwrap();

        let renderer = Renderer::new(small_canvas(), PixelFormat::Rgb565, 80).unwrap();
        let steps = renderer.fade(&path, 4).unwrap();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps.last(), Some(&renderer.still(&path).unwrap()));
        assert_ne!(steps[0], steps[3]);
    }
}
