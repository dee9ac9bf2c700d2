use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};
use serde::Deserialize;

use crate::frame::RawFrame;

/// Color depth a model expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Gray,
    Rgb,
}

impl ColorMode {
    pub fn channels(self) -> usize {
        match self {
            ColorMode::Gray => 1,
            ColorMode::Rgb => 3,
        }
    }
}

/// Fixed input contract of one model: color conversion, resize, NCHW layout,
/// pixel values scaled to `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Preprocess {
    pub width: u32,
    pub height: u32,
    pub color: ColorMode,
}

impl Preprocess {
    pub fn new(width: u32, height: u32, color: ColorMode) -> Self {
        Self {
            width,
            height,
            color,
        }
    }

    /// Tensor shape `[batch, channels, height, width]`.
    pub fn input_shape(&self) -> [usize; 4] {
        [
            1,
            self.color.channels(),
            self.height as usize,
            self.width as usize,
        ]
    }

    /// Convert a frame into a single-image NCHW tensor.
    pub fn to_tensor(&self, frame: &RawFrame) -> Result<Vec<f32>> {
        let image = frame_to_image(frame)?;
        let (w, h) = (self.width, self.height);
        let plane = (w as usize) * (h as usize);

        match self.color {
            ColorMode::Gray => {
                let mut gray = image.into_luma8();
                if gray.dimensions() != (w, h) {
                    gray = imageops::resize(&gray, w, h, FilterType::Triangle);
                }
                Ok(gray.as_raw().iter().map(|&p| p as f32 / 255.0).collect())
            }
            ColorMode::Rgb => {
                let mut rgb = image.into_rgb8();
                if rgb.dimensions() != (w, h) {
                    rgb = imageops::resize(&rgb, w, h, FilterType::Triangle);
                }
                let raw = rgb.as_raw();
                let mut tensor = vec![0f32; plane * 3];
                for (i, px) in raw.chunks_exact(3).enumerate() {
                    for (channel, &value) in px.iter().enumerate() {
                        tensor[channel * plane + i] = value as f32 / 255.0;
                    }
                }
                Ok(tensor)
            }
        }
    }
}

fn frame_to_image(frame: &RawFrame) -> Result<DynamicImage> {
    let pixels = frame.pixels().to_vec();
    match frame.channels {
        1 => GrayImage::from_raw(frame.width, frame.height, pixels).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(frame.width, frame.height, pixels).map(DynamicImage::ImageRgb8),
        _ => None,
    }
    .ok_or_else(|| {
        anyhow!(
            "frame {}x{}x{} does not form an image",
            frame.width,
            frame.height,
            frame.channels
        )
    })
}
