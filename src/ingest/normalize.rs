#![cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]

use anyhow::{anyhow, Context, Result};

/// Pixel layouts a camera buffer may arrive in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Gray8,
    Rgb24,
    /// Packed 4:2:2, `Y0 U Y1 V`.
    Yuyv,
    Mjpeg,
}

/// A camera buffer converted to interleaved `u8` pixels.
#[derive(Debug)]
pub(crate) struct NormalizedPixels {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

/// Width, height and channel count a source is fixed to.
pub(crate) type Geometry = (u32, u32, u8);

impl NormalizedPixels {
    pub fn geometry(&self) -> Geometry {
        (self.width, self.height, self.channels)
    }

    /// Latch the geometry of the first frame and reject later frames that differ.
    pub fn check_geometry(&self, latched: &mut Option<Geometry>) -> Result<()> {
        let seen = self.geometry();
        match *latched {
            None => {
                *latched = Some(seen);
                Ok(())
            }
            Some(expected) if expected == seen => Ok(()),
            Some((width, height, channels)) => Err(anyhow!(
                "frame is {}x{}x{}, source is fixed at {}x{}x{}",
                seen.0,
                seen.1,
                seen.2,
                width,
                height,
                channels
            )),
        }
    }
}

pub(crate) fn normalize_pixels(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<NormalizedPixels> {
    match format {
        PixelFormat::Gray8 => {
            expect_len(pixels, width, height, 1, "GRAY")?;
            Ok(NormalizedPixels {
                data: pixels.to_vec(),
                width,
                height,
                channels: 1,
            })
        }
        PixelFormat::Rgb24 => {
            expect_len(pixels, width, height, 3, "RGB")?;
            Ok(NormalizedPixels {
                data: pixels.to_vec(),
                width,
                height,
                channels: 3,
            })
        }
        PixelFormat::Yuyv => {
            expect_len(pixels, width, height, 2, "YUYV")?;
            // Eye cameras are IR; luma carries everything the models use.
            let luma = pixels.iter().step_by(2).copied().collect();
            Ok(NormalizedPixels {
                data: luma,
                width,
                height,
                channels: 1,
            })
        }
        PixelFormat::Mjpeg => decode_jpeg(pixels),
    }
}

/// Decode a JPEG into grayscale or RGB pixels depending on its color type.
pub(crate) fn decode_jpeg(bytes: &[u8]) -> Result<NormalizedPixels> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    let (width, height) = (image.width(), image.height());
    if image.color().channel_count() == 1 {
        Ok(NormalizedPixels {
            data: image.into_luma8().into_raw(),
            width,
            height,
            channels: 1,
        })
    } else {
        Ok(NormalizedPixels {
            data: image.into_rgb8().into_raw(),
            width,
            height,
            channels: 3,
        })
    }
}

fn expect_len(pixels: &[u8], width: u32, height: u32, bytes_per_pixel: u32, name: &str) -> Result<()> {
    let expected = width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(bytes_per_pixel))
        .ok_or_else(|| anyhow!("{} frame dimensions overflow", name))? as usize;
    if pixels.len() != expected {
        return Err(anyhow!(
            "{} frame length mismatch: expected {}, got {}",
            name,
            expected,
            pixels.len()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn yuyv_keeps_luma_only() -> Result<()> {
        let yuyv = vec![10, 128, 20, 128, 30, 128, 40, 128];
        let out = normalize_pixels(&yuyv, 2, 2, PixelFormat::Yuyv)?;
        assert_eq!(out.channels, 1);
        assert_eq!(out.data, vec![10, 20, 30, 40]);
        Ok(())
    }

    #[test]
    fn rgb_pass_through_validates_length() -> Result<()> {
        let pixels = vec![1u8; 9];
        let out = normalize_pixels(&pixels, 1, 3, PixelFormat::Rgb24)?;
        assert_eq!(out.data, pixels);
        assert!(normalize_pixels(&pixels, 2, 3, PixelFormat::Rgb24).is_err());
        Ok(())
    }

    #[test]
    fn mjpeg_decodes_grayscale_jpeg() -> Result<()> {
        let gray = image::GrayImage::from_pixel(8, 4, image::Luma([90u8]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageLuma8(gray).write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)?;

        let out = normalize_pixels(&jpeg, 0, 0, PixelFormat::Mjpeg)?;
        assert_eq!((out.width, out.height, out.channels), (8, 4, 1));
        assert!(out.data.iter().all(|&p| (85..=95).contains(&p)));
        Ok(())
    }

    #[test]
    fn mjpeg_rejects_garbage() {
        assert!(normalize_pixels(&[0x00, 0x01, 0x02], 0, 0, PixelFormat::Mjpeg).is_err());
    }
}
