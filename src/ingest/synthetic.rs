//! Synthetic eye imagery for `stub://` sources.
//!
//! Renders a grayscale IR-style eye: bright sclera background, a dark pupil
//! tracing a slow Lissajous path, and a periodic blink that closes the lid.

use rand::Rng;
use std::time::Duration;

pub(crate) struct SyntheticEye {
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticEye {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            frame_count: 0,
        }
    }

    pub(crate) fn width(&self) -> u32 {
        self.width
    }

    pub(crate) fn height(&self) -> u32 {
        self.height
    }

    /// Render the next frame as single-channel pixels.
    pub(crate) fn render(&mut self) -> Vec<u8> {
        self.frame_count += 1;
        let t = self.frame_count as f32 / 60.0;
        let (w, h) = (self.width as f32, self.height as f32);

        let cx = w * (0.5 + 0.25 * (t * 0.7).sin());
        let cy = h * (0.5 + 0.2 * (t * 1.1).cos());
        let radius = w.min(h) * 0.12;
        // Lid covers the image from the top; closed for the last 6 of every 240 frames.
        let lid = if self.frame_count % 240 >= 234 { h } else { h * 0.1 };

        let mut rng = rand::thread_rng();
        let mut pixels = vec![0u8; (self.width * self.height) as usize];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            let x = (i as u32 % self.width) as f32;
            let y = (i as u32 / self.width) as f32;
            let base = if y < lid {
                60.0
            } else if (x - cx).powi(2) + (y - cy).powi(2) < radius * radius {
                20.0
            } else {
                180.0
            };
            let noise: f32 = rng.gen_range(-6.0..6.0);
            *pixel = (base + noise).clamp(0.0, 255.0) as u8;
        }
        pixels
    }
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_micros((1_000_000 / target_fps as u64).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_requested_size() {
        let mut eye = SyntheticEye::new(32, 24);
        let pixels = eye.render();
        assert_eq!(pixels.len(), 32 * 24);
        assert!(pixels.iter().any(|&p| p < 40), "pupil should be dark");
        assert!(pixels.iter().any(|&p| p > 150), "sclera should be bright");
    }

    #[test]
    fn frame_interval_handles_zero_fps() {
        assert_eq!(frame_interval(0), Duration::ZERO);
        assert_eq!(frame_interval(50), Duration::from_millis(20));
    }
}
