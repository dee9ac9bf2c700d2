use std::f32::consts::PI;

use anyhow::{anyhow, Result};

use crate::infer::backend::ModelBackend;

/// Normalized intensity below which a pixel counts as pupil.
const DARK_THRESHOLD: f32 = 0.15;

/// Expected pupil area as a fraction of a square eye crop.
const OPEN_PUPIL_FRACTION: f32 = PI * 0.12 * 0.12;

/// Model-free CPU backend for `stub://` model paths.
///
/// Locates the dark pupil blob in the first input plane. With two outputs it
/// reports the blob centroid as gaze in `[-1, 1]` (x right, y up); with one
/// output it reports eyelid closedness from the visible pupil area.
pub struct CentroidBackend {
    outputs: usize,
}

impl CentroidBackend {
    pub fn new(outputs: usize) -> Result<Self> {
        match outputs {
            1 | 2 => Ok(Self { outputs }),
            n => Err(anyhow!("centroid backend produces 1 or 2 outputs, not {}", n)),
        }
    }
}

impl ModelBackend for CentroidBackend {
    fn name(&self) -> &'static str {
        "centroid"
    }

    fn run(&mut self, input: Vec<f32>, shape: [usize; 4]) -> Result<Vec<f32>> {
        let [_, _, h, w] = shape;
        let plane = w * h;
        if plane == 0 || input.len() < plane {
            return Err(anyhow!(
                "input of {} values does not cover a {}x{} plane",
                input.len(),
                w,
                h
            ));
        }

        let (mut count, mut sum_x, mut sum_y) = (0usize, 0f64, 0f64);
        for (i, &value) in input[..plane].iter().enumerate() {
            if value >= DARK_THRESHOLD {
                continue;
            }
            count += 1;
            sum_x += (i % w) as f64;
            sum_y += (i / w) as f64;
        }

        if self.outputs == 1 {
            let visible = count as f32 / plane as f32;
            return Ok(vec![1.0 - (visible / OPEN_PUPIL_FRACTION).min(1.0)]);
        }
        if count == 0 {
            return Ok(vec![0.0, 0.0]);
        }
        let cx = sum_x / count as f64 / w as f64;
        let cy = sum_y / count as f64 / h as f64;
        Ok(vec![(cx * 2.0 - 1.0) as f32, (1.0 - cy * 2.0) as f32])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane_with_dark_block(w: usize, h: usize, x0: usize, y0: usize, size: usize) -> Vec<f32> {
        let mut plane = vec![0.7f32; w * h];
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                plane[y * w + x] = 0.05;
            }
        }
        plane
    }

    #[test]
    fn gaze_follows_dark_blob() {
        let mut backend = CentroidBackend::new(2).unwrap();
        let shape = [1, 1, 20, 20];

        let right_up = backend.run(plane_with_dark_block(20, 20, 15, 1, 3), shape).unwrap();
        assert!(right_up[0] > 0.5, "x {}", right_up[0]);
        assert!(right_up[1] > 0.5, "y {}", right_up[1]);

        let left_down = backend.run(plane_with_dark_block(20, 20, 1, 15, 3), shape).unwrap();
        assert!(left_down[0] < -0.5);
        assert!(left_down[1] < -0.5);
    }

    #[test]
    fn gaze_without_pupil_is_centered() {
        let mut backend = CentroidBackend::new(2).unwrap();
        assert_eq!(backend.run(vec![0.7; 16], [1, 1, 4, 4]).unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn closedness_rises_as_pupil_disappears() {
        let mut backend = CentroidBackend::new(1).unwrap();
        let shape = [1, 1, 100, 100];

        let open = backend.run(plane_with_dark_block(100, 100, 40, 40, 22), shape).unwrap()[0];
        let closed = backend.run(vec![0.7; 100 * 100], shape).unwrap()[0];
        assert!(open < 0.1, "open eye closedness {}", open);
        assert_eq!(closed, 1.0);
    }

    #[test]
    fn rejects_unsupported_arity_and_short_input() {
        assert!(CentroidBackend::new(3).is_err());
        let mut backend = CentroidBackend::new(2).unwrap();
        assert!(backend.run(vec![0.0; 3], [1, 1, 2, 2]).is_err());
    }
}
