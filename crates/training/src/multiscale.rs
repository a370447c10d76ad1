//! Random training resolution, redrawn on optimizer-step boundaries.

use crate::config::ImageSizes;
use burn::tensor::backend::Backend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct MultiScale {
    grid: u32,
    grid_min: u32,
    grid_max: u32,
    current: u32,
    rng: StdRng,
}

impl MultiScale {
    pub fn new(sizes: &ImageSizes, grid: u32, seed: u64) -> Self {
        Self {
            grid: grid.max(1),
            grid_min: sizes.grid_min,
            grid_max: sizes.grid_max,
            current: sizes.train(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn bounds(&self) -> (u32, u32) {
        (self.grid_min * self.grid, self.grid_max * self.grid)
    }

    /// Draws a new size when `ni` falls on an accumulation boundary.
    pub fn maybe_resample(&mut self, ni: usize, accumulate: usize) -> u32 {
        if ni % accumulate.max(1) == 0 {
            self.current = self.rng.random_range(self.grid_min..=self.grid_max) * self.grid;
        }
        self.current
    }

    /// Shape `[h, w]` after scaling the longer side to the current size,
    /// each side rounded up to a grid multiple. `None` when no resize is needed.
    pub fn scaled_shape(&self, height: usize, width: usize) -> Option<[usize; 2]> {
        let longest = height.max(width);
        if longest == 0 || longest as u32 == self.current {
            return None;
        }
        let sf = self.current as f64 / longest as f64;
        let grid = self.grid as f64;
        let side = |x: usize| ((x as f64 * sf / grid).ceil() * grid) as usize;
        Some([side(height), side(width)])
    }

    /// Bilinear resize of an image batch to [`MultiScale::scaled_shape`].
    pub fn rescale<B: Backend>(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = images.dims();
        match self.scaled_shape(h, w) {
            Some(size) => interpolate(
                images,
                size,
                InterpolateOptions::new(InterpolateMode::Bilinear),
            ),
            None => images,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::normalize_image_sizes;
    use burn::backend::ndarray::NdArray;

    #[test]
    fn draws_stay_in_grid_range() {
        let sizes = normalize_image_sizes(&[416], 32, true).unwrap();
        let mut ms = MultiScale::new(&sizes, 32, 3);
        let (lo, hi) = ms.bounds();
        for ni in 0..200 {
            let s = ms.maybe_resample(ni, 1);
            assert!(s >= lo && s <= hi && s % 32 == 0 && s > 0);
        }
    }

    #[test]
    fn size_only_changes_on_accumulate_boundaries() {
        let sizes = normalize_image_sizes(&[320, 640], 32, true).unwrap();
        let mut ms = MultiScale::new(&sizes, 32, 11);
        let mut last = ms.maybe_resample(0, 4);
        for ni in 1..40 {
            let s = ms.maybe_resample(ni, 4);
            if ni % 4 != 0 {
                assert_eq!(s, last);
            }
            last = s;
        }
    }

    #[test]
    fn scaled_shape_is_grid_aligned() {
        let sizes = normalize_image_sizes(&[128], 32, false).unwrap();
        let mut ms = MultiScale::new(&sizes, 32, 0);
        ms.current = 160;
        assert_eq!(ms.scaled_shape(128, 96), Some([160, 128]));
        assert_eq!(ms.scaled_shape(96, 160), None);
        ms.current = 96;
        let [h, w] = ms.scaled_shape(128, 100).unwrap();
        assert_eq!((h % 32, w % 32), (0, 0));
    }

    #[test]
    fn rescale_resizes_batch() {
        let sizes = normalize_image_sizes(&[64], 32, false).unwrap();
        let mut ms = MultiScale::new(&sizes, 32, 0);
        ms.current = 96;
        let device = Default::default();
        let images = Tensor::<NdArray<f32>, 4>::ones([2, 3, 64, 32], &device);
        let out = ms.rescale(images);
        assert_eq!(out.dims(), [2, 3, 96, 64]);
    }
}
