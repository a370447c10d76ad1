//! Image resizing, letterboxing and photometric augmentation.

use crate::types::{BurnDatasetError, DatasetResult};
use data_contracts::labels::ObjectLabel;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use rand::Rng;
use std::path::Path;

/// Gray used for letterbox borders.
pub const PAD_VALUE: u8 = 114;

#[derive(Debug, Clone)]
pub struct Letterboxed {
    pub image: RgbImage,
    /// Scale applied to the input image.
    pub ratio: f32,
    /// Left/top border in pixels.
    pub pad: (u32, u32),
}

/// Reads an image and resizes it so its longer side equals `img_size`.
/// Returns the resized image and the native (width, height).
pub fn load_resized(path: &Path, img_size: u32) -> DatasetResult<(RgbImage, (u32, u32))> {
    let img = image::open(path)
        .map_err(|source| BurnDatasetError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let (w0, h0) = img.dimensions();
    let r = img_size as f32 / w0.max(h0) as f32;
    if (r - 1.0).abs() < f32::EPSILON {
        return Ok((img, (w0, h0)));
    }
    let filter = if r < 1.0 {
        FilterType::Triangle
    } else {
        FilterType::CatmullRom
    };
    let w = ((w0 as f32 * r).round() as u32).max(1);
    let h = ((h0 as f32 * r).round() as u32).max(1);
    Ok((image::imageops::resize(&img, w, h, filter), (w0, h0)))
}

/// Fits `img` inside `(width, height)` preserving aspect ratio and centers it on a gray canvas.
/// With `scale_up == false` the image is only ever shrunk.
pub fn letterbox(img: &RgbImage, shape: (u32, u32), scale_up: bool) -> Letterboxed {
    let (w, h) = img.dimensions();
    let (target_w, target_h) = shape;
    let mut ratio = f32::min(target_w as f32 / w as f32, target_h as f32 / h as f32);
    if !scale_up {
        ratio = ratio.min(1.0);
    }
    let new_w = ((w as f32 * ratio).round() as u32).clamp(1, target_w);
    let new_h = ((h as f32 * ratio).round() as u32).clamp(1, target_h);
    let resized = if (new_w, new_h) == (w, h) {
        img.clone()
    } else {
        image::imageops::resize(img, new_w, new_h, FilterType::Triangle)
    };
    let pad_w = (target_w - new_w) / 2;
    let pad_h = (target_h - new_h) / 2;
    let mut canvas = RgbImage::from_pixel(target_w, target_h, Rgb([PAD_VALUE; 3]));
    image::imageops::replace(&mut canvas, &resized, pad_w.into(), pad_h.into());
    Letterboxed {
        image: canvas,
        ratio,
        pad: (pad_w, pad_h),
    }
}

impl Letterboxed {
    /// Re-expresses boxes normalized to a `(src_w, src_h)` image in the letterboxed frame.
    pub fn map_objects(&self, objects: &[ObjectLabel], src: (u32, u32)) -> Vec<ObjectLabel> {
        let (sw, sh) = (src.0 as f32 * self.ratio, src.1 as f32 * self.ratio);
        let (tw, th) = (self.image.width() as f32, self.image.height() as f32);
        let (px, py) = (self.pad.0 as f32, self.pad.1 as f32);
        objects
            .iter()
            .map(|o| ObjectLabel {
                bbox: [
                    (o.bbox[0] * sw + px) / tw,
                    (o.bbox[1] * sh + py) / th,
                    o.bbox[2] * sw / tw,
                    o.bbox[3] * sh / th,
                ],
                ..*o
            })
            .collect()
    }

    pub fn map_roi(&self, roi: [f32; 4], src: (u32, u32)) -> [f32; 4] {
        let (sw, sh) = (src.0 as f32 * self.ratio, src.1 as f32 * self.ratio);
        let (tw, th) = (self.image.width() as f32, self.image.height() as f32);
        let (px, py) = (self.pad.0 as f32, self.pad.1 as f32);
        [
            (roi[0] * sw + px) / tw,
            (roi[1] * sh + py) / th,
            (roi[2] * sw + px) / tw,
            (roi[3] * sh + py) / th,
        ]
    }
}

/// Random HSV gains in `1 ± gain`. Hue wraps, saturation and value clip.
pub fn augment_hsv(img: &mut RgbImage, gains: [f32; 3], rng: &mut dyn rand::RngCore) {
    if gains.iter().all(|g| *g <= 0.0) {
        return;
    }
    let mut r = [1.0f32; 3];
    for (slot, gain) in r.iter_mut().zip(gains) {
        if gain > 0.0 {
            *slot = 1.0 + rng.random_range(-1.0f32..1.0) * gain;
        }
    }
    for pixel in img.pixels_mut() {
        let [h, s, v] = rgb_to_hsv(pixel.0);
        let h = (h * r[0]).rem_euclid(360.0);
        let s = (s * r[1]).clamp(0.0, 1.0);
        let v = (v * r[2]).clamp(0.0, 1.0);
        pixel.0 = hsv_to_rgb([h, s, v]);
    }
}

/// Mirrors the image and its labels about the vertical axis.
pub fn flip_horizontal(img: &mut RgbImage, objects: &mut [ObjectLabel], roi: &mut [f32; 4]) {
    image::imageops::flip_horizontal_in_place(img);
    for o in objects.iter_mut() {
        o.bbox[0] = 1.0 - o.bbox[0];
    }
    let (x0, x1) = (roi[0], roi[2]);
    roi[0] = 1.0 - x1;
    roi[2] = 1.0 - x0;
}

fn rgb_to_hsv(rgb: [u8; 3]) -> [f32; 3] {
    let [r, g, b] = rgb.map(|c| c as f32 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let h = if delta <= f32::EPSILON {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let s = if max <= f32::EPSILON { 0.0 } else { delta / max };
    [h, s, max]
}

fn hsv_to_rgb(hsv: [f32; 3]) -> [u8; 3] {
    let [h, s, v] = hsv;
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0).rem_euclid(2.0) - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match (h / 60.0) as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [r, g, b].map(|ch| ((ch + m) * 255.0).round().clamp(0.0, 255.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_pads_short_side() {
        let img = RgbImage::from_pixel(64, 32, Rgb([255, 0, 0]));
        let lb = letterbox(&img, (64, 64), false);
        assert_eq!(lb.image.dimensions(), (64, 64));
        assert_eq!(lb.pad, (0, 16));
        assert_eq!(lb.image.get_pixel(0, 0).0, [PAD_VALUE; 3]);
        assert_eq!(lb.image.get_pixel(0, 32).0, [255, 0, 0]);
    }

    #[test]
    fn mapped_box_stays_on_object() {
        let img = RgbImage::new(64, 32);
        let lb = letterbox(&img, (64, 64), false);
        let obj = ObjectLabel {
            class_id: 0,
            bbox: [0.5, 0.5, 0.5, 0.5],
            depth: 3.0,
        };
        let mapped = lb.map_objects(&[obj], (64, 32));
        assert!((mapped[0].bbox[1] - 0.5).abs() < 1e-6);
        assert!((mapped[0].bbox[3] - 0.25).abs() < 1e-6);
        assert_eq!(mapped[0].depth, 3.0);
    }

    #[test]
    fn hsv_round_trip_is_close() {
        for rgb in [[10u8, 200, 30], [255, 255, 255], [0, 0, 0], [120, 40, 220]] {
            let back = hsv_to_rgb(rgb_to_hsv(rgb));
            for c in 0..3 {
                assert!((back[c] as i32 - rgb[c] as i32).abs() <= 1, "{rgb:?} -> {back:?}");
            }
        }
    }
}
