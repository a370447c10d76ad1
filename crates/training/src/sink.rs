//! Scalar/image sinks and the first-batch preview.

use crate::error::{TrainError, TrainResult};
use burn_dataset::TargetRow;
use image::{Rgba, RgbaImage};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Receives per-epoch scalars and preview images.
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, epoch: usize) -> TrainResult<()>;

    fn add_image(&mut self, tag: &str, image: &RgbaImage, epoch: usize) -> TrainResult<()>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _epoch: usize) -> TrainResult<()> {
        Ok(())
    }

    fn add_image(&mut self, _tag: &str, _image: &RgbaImage, _epoch: usize) -> TrainResult<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    value: f64,
    epoch: usize,
}

/// Appends scalars to `<dir>/scalars.jsonl` and writes images as `<dir>/<tag>_<epoch>.png`.
pub struct JsonlSink {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(dir: &Path) -> TrainResult<Self> {
        fs::create_dir_all(dir).map_err(TrainError::io(dir))?;
        let path = dir.join("scalars.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(TrainError::io(&path))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MetricsSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f64, epoch: usize) -> TrainResult<()> {
        let path = self.dir.join("scalars.jsonl");
        let line = serde_json::to_string(&ScalarRecord { tag, value, epoch })
            .map_err(|e| TrainError::Other(format!("encode scalar {tag}: {e}")))?;
        writeln!(self.writer, "{line}").map_err(TrainError::io(&path))?;
        self.writer.flush().map_err(TrainError::io(&path))
    }

    fn add_image(&mut self, tag: &str, image: &RgbaImage, epoch: usize) -> TrainResult<()> {
        let name = format!("{}_{epoch}.png", tag.replace('/', "_"));
        let path = self.dir.join(name);
        image
            .save(&path)
            .map_err(|e| TrainError::Other(format!("write {}: {e}", path.display())))
    }
}

/// Tags for the per-epoch scalars, aligned with the 5 mean training losses
/// followed by the 7 evaluation results.
pub const SCALAR_TAGS: [&str; 11] = [
    "train/giou_loss",
    "train/obj_loss",
    "train/cls_loss",
    "train/depth_loss",
    "metrics/precision",
    "metrics/recall",
    "metrics/mAP_0.5",
    "metrics/F1",
    "val/giou_loss",
    "val/obj_loss",
    "val/cls_loss",
];

/// Pairs each tag with its value. The running total is not logged.
pub fn epoch_scalars(mloss: &[f32; 5], results: &[f64; 7]) -> Vec<(&'static str, f64)> {
    let train = [mloss[0], mloss[1], mloss[2], mloss[4]].map(f64::from);
    SCALAR_TAGS
        .iter()
        .copied()
        .zip(train.into_iter().chain(results.iter().copied()))
        .collect()
}

const BOX_COLOR: Rgba<u8> = Rgba([255, 64, 64, 255]);
const MAX_TILES: usize = 16;

/// Draws a rectangle border, clipped to the image.
pub fn draw_rect(img: &mut RgbaImage, bbox: [f32; 4], color: Rgba<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp = |v: f32, max: u32| v.max(0.0).min((max - 1) as f32) as u32;
    let (x0, y0) = (clamp(bbox[0], w), clamp(bbox[1], h));
    let (x1, y1) = (clamp(bbox[2], w), clamp(bbox[3], h));
    if x0 > x1 || y0 > y1 {
        return;
    }
    for t in 0..thickness {
        let (xx0, yy0) = (x0 + t, y0 + t);
        let (xx1, yy1) = (x1.saturating_sub(t), y1.saturating_sub(t));
        if xx0 > xx1 || yy0 > yy1 {
            break;
        }
        for x in xx0..=xx1 {
            img.put_pixel(x, yy0, color);
            img.put_pixel(x, yy1, color);
        }
        for y in yy0..=yy1 {
            img.put_pixel(xx0, y, color);
            img.put_pixel(xx1, y, color);
        }
    }
}

/// Tiles up to 16 images (`[bs, 3, h, w]` values in 0..255, row-major) into
/// a square mosaic with their target boxes drawn.
pub fn plot_batch(values: &[f32], dims: [usize; 4], targets: &[TargetRow]) -> RgbaImage {
    let [bs, _, h, w] = dims;
    let n = bs.min(MAX_TILES);
    let cols = (n as f64).sqrt().ceil().max(1.0) as usize;
    let rows = n.div_ceil(cols).max(1);
    let mut mosaic = RgbaImage::from_pixel((cols * w) as u32, (rows * h) as u32, Rgba([0, 0, 0, 255]));
    let plane = h * w;
    for b in 0..n {
        let (ox, oy) = ((b % cols) * w, (b / cols) * h);
        let base = b * 3 * plane;
        for y in 0..h {
            for x in 0..w {
                let px = |c: usize| values[base + c * plane + y * w + x].clamp(0.0, 255.0) as u8;
                mosaic.put_pixel((ox + x) as u32, (oy + y) as u32, Rgba([px(0), px(1), px(2), 255]));
            }
        }
        for t in targets.iter().filter(|t| t[0] as usize == b) {
            let (cx, cy) = (t[2] * w as f32 + ox as f32, t[3] * h as f32 + oy as f32);
            let (bw, bh) = (t[4] * w as f32, t[5] * h as f32);
            draw_rect(
                &mut mosaic,
                [cx - bw / 2.0, cy - bh / 2.0, cx + bw / 2.0, cy + bh / 2.0],
                BOX_COLOR,
                1,
            );
        }
    }
    mosaic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_line_up_with_tags() {
        let pairs = epoch_scalars(&[1.0, 2.0, 3.0, 6.0, 4.0], &[0.1, 0.2, 0.3, 0.4, 5.0, 6.0, 7.0]);
        assert_eq!(pairs.len(), 11);
        assert_eq!(pairs[3], ("train/depth_loss", 4.0));
        assert_eq!(pairs[6], ("metrics/mAP_0.5", 0.3));
        assert_eq!(pairs[10], ("val/cls_loss", 7.0));
    }

    #[test]
    fn mosaic_tiles_and_draws_boxes() {
        let (bs, h, w) = (3, 8, 10);
        let values = vec![100.0; bs * 3 * h * w];
        let targets = [[1.0, 0.0, 0.5, 0.5, 0.6, 0.5, 1.0]];
        let img = plot_batch(&values, [bs, 3, h, w], &targets);
        assert_eq!(img.dimensions(), (20, 16));
        // tile 1 sits to the right of tile 0; its box left edge is at x = 10 + 2
        assert_eq!(*img.get_pixel(12, 4), BOX_COLOR);
        assert_eq!(*img.get_pixel(5, 4), Rgba([100, 100, 100, 255]));
    }

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::create(dir.path()).unwrap();
        sink.add_scalar("train/giou_loss", 0.5, 0).unwrap();
        sink.add_scalar("metrics/F1", 0.25, 1).unwrap();
        let text = fs::read_to_string(dir.path().join("scalars.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["tag"], "metrics/F1");
        assert_eq!(v["epoch"], 1);
    }
}
