use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Region of interest covering the whole frame.
pub const FULL_FRAME_ROI: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

/// One annotated object: class, normalized center box and metric depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectLabel {
    pub class_id: usize,
    /// Normalized [cx, cy, w, h] in 0..1.
    pub bbox: [f32; 4],
    pub depth: f32,
}

/// All labels belonging to one image plus the region the depth head should attend to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLabels {
    pub objects: Vec<ObjectLabel>,
    /// Normalized [x0, y0, x1, y1].
    pub roi: [f32; 4],
}

impl Default for ImageLabels {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            roi: FULL_FRAME_ROI,
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("bbox out of range: {0:?}")]
    InvalidBbox([f32; 4]),
    #[error("depth must be finite and non-negative: {0}")]
    InvalidDepth(f32),
    #[error("roi invalid order or out of range: {0:?}")]
    InvalidRoi([f32; 4]),
    #[error("class id {class_id} outside 0..{num_classes}")]
    ClassOutOfRange { class_id: usize, num_classes: usize },
}

#[derive(Debug, Error)]
pub enum LabelParseError {
    #[error("line {line}: {msg}")]
    Malformed { line: usize, msg: String },
    #[error("line {line}: {source}")]
    Invalid {
        line: usize,
        #[source]
        source: ValidationError,
    },
}

impl ObjectLabel {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let b = self.bbox;
        let in_range = b.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v));
        if !in_range || b[2] <= 0.0 || b[3] <= 0.0 {
            return Err(ValidationError::InvalidBbox(b));
        }
        if !self.depth.is_finite() || self.depth < 0.0 {
            return Err(ValidationError::InvalidDepth(self.depth));
        }
        Ok(())
    }

    /// Corner form [x0, y0, x1, y1], still normalized.
    pub fn xyxy(&self) -> [f32; 4] {
        let [cx, cy, w, h] = self.bbox;
        [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
    }
}

fn validate_roi(roi: [f32; 4]) -> Result<(), ValidationError> {
    let in_range = roi.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v));
    if !in_range || roi[0] >= roi[2] || roi[1] >= roi[3] {
        return Err(ValidationError::InvalidRoi(roi));
    }
    Ok(())
}

fn parse_floats<const N: usize>(fields: &[&str], line: usize) -> Result<[f32; N], LabelParseError> {
    if fields.len() != N {
        return Err(LabelParseError::Malformed {
            line,
            msg: format!("expected {N} values, found {}", fields.len()),
        });
    }
    let mut out = [0.0f32; N];
    for (slot, field) in out.iter_mut().zip(fields) {
        *slot = field.parse::<f32>().map_err(|e| LabelParseError::Malformed {
            line,
            msg: format!("bad number {field:?}: {e}"),
        })?;
    }
    Ok(out)
}

impl ImageLabels {
    /// Parses a label file. Rows are `class cx cy w h depth`; an optional
    /// `roi x0 y0 x1 y1` row overrides the full-frame region.
    pub fn parse(text: &str) -> Result<Self, LabelParseError> {
        let mut labels = ImageLabels::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let fields: Vec<&str> = raw.split_whitespace().collect();
            let Some((head, rest)) = fields.split_first() else {
                continue;
            };
            if *head == "roi" {
                let roi = parse_floats::<4>(rest, line)?;
                validate_roi(roi).map_err(|source| LabelParseError::Invalid { line, source })?;
                labels.roi = roi;
                continue;
            }
            let class_id = head.parse::<usize>().map_err(|e| LabelParseError::Malformed {
                line,
                msg: format!("bad class id {head:?}: {e}"),
            })?;
            let [cx, cy, w, h, depth] = parse_floats::<5>(rest, line)?;
            let label = ObjectLabel {
                class_id,
                bbox: [cx, cy, w, h],
                depth,
            };
            label
                .validate()
                .map_err(|source| LabelParseError::Invalid { line, source })?;
            labels.objects.push(label);
        }
        Ok(labels)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_roi(self.roi)?;
        for label in &self.objects {
            label.validate()?;
        }
        Ok(())
    }

    pub fn check_classes(&self, num_classes: usize) -> Result<(), ValidationError> {
        match self.objects.iter().find(|l| l.class_id >= num_classes) {
            Some(l) => Err(ValidationError::ClassOutOfRange {
                class_id: l.class_id,
                num_classes,
            }),
            None => Ok(()),
        }
    }

    /// Collapses every class to 0.
    pub fn into_single_class(mut self) -> Self {
        for label in &mut self.objects {
            label.class_id = 0;
        }
        self
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for l in &self.objects {
            out.push_str(&format!(
                "{} {} {} {} {} {}\n",
                l.class_id, l.bbox[0], l.bbox[1], l.bbox[2], l.bbox[3], l.depth
            ));
        }
        if self.roi != FULL_FRAME_ROI {
            let r = self.roi;
            out.push_str(&format!("roi {} {} {} {}\n", r[0], r[1], r[2], r[3]));
        }
        out
    }
}
