//! Class-frequency weights and image-weighted resampling.

use data_contracts::labels::ImageLabels;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;

fn class_counts(labels: &ImageLabels, nc: usize) -> Vec<f32> {
    let mut counts = vec![0.0f32; nc];
    for o in &labels.objects {
        if let Some(slot) = counts.get_mut(o.class_id) {
            *slot += 1.0;
        }
    }
    counts
}

/// Inverse class frequency normalized to sum 1. Classes without instances count as one.
pub fn labels_to_class_weights(labels: &[ImageLabels], nc: usize) -> Vec<f32> {
    if nc == 0 {
        return Vec::new();
    }
    let mut totals = vec![0.0f32; nc];
    for l in labels {
        for (t, c) in totals.iter_mut().zip(class_counts(l, nc)) {
            *t += c;
        }
    }
    if totals.iter().all(|t| *t == 0.0) {
        return vec![1.0 / nc as f32; nc];
    }
    let inv: Vec<f32> = totals
        .iter()
        .map(|t| if *t == 0.0 { 1.0 } else { 1.0 / *t })
        .collect();
    let sum: f32 = inv.iter().sum();
    inv.into_iter().map(|w| w / sum).collect()
}

/// Per-image weight: class counts dotted with `class_weights`.
pub fn labels_to_image_weights(labels: &[ImageLabels], nc: usize, class_weights: &[f32]) -> Vec<f32> {
    labels
        .iter()
        .map(|l| {
            class_counts(l, nc)
                .iter()
                .zip(class_weights)
                .map(|(c, w)| c * w)
                .sum()
        })
        .collect()
}

/// Draws `k` indices with replacement proportionally to `weights`.
/// Falls back to the identity order when no weight is positive.
pub fn weighted_choices<R: rand::Rng + ?Sized>(weights: &[f32], k: usize, rng: &mut R) -> Vec<usize> {
    match WeightedIndex::new(weights.iter().map(|w| w.max(0.0))) {
        Ok(dist) => (0..k).map(|_| dist.sample(rng)).collect(),
        Err(_) => (0..k).map(|i| i % weights.len().max(1)).collect(),
    }
}
