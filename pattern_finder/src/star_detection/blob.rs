//! Multi-scale Laplacian-of-Gaussian blob detection.
//!
//! Responses are computed one sigma at a time and only three consecutive
//! scales are held in memory. A pixel is a blob when its response exceeds the
//! threshold and is not smaller than any of its 26 scale-space neighbours.
//! Overlapping blobs are then pruned, keeping the larger scale.

use std::collections::HashMap;
use std::f64::consts::{PI, SQRT_2};

use common::Buffer2;
use rayon::prelude::*;

use super::convolution::negative_log;

/// A scale-space peak in pixel-center coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    pub row: f64,
    pub col: f64,
    pub sigma: f64,
}

impl Blob {
    /// Approximate blob radius, `σ√2` in 2D.
    #[inline]
    pub fn radius(&self) -> f64 {
        self.sigma * SQRT_2
    }
}

#[derive(Debug, Clone, Copy)]
struct Peak {
    blob: Blob,
    response: f32,
}

/// Find LoG blobs over `sigmas` (ascending) and prune overlaps.
pub fn detect_blobs(image: &Buffer2<f32>, sigmas: &[f64], threshold: f32, overlap: f64) -> Vec<Blob> {
    if image.is_empty() || sigmas.is_empty() {
        return Vec::new();
    }

    let mut peaks = Vec::new();
    let mut prev: Option<Buffer2<f32>> = None;
    let mut cur = negative_log(image, sigmas[0]);

    for (k, &sigma) in sigmas.iter().enumerate() {
        let next = sigmas.get(k + 1).map(|&s| negative_log(image, s));

        let mut layers: Vec<&Buffer2<f32>> = Vec::with_capacity(3);
        layers.extend(prev.as_ref());
        layers.extend(next.as_ref());
        peaks.extend(scale_maxima(&cur, &layers, sigma, threshold));

        match next {
            Some(next) => prev = Some(std::mem::replace(&mut cur, next)),
            None => break,
        }
    }

    let found = peaks.len();
    let blobs = prune_blobs(peaks, overlap);
    tracing::trace!(found, kept = blobs.len(), "Pruned overlapping blobs");
    blobs
}

/// Local maxima of `cur` against its own 3×3 neighbourhood and the 3×3
/// neighbourhoods of the adjacent scale layers.
fn scale_maxima(cur: &Buffer2<f32>, adjacent: &[&Buffer2<f32>], sigma: f64, threshold: f32) -> Vec<Peak> {
    let (width, height) = (cur.width(), cur.height());

    (0..height)
        .into_par_iter()
        .flat_map_iter(|y| {
            (0..width).filter_map(move |x| {
                let v = *cur.get(x, y);
                if !(v > threshold) {
                    return None;
                }
                let dominates = |layer: &Buffer2<f32>| {
                    (-1i64..=1).all(|dy| {
                        (-1i64..=1).all(|dx| {
                            layer
                                .try_get(x as i64 + dx, y as i64 + dy)
                                .map_or(true, |&n| v >= n)
                        })
                    })
                };
                if !dominates(cur) || !adjacent.iter().all(|layer| dominates(layer)) {
                    return None;
                }
                Some(Peak {
                    blob: Blob {
                        row: y as f64,
                        col: x as f64,
                        sigma,
                    },
                    response: v,
                })
            })
        })
        .collect()
}

/// Fraction of the smaller disk covered by the intersection of two blob disks.
pub fn blob_overlap(a: &Blob, b: &Blob) -> f64 {
    let (r1, r2) = (a.radius(), b.radius());
    let d = ((a.row - b.row).powi(2) + (a.col - b.col).powi(2)).sqrt();

    if d > r1 + r2 {
        return 0.0;
    }
    if d <= (r1 - r2).abs() {
        return 1.0;
    }

    let ratio1 = ((d * d + r1 * r1 - r2 * r2) / (2.0 * d * r1)).clamp(-1.0, 1.0);
    let ratio2 = ((d * d + r2 * r2 - r1 * r1) / (2.0 * d * r2)).clamp(-1.0, 1.0);
    let a_ = -d + r2 + r1;
    let b_ = d - r2 + r1;
    let c_ = d + r2 - r1;
    let e_ = d + r2 + r1;
    let area = r1 * r1 * ratio1.acos() + r2 * r2 * ratio2.acos() - 0.5 * (a_ * b_ * c_ * e_).abs().sqrt();

    let r_min = r1.min(r2);
    area / (PI * r_min * r_min)
}

/// Greedy pruning: larger sigma wins, then stronger response. Candidates
/// are bucketed on a grid so each only checks nearby kept blobs.
fn prune_blobs(mut peaks: Vec<Peak>, overlap: f64) -> Vec<Blob> {
    if peaks.is_empty() {
        return Vec::new();
    }
    peaks.sort_by(|a, b| {
        b.blob
            .sigma
            .total_cmp(&a.blob.sigma)
            .then(b.response.total_cmp(&a.response))
            .then(a.blob.row.total_cmp(&b.blob.row))
            .then(a.blob.col.total_cmp(&b.blob.col))
    });

    let max_radius = peaks[0].blob.radius();
    let cell = (2.0 * max_radius).max(1.0);
    let cell_of = |b: &Blob| ((b.col / cell).floor() as i64, (b.row / cell).floor() as i64);

    let mut kept: Vec<Blob> = Vec::new();
    let mut grid: HashMap<(i64, i64), Vec<usize>> = HashMap::new();

    for peak in peaks {
        let blob = peak.blob;
        let (cx, cy) = cell_of(&blob);
        let suppressed = (cy - 1..=cy + 1).any(|gy| {
            (cx - 1..=cx + 1).any(|gx| {
                grid.get(&(gx, gy)).is_some_and(|ids| {
                    ids.iter().any(|&i| blob_overlap(&kept[i], &blob) > overlap)
                })
            })
        });
        if !suppressed {
            grid.entry((cx, cy)).or_default().push(kept.len());
            kept.push(blob);
        }
    }

    kept
}
