//! Diagnostic overlays written as PNG.
//!
//! Two views are produced per raster:
//! - the match preview: pattern polyline, every detected star, and the
//!   matched polyline with its anchor;
//! - the star overview: detected stars plus optional projected and matched
//!   polylines drawn thin.
//!
//! All positions are `(x, y)` pixel centers.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};

use common::Buffer2;
use glam::DVec2;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut, draw_polygon_mut};
use imageproc::point::Point;
use thiserror::Error;

use crate::matching::PatternMatch;
use crate::star_detection::Star;

pub mod colors {
    use image::Rgb;

    pub const RED: Rgb<u8> = Rgb([255, 0, 0]); // Pattern
    pub const YELLOW: Rgb<u8> = Rgb([255, 255, 0]); // Detected star
    pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]); // Matched polyline
    pub const ORANGE: Rgb<u8> = Rgb([255, 165, 0]); // Anchor / matched point
}

const STAR_RADIUS: i32 = 3;
const PREVIEW_LINE_WIDTH: f64 = 24.0;
const PREVIEW_ANCHOR_RADIUS: i32 = 4;
const OVERVIEW_LINE_WIDTH: f64 = 2.0;
const OVERVIEW_POINT_RADIUS: i32 = 8;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Cannot create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Cannot render an empty image")]
    EmptyImage,
}

/// Min-max stretch to 8-bit gray, replicated into RGB. A flat image is black.
pub fn canvas_from(pixels: &Buffer2<f32>) -> RgbImage {
    let (lo, hi) = pixels.min_max().unwrap_or((0.0, 0.0));
    let range = hi - lo;
    let mut canvas = RgbImage::new(pixels.width() as u32, pixels.height() as u32);
    for (dst, &v) in canvas.pixels_mut().zip(pixels.pixels()) {
        let g = if range > 0.0 && v.is_finite() {
            (((v - lo) / range) * 255.0).clamp(0.0, 255.0) as u8
        } else {
            0
        };
        *dst = Rgb([g, g, g]);
    }
    canvas
}

/// Match preview: pattern (red, thick), stars (yellow circles), matched
/// polyline (green, thick) and anchor (orange dot).
pub fn render_match_preview(
    image: &Buffer2<f32>,
    pattern: &[DVec2],
    stars: &[Star],
    best: Option<&PatternMatch>,
    output: &Path,
) -> Result<(), RenderError> {
    let mut canvas = checked_canvas(image)?;

    draw_polyline(&mut canvas, pattern, PREVIEW_LINE_WIDTH, colors::RED);
    for star in stars {
        draw_hollow_circle_mut(&mut canvas, to_pixel(star.position()), STAR_RADIUS, colors::YELLOW);
    }
    if let Some(best) = best {
        draw_polyline(&mut canvas, &best.points, PREVIEW_LINE_WIDTH, colors::GREEN);
        if let Some(&anchor) = best.points.first() {
            draw_filled_circle_mut(&mut canvas, to_pixel(anchor), PREVIEW_ANCHOR_RADIUS, colors::ORANGE);
        }
    }

    save(&canvas, output)
}

/// Star overview: stars (yellow circles), optional projected pattern (red)
/// and matched points (green polyline with orange dots).
pub fn render_star_overview(
    image: &Buffer2<f32>,
    stars: &[Star],
    projected: Option<&[DVec2]>,
    matched: Option<&[DVec2]>,
    output: &Path,
) -> Result<(), RenderError> {
    let mut canvas = checked_canvas(image)?;

    for star in stars {
        draw_hollow_circle_mut(&mut canvas, to_pixel(star.position()), STAR_RADIUS, colors::YELLOW);
    }
    if let Some(projected) = projected.filter(|p| p.len() >= 2) {
        draw_polyline(&mut canvas, projected, OVERVIEW_LINE_WIDTH, colors::RED);
    }
    if let Some(matched) = matched.filter(|m| !m.is_empty()) {
        draw_polyline(&mut canvas, matched, OVERVIEW_LINE_WIDTH, colors::GREEN);
        for &p in matched {
            draw_filled_circle_mut(&mut canvas, to_pixel(p), OVERVIEW_POINT_RADIUS, colors::ORANGE);
        }
    }

    save(&canvas, output)
}

fn checked_canvas(image: &Buffer2<f32>) -> Result<RgbImage, RenderError> {
    if image.is_empty() {
        return Err(RenderError::EmptyImage);
    }
    Ok(canvas_from(image))
}

fn save(canvas: &RgbImage, output: &Path) -> Result<(), RenderError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| RenderError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    canvas.save(output).map_err(|source| RenderError::Write {
        path: output.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %output.display(), "Wrote overlay");
    Ok(())
}

#[inline]
fn to_pixel(p: DVec2) -> (i32, i32) {
    (p.x.round() as i32, p.y.round() as i32)
}

/// Open polyline of the given width with round joins and caps.
pub fn draw_polyline(canvas: &mut RgbImage, points: &[DVec2], width: f64, color: Rgb<u8>) {
    let half = (width / 2.0).max(0.5);
    let cap_radius = half.round().max(1.0) as i32;

    for segment in points.windows(2) {
        let (a, b) = (segment[0], segment[1]);
        let dir = b - a;
        let len = dir.length();
        if len >= 1.0 {
            let normal = DVec2::new(-dir.y, dir.x) / len * half;
            let quad = [a + normal, b + normal, b - normal, a - normal]
                .map(|c| Point::new(c.x.round() as i32, c.y.round() as i32));
            if quad[0] != quad[3] && quad[1] != quad[2] {
                draw_polygon_mut(canvas, &quad, color);
            }
        }
    }
    if width > 1.0 {
        for &p in points {
            draw_filled_circle_mut(canvas, to_pixel(p), cap_radius, color);
        }
    }
}
