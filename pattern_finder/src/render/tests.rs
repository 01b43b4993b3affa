use common::Buffer2;
use glam::DVec2;
use tempfile::TempDir;

use super::*;
use crate::matching::{Affine2, Correspondence, PatternMatch};

fn gradient(width: usize, height: usize) -> Buffer2<f32> {
    Buffer2::from_fn(width, height, |x, y| (x + y) as f32)
}

#[test]
fn test_canvas_stretches_to_full_range() {
    let canvas = canvas_from(&gradient(10, 10));
    assert_eq!(canvas.get_pixel(0, 0), &image::Rgb([0, 0, 0]));
    assert_eq!(canvas.get_pixel(9, 9), &image::Rgb([255, 255, 255]));
}

#[test]
fn test_flat_canvas_is_black() {
    let canvas = canvas_from(&Buffer2::new(4, 4, vec![0.7; 16]));
    assert!(canvas.pixels().all(|p| p.0 == [0, 0, 0]));
}

#[test]
fn test_match_preview_draws_layers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested/previews/a_match.png");
    let image = Buffer2::new(200, 120, vec![0.0; 200 * 120]);
    let pattern = vec![DVec2::new(20.0, 20.0), DVec2::new(60.0, 20.0)];
    let stars = vec![Star { row: 100.0, col: 180.0 }];
    let best = PatternMatch {
        anchor_index: 0,
        matched_indices: vec![0, 1],
        correspondences: vec![
            Correspondence {
                pattern_index: 0,
                star_index: 0,
            },
            Correspondence {
                pattern_index: 1,
                star_index: 1,
            },
        ],
        points: vec![DVec2::new(100.0, 80.0), DVec2::new(150.0, 80.0)],
        score: 1.0,
        transform: Affine2::IDENTITY,
    };

    render_match_preview(&image, &pattern, &stars, Some(&best), &path).unwrap();

    let written = image::open(&path).unwrap().to_rgb8();
    assert_eq!(written.dimensions(), (200, 120));
    // Thick pattern line covers pixels well off its axis.
    assert_eq!(written.get_pixel(40, 30), &colors::RED);
    assert_eq!(written.get_pixel(125, 88), &colors::GREEN);
    assert_eq!(written.get_pixel(100, 80), &colors::ORANGE);
    assert_eq!(written.get_pixel(183, 100), &colors::YELLOW);
    assert_eq!(written.get_pixel(180, 100), &image::Rgb([0, 0, 0]));
}

#[test]
fn test_star_overview_thin_lines() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("b_stars.png");
    let image = gradient(120, 120);
    let stars = vec![Star { row: 10.0, col: 10.0 }];
    let projected = vec![DVec2::new(20.0, 60.0), DVec2::new(100.0, 60.0)];
    let matched = vec![DVec2::new(30.0, 100.0), DVec2::new(90.0, 100.0)];

    render_star_overview(&image, &stars, Some(&projected), Some(&matched), &path).unwrap();

    let written = image::open(&path).unwrap().to_rgb8();
    assert_eq!(written.get_pixel(60, 60), &colors::RED);
    assert_ne!(written.get_pixel(60, 66), &colors::RED);
    assert_eq!(written.get_pixel(60, 100), &colors::GREEN);
    assert_eq!(written.get_pixel(30, 100), &colors::ORANGE);
    assert_eq!(written.get_pixel(35, 100), &colors::ORANGE);
}

#[test]
fn test_empty_image_is_an_error() {
    let dir = TempDir::new().unwrap();
    let image: Buffer2<f32> = Buffer2::new(0, 0, Vec::new());
    assert!(matches!(
        render_star_overview(&image, &[], None, None, &dir.path().join("x.png")),
        Err(RenderError::EmptyImage)
    ));
}
