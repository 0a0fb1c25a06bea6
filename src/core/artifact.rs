//! Image artifacts produced from raster windows: masking, outlines,
//! translucent overlays, and JPEG/PNG encoding.

use crate::types::AccessResult;
use geo::{Coord, MultiPolygon};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut, draw_polygon_mut};
use imageproc::point::Point;
use ndarray::{Array2, Array3, Axis, Zip};

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";
pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Convert a band-major (3, rows, cols) cube into an interleaved RGB image
pub fn cube_to_rgb(cube: &Array3<u8>) -> RgbImage {
    let (_, height, width) = cube.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (r, c) = (y as usize, x as usize);
        Rgb([cube[[0, r, c]], cube[[1, r, c]], cube[[2, r, c]]])
    })
}

/// Zero every pixel whose mask value is 0
pub fn apply_mask(cube: &Array3<u8>, mask: &Array2<u8>) -> Array3<u8> {
    let mut masked = cube.clone();
    for mut plane in masked.axis_iter_mut(Axis(0)) {
        #[cfg(feature = "parallel")]
        Zip::from(&mut plane).and(mask).par_for_each(|v, m| {
            if *m == 0 {
                *v = 0;
            }
        });

        #[cfg(not(feature = "parallel"))]
        Zip::from(&mut plane).and(mask).for_each(|v, m| {
            if *m == 0 {
                *v = 0;
            }
        });
    }
    masked
}

/// Draw the closed boundary of every ring of `geometry` with the given stroke width.
/// Each edge is stroked as a quad and vertices get round joints.
///
/// Coordinates follow the mask convention: pixel (x, y) has its centre at
/// (x + 0.5, y + 0.5), so the stroke lies on the mask's edge pixels.
pub fn draw_outline(image: &mut RgbImage, geometry: &MultiPolygon<f64>, thickness: u32, color: [u8; 3]) {
    let color = Rgb(color);
    let half = thickness as f64 / 2.0;
    let to_pixel = |c: Coord<f64>| Coord { x: c.x - 0.5, y: c.y - 0.5 };

    for polygon in geometry.iter() {
        for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors().iter()) {
            for line in ring.lines() {
                let (a, b) = (to_pixel(line.start), to_pixel(line.end));
                let (dx, dy) = (b.x - a.x, b.y - a.y);
                let len = (dx * dx + dy * dy).sqrt();
                if len < 1e-9 {
                    continue;
                }
                let (nx, ny) = (-dy / len * half, dx / len * half);

                let quad = [
                    Point::new((a.x + nx).round() as i32, (a.y + ny).round() as i32),
                    Point::new((b.x + nx).round() as i32, (b.y + ny).round() as i32),
                    Point::new((b.x - nx).round() as i32, (b.y - ny).round() as i32),
                    Point::new((a.x - nx).round() as i32, (a.y - ny).round() as i32),
                ];
                if quad[0] == quad[3] || quad[0] == quad[1] {
                    // collapsed after rounding
                    draw_line_segment_mut(image, (a.x as f32, a.y as f32), (b.x as f32, b.y as f32), color);
                } else {
                    draw_polygon_mut(image, &quad, color);
                }
            }

            let radius = (half.round() as i32).max(1);
            for c in ring.coords().map(|c| to_pixel(*c)) {
                draw_filled_circle_mut(image, (c.x.round() as i32, c.y.round() as i32), radius, color);
            }
        }
    }
}

/// Alpha-composite a flat colour over every pixel where `mask` is set
pub fn blend_overlay(image: &mut RgbaImage, mask: &Array2<u8>, rgba: [u8; 4]) {
    let alpha = rgba[3] as f32 / 255.0;
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        if mask.get([y as usize, x as usize]).copied().unwrap_or(0) == 0 {
            continue;
        }
        let Rgba([r, g, b, a]) = *pixel;
        let mix = |dst: u8, src: u8| (src as f32 * alpha + dst as f32 * (1.0 - alpha)).round() as u8;
        *pixel = Rgba([mix(r, rgba[0]), mix(g, rgba[1]), mix(b, rgba[2]), a.max(rgba[3])]);
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> AccessResult<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder.write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
    Ok(buf)
}

pub fn encode_png(image: &RgbaImage) -> AccessResult<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = PngEncoder::new(&mut buf);
    encoder.write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgba8)?;
    Ok(buf)
}
