//! Polygon rasterization in raster pixel space
//!
//! Masks are sampled at pixel centres with the even-odd rule, so holes are
//! honoured and a pixel belongs to the polygon exactly when its centre does.
//! The annotated-crop outline is drawn along the same pixel-space edges.

use geo::{Area, BooleanOps, BoundingRect, Coord, LineString, MultiPolygon, Polygon};
use ndarray::Array2;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Rectangular region of a raster's pixel grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl PixelWindow {
    pub fn full(width: usize, height: usize) -> Self {
        Self { col_off: 0, row_off: 0, width, height }
    }

    /// Smallest window covering the geometry, clamped to the raster grid.
    /// `None` when nothing of the geometry lies on the grid.
    pub fn bounding(geometry: &MultiPolygon<f64>, raster_width: usize, raster_height: usize) -> Option<Self> {
        let rect = geometry.bounding_rect()?;
        let (min, max) = (rect.min(), rect.max());
        if !(min.x.is_finite() && min.y.is_finite() && max.x.is_finite() && max.y.is_finite()) {
            return None;
        }

        let clamp = |v: f64, hi: usize| v.max(0.0).min(hi as f64) as usize;
        let col_start = clamp(min.x.floor(), raster_width);
        let row_start = clamp(min.y.floor(), raster_height);
        let col_end = clamp(max.x.ceil(), raster_width);
        let row_end = clamp(max.y.ceil(), raster_height);

        if col_end <= col_start || row_end <= row_start {
            return None;
        }

        Some(Self {
            col_off: col_start,
            row_off: row_start,
            width: col_end - col_start,
            height: row_end - row_start,
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Pixel-space polygon covering the whole raster grid
pub fn raster_footprint(width: usize, height: usize) -> Polygon<f64> {
    let (w, h) = (width as f64, height as f64);
    Polygon::new(
        LineString::from(vec![(0.0, 0.0), (w, 0.0), (w, h), (0.0, h), (0.0, 0.0)]),
        vec![],
    )
}

/// Intersection of two polygons; `None` when it is empty or degenerate
pub fn intersect(polygon: &Polygon<f64>, bounds: &Polygon<f64>) -> Option<MultiPolygon<f64>> {
    let finite = |p: &Polygon<f64>| {
        p.exterior().coords().chain(p.interiors().iter().flat_map(|r| r.coords()))
            .all(|c| c.x.is_finite() && c.y.is_finite())
    };
    if !finite(polygon) || !finite(bounds) || polygon.exterior().0.len() < 4 {
        return None;
    }

    let clipped = polygon.intersection(bounds);
    let parts: Vec<Polygon<f64>> = clipped
        .into_iter()
        .filter(|p| p.unsigned_area() > 0.0)
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(MultiPolygon::new(parts))
    }
}

/// Boundary width in pixels for an annotated crop of the given size
pub fn outline_thickness(width: usize, height: usize) -> u32 {
    let scaled = (width.min(height) as f64 * 0.005).floor() as u32;
    scaled.max(2)
}

/// Binary mask (1 = inside) of `geometry` over `window`, both in the same pixel space
pub fn rasterize(geometry: &MultiPolygon<f64>, window: &PixelWindow) -> Array2<u8> {
    let mut mask = Array2::<u8>::zeros((window.height, window.width));
    let edges = collect_edges(geometry);
    if edges.is_empty() || window.pixel_count() == 0 {
        return mask;
    }

    #[cfg(feature = "parallel")]
    let spans: Vec<Vec<(usize, usize)>> = (0..window.height)
        .into_par_iter()
        .map(|row| row_spans(&edges, window, row))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let spans: Vec<Vec<(usize, usize)>> = (0..window.height)
        .map(|row| row_spans(&edges, window, row))
        .collect();

    for (row, row_spans) in spans.into_iter().enumerate() {
        for (start, end) in row_spans {
            for col in start..end {
                mask[[row, col]] = 1;
            }
        }
    }

    mask
}

fn collect_edges(geometry: &MultiPolygon<f64>) -> Vec<(Coord<f64>, Coord<f64>)> {
    let mut edges = Vec::new();
    for polygon in geometry.iter() {
        for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors().iter()) {
            for line in ring.lines() {
                if line.start.y != line.end.y {
                    edges.push((line.start, line.end));
                }
            }
        }
    }
    edges
}

/// Column spans [start, end) inside the geometry on one window row
fn row_spans(edges: &[(Coord<f64>, Coord<f64>)], window: &PixelWindow, row: usize) -> Vec<(usize, usize)> {
    let yc = (window.row_off + row) as f64 + 0.5;

    let mut crossings: Vec<f64> = edges
        .iter()
        .filter(|(a, b)| (a.y <= yc) != (b.y <= yc))
        .map(|(a, b)| a.x + (yc - a.y) * (b.x - a.x) / (b.y - a.y))
        .collect();
    crossings.sort_by(|a, b| a.total_cmp(b));

    let to_col = |x: f64| {
        let c = (x - window.col_off as f64 - 0.5).ceil();
        c.max(0.0).min(window.width as f64) as usize
    };

    crossings
        .chunks_exact(2)
        .map(|pair| (to_col(pair[0]), to_col(pair[1])))
        .filter(|(start, end)| end > start)
        .collect()
}
