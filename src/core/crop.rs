//! Per-polygon crop extraction
//!
//! For one (raster, polygon) pair this produces:
//! - a masked crop (pixels outside the polygon zeroed) handed to the vision model
//! - an annotated crop (full window with the polygon outline) for human review
//!
//! Both are read from the minimal covering window at a bounded resolution
//! and written to the object store as JPEG.

use crate::config::PipelineConfig;
use crate::core::artifact::{apply_mask, cube_to_rgb, draw_outline, encode_jpeg, JPEG_CONTENT_TYPE};
use crate::core::geo_transform::PixelProjector;
use crate::core::rasterize::{intersect, outline_thickness, raster_footprint, rasterize, PixelWindow};
use crate::io::raster::GeoRaster;
use crate::io::storage::{crop_keys, ObjectStore};
use crate::types::{AccessResult, GeoTransform, Polygon};
use geo::{Coord, MapCoords, MultiPolygon};
use std::time::Instant;

/// Everything produced for one overlapping polygon
#[derive(Debug, Clone)]
pub struct CropArtifacts {
    pub annotated_key: String,
    pub masked_key: String,
    /// Encoded masked crop, as sent to the model
    pub masked_jpeg: Vec<u8>,
    /// Intersected polygon in output-pixel space
    pub pixel_polygon: MultiPolygon<f64>,
    /// Source window in raster pixels
    pub window: PixelWindow,
    /// Output pixels per source pixel (<= 1)
    pub scale: f64,
    /// (width, height) of both artifacts
    pub output_size: (usize, usize),
    /// Geotransform of the output grid
    pub transform: GeoTransform,
    /// Number of mask pixels inside the polygon
    pub mask_area: usize,
}

#[derive(Debug, Clone)]
pub enum CropOutcome {
    /// The polygon does not overlap the raster; not an error
    NoOverlap,
    Extracted(CropArtifacts),
}

impl CropOutcome {
    pub fn artifacts(&self) -> Option<&CropArtifacts> {
        match self {
            CropOutcome::Extracted(artifacts) => Some(artifacts),
            CropOutcome::NoOverlap => None,
        }
    }
}

/// Output size for a window under a maximum output dimension
pub fn scaled_output_size(window: &PixelWindow, max_dimension: usize) -> (f64, (usize, usize)) {
    let longest = window.width.max(window.height).max(1) as f64;
    let scale = (max_dimension as f64 / longest).min(1.0);
    let out_w = ((window.width as f64 * scale).round() as usize).max(1);
    let out_h = ((window.height as f64 * scale).round() as usize).max(1);
    (scale, (out_w, out_h))
}

pub struct CropExtractor {
    config: PipelineConfig,
}

impl CropExtractor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self { config: config.clone() }
    }

    /// Extract and store both crops of `polygon`. `stem` and `index` name the artifacts.
    /// Any failure is reported as a crop extraction error for this polygon.
    pub fn extract(
        &self,
        raster: &GeoRaster,
        polygon: &Polygon,
        stem: &str,
        index: usize,
        store: &dyn ObjectStore,
    ) -> AccessResult<CropOutcome> {
        self.extract_inner(raster, polygon, stem, index, store)
            .map_err(|e| e.for_polygon(polygon.id))
    }

    fn extract_inner(
        &self,
        raster: &GeoRaster,
        polygon: &Polygon,
        stem: &str,
        index: usize,
        store: &dyn ObjectStore,
    ) -> AccessResult<CropOutcome> {
        let start = Instant::now();
        let transform = raster.geo_transform()?;
        let crs = raster.crs()?;
        let (raster_w, raster_h) = raster.size();

        let projector = PixelProjector::new(&crs, &transform)?;
        let pixel_polygon = projector.polygon(&polygon.geometry)?;

        let Some(clipped) = intersect(&pixel_polygon, &raster_footprint(raster_w, raster_h)) else {
            log::info!("Polygon {} does not overlap {}", polygon.id, raster.path());
            return Ok(CropOutcome::NoOverlap);
        };
        let Some(window) = PixelWindow::bounding(&clipped, raster_w, raster_h) else {
            log::info!("Polygon {} covers no whole pixel of {}", polygon.id, raster.path());
            return Ok(CropOutcome::NoOverlap);
        };

        let (scale, (out_w, out_h)) = scaled_output_size(&window, self.config.max_crop_dimension);
        log::debug!(
            "Polygon {}: window {}x{} at ({}, {}), output {}x{} (scale {:.4})",
            polygon.id,
            window.width,
            window.height,
            window.col_off,
            window.row_off,
            out_w,
            out_h,
            scale
        );

        let read_start = Instant::now();
        let cube = raster.read_rgb(&window, (out_w, out_h), self.config.resampling)?;
        log::debug!("Window read in {:.2}s", read_start.elapsed().as_secs_f64());

        let sx = window.width as f64 / out_w as f64;
        let sy = window.height as f64 / out_h as f64;
        let out_transform = transform
            .window(window.col_off as f64, window.row_off as f64)
            .scaled(sx, sy);

        let (col_off, row_off) = (window.col_off as f64, window.row_off as f64);
        let out_polygon: MultiPolygon<f64> = clipped.map_coords(|c| Coord {
            x: (c.x - col_off) / sx,
            y: (c.y - row_off) / sy,
        });

        let mask = rasterize(&out_polygon, &PixelWindow::full(out_w, out_h));
        let mask_area = mask.iter().filter(|v| **v != 0).count();

        let masked_jpeg = encode_jpeg(&cube_to_rgb(&apply_mask(&cube, &mask)), self.config.crop_jpeg_quality)?;

        let mut annotated = cube_to_rgb(&cube);
        draw_outline(
            &mut annotated,
            &out_polygon,
            outline_thickness(out_w, out_h),
            self.config.outline_rgb,
        );
        let annotated_jpeg = encode_jpeg(&annotated, self.config.crop_jpeg_quality)?;

        let (annotated_key, masked_key) = crop_keys(&self.config.crop_prefix, stem, index);
        store.put(&annotated_key, &annotated_jpeg, JPEG_CONTENT_TYPE)?;
        store.put(&masked_key, &masked_jpeg, JPEG_CONTENT_TYPE)?;

        log::info!(
            "Cropped polygon {} to {} ({} mask pixels) in {:.2}s",
            polygon.id,
            annotated_key,
            mask_area,
            start.elapsed().as_secs_f64()
        );

        Ok(CropOutcome::Extracted(CropArtifacts {
            annotated_key,
            masked_key,
            masked_jpeg,
            pixel_polygon: out_polygon,
            window,
            scale,
            output_size: (out_w, out_h),
            transform: out_transform,
            mask_area,
        }))
    }
}
