use crate::config::PipelineConfig;
use crate::core::artifact::{blend_overlay, cube_to_rgb, encode_png, PNG_CONTENT_TYPE};
use crate::core::geo_transform::PixelProjector;
use crate::core::rasterize::{rasterize, PixelWindow};
use crate::io::raster::GeoRaster;
use crate::io::storage::{overview_key, ObjectStore};
use crate::types::{AccessResult, Polygon};
use geo::{Coord, MapCoords, MultiPolygon};
use image::{DynamicImage, RgbaImage};
use ndarray::{Array2, Zip};
use std::time::Instant;

/// Size of the overview for a raster: aspect preserved, never upscaled
pub fn overview_size(raster_size: (usize, usize), target: (usize, usize)) -> (f64, f64, (usize, usize)) {
    let (w, h) = (raster_size.0.max(1) as f64, raster_size.1.max(1) as f64);
    let scale = (target.0 as f64 / w).min(target.1 as f64 / h).min(1.0);
    let out_w = ((w * scale).round() as usize).max(1);
    let out_h = ((h * scale).round() as usize).max(1);
    (out_w as f64 / w, out_h as f64 / h, (out_w, out_h))
}

/// Renders every polygon as a translucent overlay on a downsampled copy of the raster
pub struct OverviewAnnotator {
    config: PipelineConfig,
}

impl OverviewAnnotator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self { config: config.clone() }
    }

    pub fn render(&self, raster: &GeoRaster, polygons: &[Polygon]) -> AccessResult<RgbaImage> {
        let start = Instant::now();
        let (raster_w, raster_h) = raster.size();
        let (sx, sy, (out_w, out_h)) = overview_size((raster_w, raster_h), self.config.overview_size);

        let cube = raster.read_rgb(&PixelWindow::full(raster_w, raster_h), (out_w, out_h), self.config.resampling)?;
        let mut image = DynamicImage::ImageRgb8(cube_to_rgb(&cube)).to_rgba8();

        let projector = PixelProjector::new(&raster.crs()?, &raster.geo_transform()?)?;
        let grid = PixelWindow::full(out_w, out_h);
        let mut overlay = Array2::<u8>::zeros((out_h, out_w));

        for polygon in polygons {
            let pixel = projector.polygon(&polygon.geometry)?;
            let scaled: MultiPolygon<f64> = MultiPolygon::new(vec![pixel.map_coords(|c| Coord {
                x: c.x * sx,
                y: c.y * sy,
            })]);
            let mask = rasterize(&scaled, &grid);
            Zip::from(&mut overlay).and(&mask).for_each(|o, m| *o |= *m);
        }

        blend_overlay(&mut image, &overlay, self.config.overlay_rgba);
        log::info!(
            "Rendered {}x{} overview with {} polygons in {:.2}s",
            out_w,
            out_h,
            polygons.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(image)
    }

    /// Render and store the overview as PNG next to the raster; returns its key
    pub fn annotate(
        &self,
        raster: &GeoRaster,
        polygons: &[Polygon],
        storage_key: &str,
        store: &dyn ObjectStore,
    ) -> AccessResult<String> {
        let image = self.render(raster, polygons)?;
        let key = overview_key(storage_key, &self.config.overview_dir);
        store.put(&key, &encode_png(&image)?, PNG_CONTENT_TYPE)?;
        log::info!("Stored overview {}", key);
        Ok(key)
    }
}
