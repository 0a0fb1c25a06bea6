//! End-to-end processing of one raster image
//!
//! Pending(0) -> BoundsResolved(25) -> OverviewRendered(50)
//!   -> per polygon (50..75) -> Finalizing(75) -> Done(100), or Failed(-1).
//!
//! Bounds resolution, the spatial query, the overview and every catalog or
//! storage write are fatal. Crop extraction and model failures only skip the
//! polygon they happened for. Reverse geocoding never fails a job.

use crate::config::{PipelineConfig, ServiceConfig};
use crate::core::bounds::resolve_bounds;
use crate::core::crop::{CropExtractor, CropOutcome};
use crate::core::overview::OverviewAnnotator;
use crate::core::progress::{ProcessingStage, ProgressHub, ProgressReporter};
use crate::io::catalog::{Catalog, SpatialIndex};
use crate::io::geocode::{NominatimGeocoder, ReverseGeocoder};
use crate::io::model::{analyze, OllamaClient, VisionModel};
use crate::io::raster::RasterLocator;
use crate::io::storage::{artifact_stem, is_crop_key, ObjectStore};
use crate::types::{
    AccessError, AccessResult, ImageId, ImageUpdate, NewCroppedImage, Polygon, PolygonId, PolygonStatus,
    RasterImage,
};
use std::sync::Arc;
use std::time::Instant;

/// What one run of the pipeline did
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingSummary {
    pub image_id: ImageId,
    pub overview_key: String,
    pub location: Option<String>,
    /// Polygons returned by the spatial query
    pub candidates: usize,
    /// Crops persisted with an analysis
    pub cropped: usize,
    pub skipped_no_overlap: usize,
    /// Polygons skipped because of a crop or model error
    pub failed_polygons: Vec<(PolygonId, String)>,
    /// Status derived for each analysed polygon, in processing order
    pub statuses: Vec<(PolygonId, PolygonStatus)>,
}

enum PolygonResult {
    NoOverlap,
    Analyzed(PolygonStatus),
    Skipped(AccessError),
}

pub struct Pipeline {
    catalog: Arc<dyn Catalog>,
    spatial_index: Arc<dyn SpatialIndex>,
    store: Arc<dyn ObjectStore>,
    model: Arc<dyn VisionModel>,
    geocoder: Option<Arc<dyn ReverseGeocoder>>,
    locator: RasterLocator,
    progress: Arc<ProgressHub>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        spatial_index: Arc<dyn SpatialIndex>,
        store: Arc<dyn ObjectStore>,
        model: Arc<dyn VisionModel>,
        locator: RasterLocator,
        config: PipelineConfig,
    ) -> Self {
        Self {
            catalog,
            spatial_index,
            store,
            model,
            geocoder: None,
            locator,
            progress: Arc::new(ProgressHub::new()),
            config,
        }
    }

    /// Pipeline talking to the configured model service and Nominatim
    pub fn from_service_config(
        service: &ServiceConfig,
        catalog: Arc<dyn Catalog>,
        spatial_index: Arc<dyn SpatialIndex>,
        store: Arc<dyn ObjectStore>,
    ) -> AccessResult<Self> {
        let model = Arc::new(OllamaClient::from_config(service)?);
        let geocoder = Arc::new(NominatimGeocoder::from_config(service)?);
        let locator = RasterLocator::new(service.raster_root.to_string_lossy());

        Ok(Self::new(catalog, spatial_index, store, model, locator, service.pipeline.clone())
            .with_geocoder(geocoder))
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn ReverseGeocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn with_progress_hub(mut self, hub: Arc<ProgressHub>) -> Self {
        self.progress = hub;
        self
    }

    pub fn progress_hub(&self) -> Arc<ProgressHub> {
        Arc::clone(&self.progress)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the whole job for one image. Blocks on raster, storage and model I/O.
    pub fn process_image(&self, image_id: ImageId) -> AccessResult<ProcessingSummary> {
        let start = Instant::now();
        log::info!("Starting processing of image {}", image_id);

        let mut reporter = ProgressReporter::new(image_id, self.catalog.as_ref(), &self.progress);
        match self.run(image_id, &mut reporter) {
            Ok(summary) => {
                log::info!(
                    "Image {} done in {:.2}s: {} of {} polygons cropped, {} outside, {} failed",
                    image_id,
                    start.elapsed().as_secs_f64(),
                    summary.cropped,
                    summary.candidates,
                    summary.skipped_no_overlap,
                    summary.failed_polygons.len()
                );
                Ok(summary)
            }
            Err(e) => {
                log::error!("Processing of image {} failed (fatal={}): {}", image_id, e.is_fatal(), e);
                reporter.fail();
                Err(e)
            }
        }
    }

    /// Record a failure for a job that never returned (worker panic)
    pub fn mark_failed(&self, image_id: ImageId) {
        ProgressReporter::new(image_id, self.catalog.as_ref(), &self.progress).fail();
    }

    fn run(&self, image_id: ImageId, reporter: &mut ProgressReporter<'_>) -> AccessResult<ProcessingSummary> {
        let image = self.catalog.image(image_id)?;
        reporter.report(ProcessingStage::Pending)?;
        self.clear_previous_crops(&image)?;

        // Bounds and address
        let raster = self.locator.open(&image.storage_key)?;
        let bounds = resolve_bounds(&raster)?;
        let location = self.locate(image_id, &bounds.center);
        reporter.report(ProcessingStage::BoundsResolved)?;

        // Candidates and overview
        let candidates = self.spatial_index.find_overlapping(&bounds.wgs84)?;
        log::info!("Image {}: {} candidate polygons", image_id, candidates.len());

        let overview_key = OverviewAnnotator::new(&self.config).annotate(
            &raster,
            &candidates,
            &image.storage_key,
            self.store.as_ref(),
        )?;
        self.catalog.update_image(
            image_id,
            ImageUpdate {
                overview_key: overview_key.clone(),
                location: location.clone(),
                bounds: bounds.wgs84,
                center: bounds.center,
                crs: bounds.crs.definition().to_string(),
            },
        )?;
        raster.close();
        reporter.report(ProcessingStage::OverviewRendered)?;

        // Polygons, one at a time
        let extractor = CropExtractor::new(&self.config);
        let stem = artifact_stem(&image.storage_key);
        let total = candidates.len();
        let mut summary = ProcessingSummary {
            image_id,
            overview_key,
            location,
            candidates: total,
            cropped: 0,
            skipped_no_overlap: 0,
            failed_polygons: Vec::new(),
            statuses: Vec::new(),
        };

        for (index, polygon) in candidates.iter().enumerate() {
            match self.process_polygon(&extractor, &image, polygon, &stem, index)? {
                PolygonResult::NoOverlap => summary.skipped_no_overlap += 1,
                PolygonResult::Analyzed(status) => {
                    summary.cropped += 1;
                    summary.statuses.push((polygon.id, status));
                }
                PolygonResult::Skipped(e) => {
                    log::warn!("Skipping polygon {} of image {}: {}", polygon.id, image_id, e);
                    summary.failed_polygons.push((polygon.id, e.to_string()));
                }
            }
            reporter.report(ProcessingStage::PerPolygon { processed: index + 1, total })?;
        }

        reporter.report(ProcessingStage::Finalizing)?;
        reporter.report(ProcessingStage::Done)?;
        Ok(summary)
    }

    /// Remove crop rows and artifacts of an earlier run, including artifacts
    /// of polygons whose analysis failed and so never got a row
    fn clear_previous_crops(&self, image: &RasterImage) -> AccessResult<()> {
        let removed = self.catalog.delete_cropped_images(image.id)?;
        for crop in &removed {
            self.store.delete(&crop.annotated_key)?;
            self.store.delete(&crop.masked_key)?;
        }

        let prefix = format!("{}/", self.config.crop_prefix.trim_end_matches('/'));
        let stem = artifact_stem(&image.storage_key);
        let stale: Vec<String> = self
            .store
            .list(&prefix)?
            .into_iter()
            .filter(|key| is_crop_key(key, &self.config.crop_prefix, &stem))
            .collect();
        for key in &stale {
            self.store.delete(key)?;
        }

        if !removed.is_empty() || !stale.is_empty() {
            log::info!(
                "Removed {} crops and {} artifacts of a previous run of image {}",
                removed.len(),
                stale.len(),
                image.id
            );
        }
        Ok(())
    }

    fn locate(&self, image_id: ImageId, center: &geo::Coord<f64>) -> Option<String> {
        let geocoder = self.geocoder.as_ref()?;
        match geocoder.reverse(*center) {
            Ok(address) => {
                log::info!("Image {} is at {}", image_id, address);
                Some(address)
            }
            Err(e) => {
                log::warn!("Reverse geocoding of image {} failed: {}", image_id, e);
                None
            }
        }
    }

    /// Crop, analyse and persist one polygon. Only catalog writes return `Err`.
    fn process_polygon(
        &self,
        extractor: &CropExtractor,
        image: &RasterImage,
        polygon: &Polygon,
        stem: &str,
        index: usize,
    ) -> AccessResult<PolygonResult> {
        // reopened per polygon so no handle is held across slow model calls
        let raster = match self.locator.open(&image.storage_key) {
            Ok(raster) => raster,
            Err(e) => return Ok(PolygonResult::Skipped(e.for_polygon(polygon.id))),
        };
        let outcome = extractor.extract(&raster, polygon, stem, index, self.store.as_ref());
        raster.close();

        let artifacts = match outcome {
            Ok(CropOutcome::Extracted(artifacts)) => artifacts,
            Ok(CropOutcome::NoOverlap) => return Ok(PolygonResult::NoOverlap),
            Err(e) => return Ok(PolygonResult::Skipped(e)),
        };

        let model_start = Instant::now();
        let analysis = match analyze(self.model.as_ref(), &artifacts.masked_jpeg) {
            Ok(analysis) => analysis,
            Err(e) => return Ok(PolygonResult::Skipped(e)),
        };
        log::debug!(
            "Polygon {} analysed in {:.2}s",
            polygon.id,
            model_start.elapsed().as_secs_f64()
        );

        let status = PolygonStatus::from_analysis(&analysis);
        self.catalog.create_cropped_image(NewCroppedImage {
            image_id: image.id,
            polygon_id: polygon.id,
            filename: format!("{}-{}.jpg", image.filename, index),
            annotated_key: artifacts.annotated_key,
            masked_key: artifacts.masked_key,
            analysis,
        })?;
        self.catalog.set_polygon_status(polygon.id, status)?;
        log::info!("Polygon {} classified {}", polygon.id, status);

        Ok(PolygonResult::Analyzed(status))
    }
}
