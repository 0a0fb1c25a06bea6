//! Blockfinder: fire access way obstruction assessment from drone orthomosaics
//!
//! Takes a georeferenced raster and the site polygons stored in a catalog,
//! crops every overlapping polygon out of the raster, asks a vision model
//! whether the access way is obstructed, and records a per-polygon status
//! together with an annotated overview of the whole raster.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    AccessError, AccessResult, AnalysisResult, BoundingBox, CroppedImage, GeoTransform, ImageId, NewPolygon,
    Polygon, PolygonId, PolygonStatus, RasterImage,
};

pub use config::{PipelineConfig, Resampling, ServiceConfig};
pub use self::core::{CropExtractor, Crs, JobQueue, OverviewAnnotator, Pipeline, ProcessingSummary, ProgressHub};
pub use io::{GeoRaster, InMemoryCatalog, LocalStore, MemoryStore, ObjectStore, RasterLocator};
