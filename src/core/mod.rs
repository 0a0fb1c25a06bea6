//! Core processing modules

pub mod analytics;
pub mod artifact;
pub mod bounds;
pub mod crop;
pub mod geo_transform;
pub mod job_queue;
pub mod overview;
pub mod pipeline;
pub mod progress;
pub mod rasterize;

// Re-export main types
pub use analytics::{heat_map, metrics, obstruction_timeseries, Granularity, HeatMapEntry, Metrics};
pub use bounds::{resolve_bounds, ResolvedBounds};
pub use crop::{CropArtifacts, CropExtractor, CropOutcome};
pub use geo_transform::{reproject_bbox, reproject_points, Crs, PixelProjector, Reprojector};
pub use job_queue::{JobHandle, JobQueue};
pub use overview::OverviewAnnotator;
pub use pipeline::{Pipeline, ProcessingSummary};
pub use progress::{ProcessingStage, ProgressHub, ProgressReporter, ProgressSubscription};
pub use rasterize::{intersect, outline_thickness, raster_footprint, rasterize, PixelWindow};
