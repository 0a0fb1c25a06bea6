//! Access to the outside world: raster datasets, object storage,
//! record catalog, vision model and geocoder

pub mod catalog;
pub mod geocode;
pub mod model;
pub mod raster;
pub mod storage;

pub use catalog::{Catalog, InMemoryCatalog, SpatialIndex};
pub use geocode::{NominatimGeocoder, ReverseGeocoder};
pub use model::{analyze, parse_report, OllamaClient, VisionModel, OBSTRUCTION_PROMPT};
pub use raster::{GeoRaster, RasterLocator};
pub use storage::{LocalStore, MemoryStore, ObjectStore};
