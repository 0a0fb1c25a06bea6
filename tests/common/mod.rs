#![allow(dead_code)]

use blockfinder::core::geo_transform::Crs;
use blockfinder::io::catalog::{InMemoryCatalog, SpatialIndex};
use blockfinder::io::geocode::ReverseGeocoder;
use blockfinder::io::model::VisionModel;
use blockfinder::io::raster::{write_rgb_geotiff, RasterLocator};
use blockfinder::io::storage::{MemoryStore, ObjectStore};
use blockfinder::types::{AccessError, AccessResult, BoundingBox, GeoTransform, NewPolygon, Polygon};
use blockfinder::{Pipeline, PipelineConfig};
use geo::Coord;
use ndarray::Array3;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// 200x200 WGS84 raster covering [103.80, 1.28] - [103.82, 1.30]
pub const ORTHO_TRANSFORM: [f64; 6] = [103.80, 0.0001, 0.0, 1.30, 0.0, -0.0001];

pub const CLEAR_ANSWER: &str = r#"{"obstruction": false, "sufficient": true, "sufficient_explanation": "Lane is empty"}"#;
pub const PARKED_CAR_ANSWER: &str = r#"The lane is partly blocked.
{"obstruction": true, "sufficient": false, "permanent": false, "vehicle": true,
 "vehicle_explanation": "A parked car", "label": "car", "actions": "Remove the car"}"#;
pub const BOLLARD_ANSWER: &str = r#"{"obstruction": true, "permanent": true, "label": "bollard"}"#;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn write_ortho(dir: &TempDir, name: &str) -> String {
    let cube = Array3::from_shape_fn((3, 200, 200), |(b, r, c)| match b {
        0 => (c % 256) as u8,
        1 => (r % 256) as u8,
        _ => 90,
    });
    write_rgb_geotiff(
        dir.path().join(name),
        &cube,
        &GeoTransform::from_gdal(ORTHO_TRANSFORM),
        &Crs::wgs84(),
    )
    .expect("Failed to write test raster");
    name.to_string()
}

/// GeoTIFF with pixels but neither a geotransform nor a CRS
pub fn write_plain_tiff(dir: &TempDir, name: &str) -> String {
    let driver = gdal::DriverManager::get_driver_by_name("GTiff").expect("GTiff driver missing");
    let dataset = driver
        .create_with_band_type::<u8, _>(dir.path().join(name), 64, 64, 3)
        .expect("Failed to create plain tiff");
    drop(dataset);
    name.to_string()
}

pub fn square(x0: f64, y0: f64, size: f64) -> NewPolygon {
    NewPolygon {
        name: Some(format!("lane {:.3},{:.3}", x0, y0)),
        address: None,
        kind: Some("fire access way".to_string()),
        coordinates: vec![[x0, y0], [x0 + size, y0], [x0 + size, y0 + size], [x0, y0 + size]],
    }
}

/// Model returning queued answers in order, then repeating the last one
pub struct ScriptedModel {
    answers: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    pub calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    delay: Duration,
}

impl ScriptedModel {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            last: Mutex::new(answers.last().copied().unwrap_or(CLEAR_ANSWER).to_string()),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn always(answer: &str) -> Self {
        Self::new(&[answer])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl VisionModel for ScriptedModel {
    fn submit(&self, image: &[u8], _prompt: &str) -> AccessResult<String> {
        assert_eq!(&image[..2], &[0xFF, 0xD8], "model must receive a JPEG");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let answer = self.answers.lock().pop_front();
        Ok(answer.unwrap_or_else(|| self.last.lock().clone()))
    }
}

pub struct FixedGeocoder(pub Option<&'static str>);

impl ReverseGeocoder for FixedGeocoder {
    fn reverse(&self, _point: Coord<f64>) -> AccessResult<String> {
        self.0
            .map(str::to_string)
            .ok_or_else(|| AccessError::Geocoding("service unavailable".to_string()))
    }
}

/// Returns every stored polygon regardless of the query box
pub struct EverythingIndex(pub Arc<InMemoryCatalog>);

impl SpatialIndex for EverythingIndex {
    fn find_overlapping(&self, _bbox: &BoundingBox) -> AccessResult<Vec<Polygon>> {
        Ok(self.0.polygons())
    }
}

pub struct BrokenIndex;

impl SpatialIndex for BrokenIndex {
    fn find_overlapping(&self, _bbox: &BoundingBox) -> AccessResult<Vec<Polygon>> {
        Err(AccessError::SpatialQuery("connection refused".to_string()))
    }
}

/// Memory store whose writes fail for keys under `failing_prefix`
pub struct FailingStore {
    pub inner: MemoryStore,
    failing_prefix: String,
}

impl FailingStore {
    pub fn failing_under(prefix: &str) -> Self {
        Self { inner: MemoryStore::new(), failing_prefix: prefix.to_string() }
    }
}

impl ObjectStore for FailingStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AccessResult<()> {
        if key.starts_with(&self.failing_prefix) {
            return Err(AccessError::Storage(format!("write to {} refused", key)));
        }
        self.inner.put(key, bytes, content_type)
    }

    fn get(&self, key: &str) -> AccessResult<Vec<u8>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> AccessResult<()> {
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> AccessResult<bool> {
        self.inner.exists(key)
    }

    fn list(&self, prefix: &str) -> AccessResult<Vec<String>> {
        self.inner.list(prefix)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub catalog: Arc<InMemoryCatalog>,
    pub store: Arc<MemoryStore>,
    pub model: Arc<ScriptedModel>,
}

impl Harness {
    pub fn new(model: ScriptedModel) -> Self {
        init_logging();
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
            catalog: Arc::new(InMemoryCatalog::new()),
            store: Arc::new(MemoryStore::new()),
            model: Arc::new(model),
        }
    }

    pub fn locator(&self) -> RasterLocator {
        RasterLocator::new(self.dir.path().to_string_lossy())
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_with_index(self.catalog.clone())
    }

    pub fn pipeline_with_store(&self, store: Arc<dyn ObjectStore>) -> Pipeline {
        Pipeline::new(
            self.catalog.clone(),
            self.catalog.clone(),
            store,
            self.model.clone(),
            self.locator(),
            PipelineConfig::default(),
        )
    }

    pub fn pipeline_with_index(&self, index: Arc<dyn SpatialIndex>) -> Pipeline {
        Pipeline::new(
            self.catalog.clone(),
            index,
            self.store.clone(),
            self.model.clone(),
            self.locator(),
            PipelineConfig::default(),
        )
    }
}
