use chrono::{DateTime, Utc};
use geo::{Coord, LineString, Polygon as GeoPolygon};
use serde::{Deserialize, Serialize};

/// Identifier of a registered raster image
pub type ImageId = i64;

/// Identifier of a site polygon
pub type PolygonId = i64;

/// Identifier of a cropped image record
pub type CroppedImageId = i64;

/// Processing status reported for a failed job
pub const STATUS_FAILED: i32 = -1;

/// Processing status reported for a finished job
pub const STATUS_COMPLETE: i32 = 100;

/// Axis-aligned bounding box in whatever CRS the caller is working in
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Envelope of a set of coordinates, `None` when the set is empty
    pub fn from_coords<'a, I>(coords: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Coord<f64>>,
    {
        let mut iter = coords.into_iter();
        let first = iter.next()?;
        let mut bbox = Self::new(first.x, first.y, first.x, first.y);
        for c in iter {
            bbox.min_x = bbox.min_x.min(c.x);
            bbox.min_y = bbox.min_y.min(c.y);
            bbox.max_x = bbox.max_x.max(c.x);
            bbox.max_y = bbox.max_y.max(c.y);
        }
        Some(bbox)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> Coord<f64> {
        Coord {
            x: (self.min_x + self.max_x) / 2.0,
            y: (self.min_y + self.max_y) / 2.0,
        }
    }

    /// Corners in ring order: lower-left, lower-right, upper-right, upper-left
    pub fn corners(&self) -> [Coord<f64>; 4] {
        [
            Coord { x: self.min_x, y: self.min_y },
            Coord { x: self.max_x, y: self.min_y },
            Coord { x: self.max_x, y: self.max_y },
            Coord { x: self.min_x, y: self.max_y },
        ]
    }

    pub fn to_polygon(&self) -> GeoPolygon<f64> {
        GeoPolygon::new(LineString::from(self.corners().to_vec()), vec![])
    }
}

/// Geospatial transformation parameters (GDAL geotransform order)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Pixel (col, row) to map coordinates
    pub fn apply(&self, col: f64, row: f64) -> Coord<f64> {
        Coord {
            x: self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            y: self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        }
    }

    /// Inverse transform mapping map coordinates back to pixel (col, row)
    pub fn invert(&self) -> AccessResult<GeoTransform> {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        if det.abs() < f64::EPSILON * 1e-6 || !det.is_finite() {
            return Err(AccessError::RasterMetadata(format!(
                "Geotransform is not invertible: {:?}",
                self.to_gdal()
            )));
        }

        let inv_det = 1.0 / det;
        let a = self.pixel_height * inv_det;
        let b = -self.rotation_x * inv_det;
        let d = -self.rotation_y * inv_det;
        let e = self.pixel_width * inv_det;

        Ok(GeoTransform {
            top_left_x: -(a * self.top_left_x + b * self.top_left_y),
            pixel_width: a,
            rotation_x: b,
            top_left_y: -(d * self.top_left_x + e * self.top_left_y),
            rotation_y: d,
            pixel_height: e,
        })
    }

    /// Transform of a sub-window whose top-left pixel is (col_off, row_off)
    pub fn window(&self, col_off: f64, row_off: f64) -> GeoTransform {
        let origin = self.apply(col_off, row_off);
        GeoTransform {
            top_left_x: origin.x,
            top_left_y: origin.y,
            ..*self
        }
    }

    /// Transform for the same footprint sampled with pixels `sx` x `sy` times larger
    pub fn scaled(&self, sx: f64, sy: f64) -> GeoTransform {
        GeoTransform {
            top_left_x: self.top_left_x,
            pixel_width: self.pixel_width * sx,
            rotation_x: self.rotation_x * sy,
            top_left_y: self.top_left_y,
            rotation_y: self.rotation_y * sx,
            pixel_height: self.pixel_height * sy,
        }
    }
}

/// Obstruction status of a site polygon, derived from its latest analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolygonStatus {
    Clear,
    Temporary,
    Permanent,
}

impl PolygonStatus {
    pub fn from_analysis(analysis: &AnalysisResult) -> Self {
        if !analysis.obstruction_present {
            PolygonStatus::Clear
        } else if analysis.is_permanent {
            PolygonStatus::Permanent
        } else {
            PolygonStatus::Temporary
        }
    }
}

impl Default for PolygonStatus {
    fn default() -> Self {
        PolygonStatus::Clear
    }
}

impl std::fmt::Display for PolygonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolygonStatus::Clear => write!(f, "clear"),
            PolygonStatus::Temporary => write!(f, "temporary"),
            PolygonStatus::Permanent => write!(f, "permanent"),
        }
    }
}

/// Structured obstruction report produced from the vision model's answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub obstruction_present: bool,
    pub sufficient_clearance: bool,
    pub sufficient_explanation: String,
    pub is_permanent: bool,
    pub permanent_explanation: String,
    pub is_flammable: bool,
    pub flammable_explanation: String,
    pub is_vehicle: bool,
    pub vehicle_explanation: String,
    pub label: String,
    pub description: String,
    pub recommended_actions: String,
}

/// A registered drone orthomosaic
#[derive(Debug, Clone)]
pub struct RasterImage {
    pub id: ImageId,
    pub filename: String,
    pub label: Option<String>,
    pub storage_key: String,
    pub overview_key: Option<String>,
    pub location: Option<String>,
    /// Raster bounds reprojected to WGS84
    pub bounds: Option<BoundingBox>,
    /// WGS84 center (lon, lat)
    pub center: Option<Coord<f64>>,
    /// Source CRS definition as read from the raster
    pub crs: Option<String>,
    pub processing_status: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written back once bounds and overview are resolved
#[derive(Debug, Clone)]
pub struct ImageUpdate {
    pub overview_key: String,
    pub location: Option<String>,
    pub bounds: BoundingBox,
    pub center: Coord<f64>,
    pub crs: String,
}

/// A georeferenced site polygon (WGS84 lon/lat ring)
#[derive(Debug, Clone)]
pub struct Polygon {
    pub id: PolygonId,
    pub name: Option<String>,
    pub address: Option<String>,
    pub kind: Option<String>,
    pub geometry: GeoPolygon<f64>,
    pub latest_status: PolygonStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating or updating a polygon
#[derive(Debug, Clone, Default)]
pub struct NewPolygon {
    pub name: Option<String>,
    pub address: Option<String>,
    pub kind: Option<String>,
    /// Exterior ring as (lon, lat) pairs; closed automatically when open
    pub coordinates: Vec<[f64; 2]>,
}

/// One crop produced for a (raster image, polygon) overlap
#[derive(Debug, Clone)]
pub struct CroppedImage {
    pub id: CroppedImageId,
    pub image_id: ImageId,
    pub polygon_id: PolygonId,
    pub filename: String,
    pub annotated_key: String,
    pub masked_key: String,
    pub analysis: AnalysisResult,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCroppedImage {
    pub image_id: ImageId,
    pub polygon_id: PolygonId,
    pub filename: String,
    pub annotated_key: String,
    pub masked_key: String,
    pub analysis: AnalysisResult,
}

/// Error types for image processing
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("Coordinate system error: {0}")]
    CoordinateSystem(String),

    #[error("Raster metadata error: {0}")]
    RasterMetadata(String),

    #[error("Crop extraction failed for polygon {polygon_id}: {message}")]
    CropExtraction { polygon_id: PolygonId, message: String },

    #[error("Model response error: {0}")]
    ModelResponse(String),

    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Spatial query error: {0}")]
    SpatialQuery(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Reverse geocoding failed: {0}")]
    Geocoding(String),

    #[error("Invalid polygon geometry: {0}")]
    InvalidGeometry(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Image encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job queue error: {0}")]
    Job(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AccessError {
    /// Errors scoped to a single polygon; everything else aborts a job
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AccessError::CropExtraction { .. }
                | AccessError::ModelResponse(_)
                | AccessError::ModelRequest(_)
                | AccessError::Geocoding(_)
        )
    }

    /// Tag an error with the polygon it occurred for
    pub fn for_polygon(self, polygon_id: PolygonId) -> AccessError {
        match self {
            e @ AccessError::CropExtraction { .. } => e,
            other => AccessError::CropExtraction {
                polygon_id,
                message: other.to_string(),
            },
        }
    }
}

impl From<image::ImageError> for AccessError {
    fn from(e: image::ImageError) -> Self {
        AccessError::Encoding(e.to_string())
    }
}

/// Result type for processing operations
pub type AccessResult<T> = Result<T, AccessError>;
