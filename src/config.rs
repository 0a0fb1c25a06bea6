//! Pipeline and service configuration

use crate::types::{AccessError, AccessResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

/// Resampling used when reading a raster window at reduced resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resampling {
    Nearest,
    Bilinear,
    Average,
    Lanczos,
}

impl Resampling {
    pub fn to_gdal(self) -> gdal::raster::ResampleAlg {
        use gdal::raster::ResampleAlg;
        match self {
            Resampling::Nearest => ResampleAlg::NearestNeighbour,
            Resampling::Bilinear => ResampleAlg::Bilinear,
            Resampling::Average => ResampleAlg::Average,
            Resampling::Lanczos => ResampleAlg::Lanczos,
        }
    }
}

impl std::str::FromStr for Resampling {
    type Err = AccessError;

    fn from_str(s: &str) -> AccessResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            "average" => Ok(Resampling::Average),
            "lanczos" => Ok(Resampling::Lanczos),
            other => Err(AccessError::Config(format!("Unknown resampling method: {}", other))),
        }
    }
}

/// Parameters of the per-image processing pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Longest side of a crop read from the raster, in pixels
    pub max_crop_dimension: usize,
    /// Bounding size of the overview image (width, height)
    pub overview_size: (usize, usize),
    /// Fill colour of polygon overlays on the overview (RGBA)
    pub overlay_rgba: [u8; 4],
    /// Colour of the polygon boundary on annotated crops
    pub outline_rgb: [u8; 3],
    pub crop_jpeg_quality: u8,
    pub resampling: Resampling,
    /// Storage prefix for crop artifacts
    pub crop_prefix: String,
    /// Directory (relative to the raster's own key) holding overviews
    pub overview_dir: String,
    pub job_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_crop_dimension: 10_000,
            overview_size: (1920, 1080),
            overlay_rgba: [255, 0, 0, 128], // 50% opacity
            outline_rgb: [255, 0, 0],
            crop_jpeg_quality: 90,
            resampling: Resampling::Bilinear,
            crop_prefix: "fire-access-way".to_string(),
            overview_dir: "modified".to_string(),
            job_queue_capacity: 16,
        }
    }
}

/// Deployment settings for the external collaborators
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub model_url: String,
    pub model_name: String,
    pub model_temperature: f64,
    pub nominatim_url: String,
    /// GDAL path prefix rasters are opened under (local dir or /vsis3/bucket)
    pub raster_root: PathBuf,
    pub pipeline: PipelineConfig,
}

impl ServiceConfig {
    pub const DEFAULT_MODEL: &'static str = "llava:7b";
    pub const DEFAULT_NOMINATIM_URL: &'static str = "https://nominatim.openstreetmap.org";

    /// Build configuration from environment variables
    pub fn from_env() -> AccessResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> AccessResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let model_url = lookup("OLLAMA_API_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AccessError::Config("OLLAMA_API_URL is not set".to_string()))?;

        let model_temperature = match lookup("MODEL_TEMPERATURE") {
            Some(v) => v.trim().parse::<f64>().map_err(|e| {
                AccessError::Config(format!("MODEL_TEMPERATURE '{}' is not a number: {}", v, e))
            })?,
            None => 0.1,
        };

        let raster_root = match lookup("RASTER_ROOT") {
            Some(v) => PathBuf::from(v),
            None => dirs::cache_dir()
                .map(|dir| dir.join("blockfinder"))
                .ok_or_else(|| {
                    AccessError::Config("RASTER_ROOT is not set and no cache directory is available".to_string())
                })?,
        };

        let mut pipeline = PipelineConfig::default();
        if let Some(prefix) = lookup("PREFIX_FIRE_ACCESS_WAY") {
            pipeline.crop_prefix = prefix.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("MAX_CROP_DIMENSION") {
            pipeline.max_crop_dimension = v.trim().parse::<usize>().ok().filter(|d| *d > 0).ok_or_else(|| {
                AccessError::Config(format!("MAX_CROP_DIMENSION '{}' must be a positive integer", v))
            })?;
        }
        if let Some(v) = lookup("CROP_RESAMPLING") {
            pipeline.resampling = v.parse()?;
        }

        Ok(Self {
            model_url,
            model_name: lookup("OLLAMA_MODEL").unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            model_temperature,
            nominatim_url: lookup("NOMINATIM_URL").unwrap_or_else(|| Self::DEFAULT_NOMINATIM_URL.to_string()),
            raster_root,
            pipeline,
        })
    }
}

/// GDAL options for reading large rasters from remote object stores
pub fn apply_gdal_options() -> AccessResult<()> {
    let options = [
        ("GDAL_DISABLE_READDIR_ON_OPEN", "EMPTY_DIR"),
        ("CPL_VSIL_CURL_USE_HEAD", "NO"),
        ("VSI_CACHE", "TRUE"),
        ("GDAL_CACHEMAX", "512"),
    ];
    for (key, value) in options {
        gdal::config::set_config_option(key, value)?;
    }
    log::debug!("Applied GDAL remote read options");
    Ok(())
}

static GDAL_OPTIONS: OnceLock<Result<(), String>> = OnceLock::new();

/// Apply [`apply_gdal_options`] the first time any raster is opened
pub fn ensure_gdal_options() -> AccessResult<()> {
    GDAL_OPTIONS
        .get_or_init(|| apply_gdal_options().map_err(|e| e.to_string()))
        .clone()
        .map_err(AccessError::Config)
}
