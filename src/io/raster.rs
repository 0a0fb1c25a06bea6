use crate::config::Resampling;
use crate::core::geo_transform::Crs;
use crate::core::rasterize::PixelWindow;
use crate::types::{AccessError, AccessResult, GeoTransform};
use gdal::{Dataset, DriverManager};
use ndarray::{Array2, Array3, Axis};
use std::path::Path;

/// An open georeferenced raster (drone orthomosaic)
pub struct GeoRaster {
    dataset: Dataset,
    path: String,
}

impl GeoRaster {
    /// Open a raster by GDAL path (local file, /vsis3/..., /vsicurl/...)
    pub fn open<P: AsRef<Path>>(path: P) -> AccessResult<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        log::info!("Opening raster: {}", path_str);

        let dataset = Dataset::open(path.as_ref())?;
        let (width, height) = dataset.raster_size();
        log::debug!("Raster size: {}x{}, {} bands", width, height, dataset.raster_count());

        Ok(Self { dataset, path: path_str })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// (width, height) in pixels
    pub fn size(&self) -> (usize, usize) {
        self.dataset.raster_size()
    }

    pub fn band_count(&self) -> usize {
        self.dataset.raster_count().max(0) as usize
    }

    pub fn geo_transform(&self) -> AccessResult<GeoTransform> {
        let gt = self.dataset.geo_transform().map_err(|e| {
            AccessError::RasterMetadata(format!("Raster {} has no geotransform: {}", self.path, e))
        })?;
        Ok(GeoTransform::from_gdal(gt))
    }

    pub fn crs(&self) -> AccessResult<Crs> {
        let srs = self.dataset.spatial_ref().map_err(|e| {
            AccessError::RasterMetadata(format!("Raster {} has no CRS: {}", self.path, e))
        })?;

        if let (Ok(name), Ok(code)) = (srs.auth_name(), srs.auth_code()) {
            if name.eq_ignore_ascii_case("EPSG") {
                return Ok(Crs::new(format!("EPSG:{}", code)));
            }
        }

        let wkt = srs
            .to_wkt()
            .map_err(|e| AccessError::RasterMetadata(format!("Raster {} has an unreadable CRS: {}", self.path, e)))?;
        if wkt.trim().is_empty() {
            return Err(AccessError::RasterMetadata(format!("Raster {} has an empty CRS", self.path)));
        }
        Ok(Crs::new(wkt))
    }

    /// Read a pixel window as an RGB cube (band, row, col), resampled to `out_size` (width, height).
    /// Single-band rasters are replicated into three channels; extra bands (alpha) are ignored.
    pub fn read_rgb(
        &self,
        window: &PixelWindow,
        out_size: (usize, usize),
        resampling: Resampling,
    ) -> AccessResult<Array3<u8>> {
        let (out_width, out_height) = out_size;
        let band_count = self.band_count();
        if band_count == 0 {
            return Err(AccessError::RasterMetadata(format!("Raster {} has no bands", self.path)));
        }

        let mut cube = Array3::<u8>::zeros((3, out_height, out_width));
        for channel in 0..3 {
            let band_index = if band_count >= 3 { channel + 1 } else { 1 };
            let band = self.dataset.rasterband(band_index as isize)?;
            let band_data = band.read_as::<u8>(
                (window.col_off as isize, window.row_off as isize),
                (window.width, window.height),
                (out_width, out_height),
                Some(resampling.to_gdal()),
            )?;

            let plane = Array2::from_shape_vec((out_height, out_width), band_data.data).map_err(|e| {
                AccessError::RasterMetadata(format!("Failed to reshape band {}: {}", band_index, e))
            })?;
            cube.index_axis_mut(Axis(0), channel).assign(&plane);
        }

        Ok(cube)
    }

    /// Release the dataset handle
    pub fn close(self) {
        log::debug!("Closing raster: {}", self.path);
    }
}

/// Maps storage keys of raw rasters to paths GDAL can open
#[derive(Debug, Clone)]
pub struct RasterLocator {
    root: String,
}

impl RasterLocator {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, storage_key: &str) -> String {
        if self.root.is_empty() {
            return storage_key.to_string();
        }
        format!("{}/{}", self.root.trim_end_matches('/'), storage_key.trim_start_matches('/'))
    }

    /// Open a raster by storage key, applying the remote read options on first use
    pub fn open(&self, storage_key: &str) -> AccessResult<GeoRaster> {
        crate::config::ensure_gdal_options()?;
        GeoRaster::open(self.resolve(storage_key))
    }
}

/// Write a band-major RGB cube as a georeferenced GeoTIFF
pub fn write_rgb_geotiff<P: AsRef<Path>>(
    path: P,
    cube: &Array3<u8>,
    transform: &GeoTransform,
    crs: &Crs,
) -> AccessResult<()> {
    log::info!("Saving GeoTIFF: {}", path.as_ref().display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (bands, height, width) = cube.dim();

    let mut dataset = driver.create_with_band_type::<u8, _>(
        path.as_ref(),
        width as isize,
        height as isize,
        bands as isize,
    )?;
    dataset.set_geo_transform(&transform.to_gdal())?;
    dataset.set_spatial_ref(&crs.spatial_ref()?)?;

    for (b, plane) in cube.axis_iter(Axis(0)).enumerate() {
        let mut rasterband = dataset.rasterband((b + 1) as isize)?;
        let flat_data: Vec<u8> = plane.iter().cloned().collect();
        let buffer = gdal::raster::Buffer::new((width, height), flat_data);
        rasterband.write((0, 0), (width, height), &buffer)?;
    }

    Ok(())
}
