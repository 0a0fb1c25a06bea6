use crate::core::geo_transform::{reproject_bbox, Crs};
use crate::io::raster::GeoRaster;
use crate::types::{AccessError, AccessResult, BoundingBox, GeoTransform};
use geo::Coord;

/// Raster extent in its native CRS and in WGS84
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBounds {
    pub native: BoundingBox,
    pub wgs84: BoundingBox,
    /// Center of the WGS84 box (lon, lat)
    pub center: Coord<f64>,
    pub crs: Crs,
}

/// Envelope of the four pixel-grid corners mapped through the geotransform
pub fn native_bounds(transform: &GeoTransform, width: usize, height: usize) -> AccessResult<BoundingBox> {
    if width == 0 || height == 0 {
        return Err(AccessError::RasterMetadata(format!("Raster has empty extent {}x{}", width, height)));
    }
    let (w, h) = (width as f64, height as f64);
    let corners = [
        transform.apply(0.0, 0.0),
        transform.apply(w, 0.0),
        transform.apply(w, h),
        transform.apply(0.0, h),
    ];
    BoundingBox::from_coords(&corners)
        .filter(|b| b.width() > 0.0 && b.height() > 0.0)
        .ok_or_else(|| AccessError::RasterMetadata("Geotransform maps the raster to an empty box".to_string()))
}

/// Raster bounds and center in WGS84
pub fn resolve_bounds(raster: &GeoRaster) -> AccessResult<ResolvedBounds> {
    let transform = raster.geo_transform()?;
    let crs = raster.crs()?;
    let (width, height) = raster.size();

    let native = native_bounds(&transform, width, height)?;
    let wgs84 = reproject_bbox(&native, &crs, &Crs::wgs84())?;
    let center = wgs84.center();

    log::info!(
        "Resolved bounds of {}: [{:.6}, {:.6}] - [{:.6}, {:.6}] (from {})",
        raster.path(),
        wgs84.min_x,
        wgs84.min_y,
        wgs84.max_x,
        wgs84.max_y,
        crs
    );

    Ok(ResolvedBounds { native, wgs84, center, crs })
}
