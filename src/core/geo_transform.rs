//! CRS reprojection of point sets and bounding boxes, plus the shared
//! WGS84 -> raster pixel-space mapping used by crop extraction and the overview.

use crate::types::{AccessError, AccessResult, BoundingBox, GeoTransform};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use geo::{Coord, LineString, Polygon as GeoPolygon};

/// Points inserted along each bbox edge before reprojecting
const BBOX_DENSIFY_POINTS: usize = 21;

/// Coordinate reference system given by any GDAL-understood definition
/// (`EPSG:32648`, WKT, PROJ string)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Crs(String);

impl Crs {
    pub fn new(definition: impl Into<String>) -> Self {
        Crs(definition.into())
    }

    pub fn wgs84() -> Self {
        Crs::from_epsg(4326)
    }

    pub fn from_epsg(code: u32) -> Self {
        Crs(format!("EPSG:{}", code))
    }

    pub fn definition(&self) -> &str {
        &self.0
    }

    /// Parse into a GDAL spatial reference with x=lon / y=lat axis order
    pub(crate) fn spatial_ref(&self) -> AccessResult<SpatialRef> {
        let srs = SpatialRef::from_definition(&self.0).map_err(|e| {
            AccessError::CoordinateSystem(format!("Cannot parse CRS '{}': {}", self.short_name(), e))
        })?;
        srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        Ok(srs)
    }

    /// Definition truncated for log and error messages (WKT can be very long)
    pub fn short_name(&self) -> String {
        if self.0.chars().count() > 64 {
            format!("{}...", self.0.chars().take(64).collect::<String>())
        } else {
            self.0.clone()
        }
    }
}

impl std::fmt::Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// A prepared transform between two CRSs, reusable for many batches
pub struct Reprojector {
    transform: Option<CoordTransform>,
    src: Crs,
    dst: Crs,
}

impl Reprojector {
    pub fn new(src: &Crs, dst: &Crs) -> AccessResult<Self> {
        let transform = if src == dst {
            None
        } else {
            let source = src.spatial_ref()?;
            let target = dst.spatial_ref()?;
            Some(CoordTransform::new(&source, &target).map_err(|e| {
                AccessError::CoordinateSystem(format!("No transform from {} to {}: {}", src, dst, e))
            })?)
        };

        Ok(Self {
            transform,
            src: src.clone(),
            dst: dst.clone(),
        })
    }

    /// Transform a batch of points in a single GDAL call
    pub fn points(&self, points: &[Coord<f64>]) -> AccessResult<Vec<Coord<f64>>> {
        let Some(transform) = &self.transform else {
            return Ok(points.to_vec());
        };
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let mut xs: Vec<f64> = points.iter().map(|c| c.x).collect();
        let mut ys: Vec<f64> = points.iter().map(|c| c.y).collect();
        let mut zs = vec![0.0; points.len()];

        transform.transform_coords(&mut xs, &mut ys, &mut zs).map_err(|e| {
            AccessError::CoordinateSystem(format!(
                "Transform of {} points from {} to {} failed: {}",
                points.len(),
                self.src,
                self.dst,
                e
            ))
        })?;

        let out: Vec<Coord<f64>> = xs.into_iter().zip(ys).map(|(x, y)| Coord { x, y }).collect();
        if let Some(bad) = out.iter().position(|c| !c.x.is_finite() || !c.y.is_finite()) {
            return Err(AccessError::CoordinateSystem(format!(
                "Point {} ({}, {}) has no valid image in {}",
                bad, points[bad].x, points[bad].y, self.dst
            )));
        }
        Ok(out)
    }

    /// Transform a bounding box, densifying its edges so curved
    /// projections of straight edges are still enclosed
    pub fn bbox(&self, bbox: &BoundingBox) -> AccessResult<BoundingBox> {
        if self.transform.is_none() {
            return Ok(*bbox);
        }

        let corners = bbox.corners();
        let mut samples = Vec::with_capacity(4 * BBOX_DENSIFY_POINTS);
        for i in 0..4 {
            let a = corners[i];
            let b = corners[(i + 1) % 4];
            for k in 0..BBOX_DENSIFY_POINTS {
                let t = k as f64 / BBOX_DENSIFY_POINTS as f64;
                samples.push(Coord {
                    x: a.x + (b.x - a.x) * t,
                    y: a.y + (b.y - a.y) * t,
                });
            }
        }

        let projected = self.points(&samples)?;
        BoundingBox::from_coords(&projected)
            .ok_or_else(|| AccessError::CoordinateSystem("Empty bounding box after transform".to_string()))
    }
}

/// Reproject a set of points between two CRSs
pub fn reproject_points(points: &[Coord<f64>], src: &Crs, dst: &Crs) -> AccessResult<Vec<Coord<f64>>> {
    Reprojector::new(src, dst)?.points(points)
}

/// Reproject a bounding box between two CRSs
pub fn reproject_bbox(bbox: &BoundingBox, src: &Crs, dst: &Crs) -> AccessResult<BoundingBox> {
    Reprojector::new(src, dst)?.bbox(bbox)
}

/// Maps WGS84 geometry into a raster's pixel grid (col, row)
pub struct PixelProjector {
    to_raster_crs: Reprojector,
    inverse: GeoTransform,
}

impl PixelProjector {
    pub fn new(raster_crs: &Crs, transform: &GeoTransform) -> AccessResult<Self> {
        Ok(Self {
            to_raster_crs: Reprojector::new(&Crs::wgs84(), raster_crs)?,
            inverse: transform.invert()?,
        })
    }

    pub fn ring(&self, ring: &LineString<f64>) -> AccessResult<LineString<f64>> {
        let map_coords = self.to_raster_crs.points(&ring.0)?;
        Ok(LineString::from(
            map_coords
                .iter()
                .map(|c| self.inverse.apply(c.x, c.y))
                .collect::<Vec<_>>(),
        ))
    }

    pub fn polygon(&self, polygon: &GeoPolygon<f64>) -> AccessResult<GeoPolygon<f64>> {
        let exterior = self.ring(polygon.exterior())?;
        let interiors = polygon
            .interiors()
            .iter()
            .map(|ring| self.ring(ring))
            .collect::<AccessResult<Vec<_>>>()?;
        Ok(GeoPolygon::new(exterior, interiors))
    }
}
