//! Record persistence and spatial lookup of site polygons

use crate::types::{
    AccessError, AccessResult, BoundingBox, CroppedImage, CroppedImageId, ImageId, ImageUpdate,
    NewCroppedImage, NewPolygon, Polygon, PolygonId, PolygonStatus, RasterImage,
};
use chrono::{DateTime, Utc};
use geo::{BoundingRect, Coord, Intersects, LineString, Polygon as GeoPolygon, Validation};
use parking_lot::RwLock;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{RTree, AABB};
use std::collections::BTreeMap;

/// Persistence of images, polygons and crops used by the pipeline
pub trait Catalog: Send + Sync {
    fn image(&self, id: ImageId) -> AccessResult<RasterImage>;
    fn update_processing_status(&self, id: ImageId, status: i32) -> AccessResult<()>;
    fn update_image(&self, id: ImageId, update: ImageUpdate) -> AccessResult<()>;
    fn create_cropped_image(&self, crop: NewCroppedImage) -> AccessResult<CroppedImage>;
    /// Remove every crop of an image, returning the removed rows
    fn delete_cropped_images(&self, image_id: ImageId) -> AccessResult<Vec<CroppedImage>>;
    fn set_polygon_status(&self, id: PolygonId, status: PolygonStatus) -> AccessResult<()>;
}

/// Spatial query over stored polygons
pub trait SpatialIndex: Send + Sync {
    /// Every polygon whose geometry intersects the WGS84 box
    fn find_overlapping(&self, bbox: &BoundingBox) -> AccessResult<Vec<Polygon>>;
}

type Envelope = GeomWithData<Rectangle<[f64; 2]>, PolygonId>;

#[derive(Default)]
struct CatalogState {
    images: BTreeMap<ImageId, RasterImage>,
    polygons: BTreeMap<PolygonId, Polygon>,
    crops: BTreeMap<CroppedImageId, CroppedImage>,
    envelopes: RTree<Envelope>,
    next_image_id: ImageId,
    next_polygon_id: PolygonId,
    next_crop_id: CroppedImageId,
}

impl CatalogState {
    fn envelope_of(id: PolygonId, geometry: &GeoPolygon<f64>) -> Option<Envelope> {
        let rect = geometry.bounding_rect()?;
        Some(GeomWithData::new(
            Rectangle::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
            id,
        ))
    }

    fn unindex(&mut self, polygon: &Polygon) {
        if let Some(envelope) = Self::envelope_of(polygon.id, &polygon.geometry) {
            self.envelopes.remove(&envelope);
        }
    }

    fn index(&mut self, polygon: &Polygon) {
        if let Some(envelope) = Self::envelope_of(polygon.id, &polygon.geometry) {
            self.envelopes.insert(envelope);
        }
    }
}

/// Thread-safe in-process catalog with an R-tree over polygon envelopes
#[derive(Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- images ----

    pub fn register_image(
        &self,
        filename: impl Into<String>,
        label: Option<String>,
        storage_key: impl Into<String>,
    ) -> RasterImage {
        let mut state = self.state.write();
        state.next_image_id += 1;
        let now = Utc::now();
        let image = RasterImage {
            id: state.next_image_id,
            filename: filename.into(),
            label,
            storage_key: storage_key.into(),
            overview_key: None,
            location: None,
            bounds: None,
            center: None,
            crs: None,
            processing_status: 0,
            created_at: now,
            updated_at: now,
        };
        state.images.insert(image.id, image.clone());
        log::debug!("Registered image {} ({})", image.id, image.storage_key);
        image
    }

    pub fn images(&self) -> Vec<RasterImage> {
        self.state.read().images.values().cloned().collect()
    }

    /// Delete an image and its crops
    pub fn delete_image(&self, id: ImageId) -> AccessResult<(RasterImage, Vec<CroppedImage>)> {
        let mut state = self.state.write();
        let image = state
            .images
            .remove(&id)
            .ok_or_else(|| AccessError::NotFound(format!("Image {}", id)))?;
        let removed = drain_crops(&mut state.crops, |c| c.image_id == id);
        Ok((image, removed))
    }

    // ---- polygons ----

    pub fn create_polygon(&self, input: NewPolygon) -> AccessResult<Polygon> {
        let geometry = validated_geometry(&input.coordinates)?;
        let mut state = self.state.write();
        state.next_polygon_id += 1;
        let now = Utc::now();
        let polygon = Polygon {
            id: state.next_polygon_id,
            name: input.name,
            address: input.address,
            kind: input.kind,
            geometry,
            latest_status: PolygonStatus::Clear,
            created_at: now,
            updated_at: now,
        };
        state.index(&polygon);
        state.polygons.insert(polygon.id, polygon.clone());
        Ok(polygon)
    }

    pub fn update_polygon(&self, id: PolygonId, input: NewPolygon) -> AccessResult<Polygon> {
        let geometry = validated_geometry(&input.coordinates)?;
        let mut state = self.state.write();
        let mut polygon = state
            .polygons
            .get(&id)
            .cloned()
            .ok_or_else(|| AccessError::NotFound(format!("Polygon {}", id)))?;

        state.unindex(&polygon);
        polygon.name = input.name;
        polygon.address = input.address;
        polygon.kind = input.kind;
        polygon.geometry = geometry;
        polygon.updated_at = Utc::now();
        state.index(&polygon);
        state.polygons.insert(id, polygon.clone());
        Ok(polygon)
    }

    pub fn polygon(&self, id: PolygonId) -> AccessResult<Polygon> {
        self.state
            .read()
            .polygons
            .get(&id)
            .cloned()
            .ok_or_else(|| AccessError::NotFound(format!("Polygon {}", id)))
    }

    pub fn polygons(&self) -> Vec<Polygon> {
        self.state.read().polygons.values().cloned().collect()
    }

    /// Delete a polygon and every crop made for it
    pub fn delete_polygon(&self, id: PolygonId) -> AccessResult<(Polygon, Vec<CroppedImage>)> {
        let mut state = self.state.write();
        let polygon = state
            .polygons
            .remove(&id)
            .ok_or_else(|| AccessError::NotFound(format!("Polygon {}", id)))?;
        state.unindex(&polygon);
        let removed = drain_crops(&mut state.crops, |c| c.polygon_id == id);
        Ok((polygon, removed))
    }

    // ---- crops ----

    pub fn cropped_images(&self, image_id: ImageId) -> Vec<CroppedImage> {
        self.state
            .read()
            .crops
            .values()
            .filter(|c| c.image_id == image_id)
            .cloned()
            .collect()
    }

    pub fn all_cropped_images(&self) -> Vec<CroppedImage> {
        self.state.read().crops.values().cloned().collect()
    }

    /// Insert a crop with an explicit creation time (imports, backfills)
    pub fn insert_cropped_image_at(
        &self,
        crop: NewCroppedImage,
        created_at: DateTime<Utc>,
    ) -> AccessResult<CroppedImage> {
        let mut state = self.state.write();
        if !state.images.contains_key(&crop.image_id) {
            return Err(AccessError::NotFound(format!("Image {}", crop.image_id)));
        }
        if !state.polygons.contains_key(&crop.polygon_id) {
            return Err(AccessError::NotFound(format!("Polygon {}", crop.polygon_id)));
        }

        state.next_crop_id += 1;
        let record = CroppedImage {
            id: state.next_crop_id,
            image_id: crop.image_id,
            polygon_id: crop.polygon_id,
            filename: crop.filename,
            annotated_key: crop.annotated_key,
            masked_key: crop.masked_key,
            analysis: crop.analysis,
            created_at,
        };
        state.crops.insert(record.id, record.clone());
        Ok(record)
    }
}

fn drain_crops<F>(crops: &mut BTreeMap<CroppedImageId, CroppedImage>, pred: F) -> Vec<CroppedImage>
where
    F: Fn(&CroppedImage) -> bool,
{
    let ids: Vec<CroppedImageId> = crops.values().filter(|c| pred(c)).map(|c| c.id).collect();
    ids.into_iter().filter_map(|id| crops.remove(&id)).collect()
}

/// Build a WGS84 polygon from a (lon, lat) ring, rejecting anything that is not a valid simple polygon
pub fn validated_geometry(coordinates: &[[f64; 2]]) -> AccessResult<GeoPolygon<f64>> {
    let mut ring: Vec<Coord<f64>> = coordinates.iter().map(|[x, y]| Coord { x: *x, y: *y }).collect();

    if let Some(bad) = ring.iter().find(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err(AccessError::InvalidGeometry(format!("Non-finite coordinate ({}, {})", bad.x, bad.y)));
    }
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
        if first != last {
            ring.push(first);
        }
    }
    if ring.len() < 4 {
        return Err(AccessError::InvalidGeometry(format!(
            "A polygon ring needs at least 3 distinct vertices, got {}",
            ring.len().saturating_sub(1)
        )));
    }
    if let Some(c) = ring.iter().find(|c| c.x.abs() > 180.0 || c.y.abs() > 90.0) {
        return Err(AccessError::InvalidGeometry(format!("Coordinate ({}, {}) is not lon/lat", c.x, c.y)));
    }

    let polygon = GeoPolygon::new(LineString::from(ring), vec![]);
    if !polygon.is_valid() {
        return Err(AccessError::InvalidGeometry(
            "Polygon ring is self-intersecting or degenerate".to_string(),
        ));
    }
    Ok(polygon)
}

impl Catalog for InMemoryCatalog {
    fn image(&self, id: ImageId) -> AccessResult<RasterImage> {
        self.state
            .read()
            .images
            .get(&id)
            .cloned()
            .ok_or_else(|| AccessError::NotFound(format!("Image {}", id)))
    }

    fn update_processing_status(&self, id: ImageId, status: i32) -> AccessResult<()> {
        let mut state = self.state.write();
        let image = state
            .images
            .get_mut(&id)
            .ok_or_else(|| AccessError::NotFound(format!("Image {}", id)))?;
        image.processing_status = status;
        image.updated_at = Utc::now();
        Ok(())
    }

    fn update_image(&self, id: ImageId, update: ImageUpdate) -> AccessResult<()> {
        let mut state = self.state.write();
        let image = state
            .images
            .get_mut(&id)
            .ok_or_else(|| AccessError::NotFound(format!("Image {}", id)))?;
        image.overview_key = Some(update.overview_key);
        image.location = update.location;
        image.bounds = Some(update.bounds);
        image.center = Some(update.center);
        image.crs = Some(update.crs);
        image.updated_at = Utc::now();
        Ok(())
    }

    fn create_cropped_image(&self, crop: NewCroppedImage) -> AccessResult<CroppedImage> {
        self.insert_cropped_image_at(crop, Utc::now())
    }

    fn delete_cropped_images(&self, image_id: ImageId) -> AccessResult<Vec<CroppedImage>> {
        let mut state = self.state.write();
        Ok(drain_crops(&mut state.crops, |c| c.image_id == image_id))
    }

    fn set_polygon_status(&self, id: PolygonId, status: PolygonStatus) -> AccessResult<()> {
        let mut state = self.state.write();
        let polygon = state
            .polygons
            .get_mut(&id)
            .ok_or_else(|| AccessError::NotFound(format!("Polygon {}", id)))?;
        polygon.latest_status = status;
        polygon.updated_at = Utc::now();
        Ok(())
    }
}

impl SpatialIndex for InMemoryCatalog {
    fn find_overlapping(&self, bbox: &BoundingBox) -> AccessResult<Vec<Polygon>> {
        let finite = [bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y].iter().all(|v| v.is_finite());
        if !finite || bbox.min_x > bbox.max_x || bbox.min_y > bbox.max_y {
            return Err(AccessError::SpatialQuery(format!("Invalid query box {:?}", bbox)));
        }

        let state = self.state.read();
        let query = AABB::from_corners([bbox.min_x, bbox.min_y], [bbox.max_x, bbox.max_y]);
        let query_polygon = bbox.to_polygon();

        let mut hits: Vec<Polygon> = state
            .envelopes
            .locate_in_envelope_intersecting(&query)
            .filter_map(|entry| state.polygons.get(&entry.data))
            .filter(|p| p.geometry.intersects(&query_polygon))
            .cloned()
            .collect();
        hits.sort_by_key(|p| p.id);

        log::debug!("Spatial query {:?} matched {} polygons", bbox, hits.len());
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnalysisResult;

    fn square(x0: f64, y0: f64, size: f64) -> NewPolygon {
        NewPolygon {
            name: Some("lane".to_string()),
            coordinates: vec![[x0, y0], [x0 + size, y0], [x0 + size, y0 + size], [x0, y0 + size]],
            ..Default::default()
        }
    }

    #[test]
    fn test_polygon_validation() {
        let catalog = InMemoryCatalog::new();
        let created = catalog.create_polygon(square(103.81, 1.29, 0.001)).unwrap();
        assert_eq!(created.latest_status, PolygonStatus::Clear);
        assert_eq!(created.geometry.exterior().0.len(), 5);

        let bowtie = NewPolygon {
            coordinates: vec![[0.0, 0.0], [1.0, 1.0], [1.0, 0.0], [0.0, 1.0], [0.0, 0.0]],
            ..Default::default()
        };
        assert!(matches!(catalog.create_polygon(bowtie), Err(AccessError::InvalidGeometry(_))));

        let two_points = NewPolygon { coordinates: vec![[0.0, 0.0], [1.0, 1.0]], ..Default::default() };
        assert!(matches!(catalog.create_polygon(two_points), Err(AccessError::InvalidGeometry(_))));

        let nan = NewPolygon {
            coordinates: vec![[0.0, 0.0], [f64::NAN, 1.0], [1.0, 0.0]],
            ..Default::default()
        };
        assert!(matches!(catalog.create_polygon(nan), Err(AccessError::InvalidGeometry(_))));
        assert_eq!(catalog.polygons().len(), 1);
    }

    #[test]
    fn test_find_overlapping_uses_exact_geometry() {
        let catalog = InMemoryCatalog::new();
        let inside = catalog.create_polygon(square(103.805, 1.285, 0.002)).unwrap();
        catalog.create_polygon(square(104.5, 1.5, 0.002)).unwrap();
        // envelope overlaps the query box corner, geometry does not
        let triangle = NewPolygon {
            coordinates: vec![[103.819, 1.305], [103.825, 1.305], [103.825, 1.299]],
            ..Default::default()
        };
        catalog.create_polygon(triangle).unwrap();

        let hits = catalog
            .find_overlapping(&BoundingBox::new(103.80, 1.28, 103.82, 1.30))
            .unwrap();
        assert_eq!(hits.iter().map(|p| p.id).collect::<Vec<_>>(), vec![inside.id]);
    }

    #[test]
    fn test_update_polygon_reindexes() {
        let catalog = InMemoryCatalog::new();
        let polygon = catalog.create_polygon(square(10.0, 10.0, 1.0)).unwrap();
        catalog.update_polygon(polygon.id, square(50.0, 50.0, 1.0)).unwrap();

        assert!(catalog.find_overlapping(&BoundingBox::new(9.0, 9.0, 12.0, 12.0)).unwrap().is_empty());
        assert_eq!(catalog.find_overlapping(&BoundingBox::new(49.0, 49.0, 52.0, 52.0)).unwrap().len(), 1);
    }

    #[test]
    fn test_cascading_deletes() {
        let catalog = InMemoryCatalog::new();
        let image = catalog.register_image("a.tif", None, "uploads/a.tif");
        let p1 = catalog.create_polygon(square(0.0, 0.0, 1.0)).unwrap();
        let p2 = catalog.create_polygon(square(2.0, 0.0, 1.0)).unwrap();
        for polygon_id in [p1.id, p2.id] {
            catalog
                .create_cropped_image(NewCroppedImage {
                    image_id: image.id,
                    polygon_id,
                    filename: "a.tif".to_string(),
                    annotated_key: format!("faw/a-{}.jpg", polygon_id),
                    masked_key: format!("faw/masked/a-{}.jpg", polygon_id),
                    analysis: AnalysisResult::default(),
                })
                .unwrap();
        }

        let (_, removed) = catalog.delete_polygon(p1.id).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(catalog.cropped_images(image.id).len(), 1);

        let (_, removed) = catalog.delete_image(image.id).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(catalog.all_cropped_images().is_empty());
        assert!(matches!(catalog.image(image.id), Err(AccessError::NotFound(_))));
    }

    #[test]
    fn test_invalid_query_box_is_spatial_error() {
        let catalog = InMemoryCatalog::new();
        let result = catalog.find_overlapping(&BoundingBox::new(f64::NAN, 0.0, 1.0, 1.0));
        assert!(matches!(result, Err(AccessError::SpatialQuery(_))));
    }
}
