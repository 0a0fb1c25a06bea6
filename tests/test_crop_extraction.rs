mod common;

use blockfinder::core::crop::{CropExtractor, CropOutcome};
use blockfinder::core::geo_transform::{reproject_points, Crs};
use blockfinder::io::raster::{write_rgb_geotiff, GeoRaster};
use blockfinder::io::storage::{MemoryStore, ObjectStore};
use blockfinder::types::{GeoTransform, Polygon, PolygonStatus};
use blockfinder::PipelineConfig;
use chrono::Utc;
use geo::{Area, Coord, LineString, Polygon as GeoPolygon};
use ndarray::Array3;
use tempfile::TempDir;

const UTM_ORIGIN: (f64, f64) = (366_000.0, 145_000.0);

/// 400x400 raster of 1 m pixels in UTM zone 48N
fn utm_raster(dir: &TempDir) -> GeoRaster {
    let path = dir.path().join("utm.tif");
    let gt = GeoTransform::from_gdal([UTM_ORIGIN.0, 1.0, 0.0, UTM_ORIGIN.1, 0.0, -1.0]);
    write_rgb_geotiff(&path, &Array3::<u8>::from_elem((3, 400, 400), 120), &gt, &Crs::from_epsg(32648))
        .expect("Failed to write UTM raster");
    GeoRaster::open(&path).expect("Failed to open UTM raster")
}

/// Site polygon given by pixel-space vertices of the UTM raster, stored in WGS84
fn site_from_pixels(id: i64, pixels: &[(f64, f64)]) -> Polygon {
    let utm: Vec<Coord<f64>> = pixels
        .iter()
        .map(|(col, row)| Coord { x: UTM_ORIGIN.0 + col, y: UTM_ORIGIN.1 - row })
        .collect();
    let wgs84 = reproject_points(&utm, &Crs::from_epsg(32648), &Crs::wgs84()).unwrap();
    Polygon {
        id,
        name: None,
        address: None,
        kind: None,
        geometry: GeoPolygon::new(LineString::from(wgs84), vec![]),
        latest_status: PolygonStatus::Clear,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn pixel_area(pixels: &[(f64, f64)]) -> f64 {
    GeoPolygon::new(LineString::from(pixels.to_vec()), vec![]).unsigned_area()
}

#[test]
fn test_mask_area_matches_polygon_area() {
    common::init_logging();
    let dir = TempDir::new().unwrap();
    let raster = utm_raster(&dir);
    let store = MemoryStore::new();
    let extractor = CropExtractor::new(&PipelineConfig::default());

    let shapes: Vec<Vec<(f64, f64)>> = vec![
        vec![(100.0, 100.0), (200.0, 100.0), (200.0, 200.0), (100.0, 200.0)],
        vec![(50.0, 300.0), (350.0, 320.0), (120.0, 380.0)],
        vec![(210.0, 20.0), (390.0, 40.0), (380.0, 90.0), (300.0, 60.0), (220.0, 95.0)],
    ];

    for (i, shape) in shapes.iter().enumerate() {
        let outcome = extractor
            .extract(&raster, &site_from_pixels(i as i64, shape), "utm", i, &store)
            .unwrap();
        let CropOutcome::Extracted(artifacts) = outcome else {
            panic!("shape {} should overlap the raster", i);
        };

        let expected = pixel_area(shape);
        let relative = (artifacts.mask_area as f64 - expected).abs() / expected;
        assert_eq!(artifacts.scale, 1.0);
        assert!(relative < 0.02, "shape {}: mask {} vs area {}", i, artifacts.mask_area, expected);
    }
    assert_eq!(store.len(), 2 * shapes.len());
}

#[test]
fn test_mask_area_scales_with_output_size() {
    let dir = TempDir::new().unwrap();
    let raster = utm_raster(&dir);
    let store = MemoryStore::new();
    let square = [(100.0, 100.0), (300.0, 100.0), (300.0, 300.0), (100.0, 300.0)];

    let full = CropExtractor::new(&PipelineConfig::default())
        .extract(&raster, &site_from_pixels(1, &square), "utm", 0, &store)
        .unwrap();
    let config = PipelineConfig { max_crop_dimension: 50, ..PipelineConfig::default() };
    let reduced = CropExtractor::new(&config)
        .extract(&raster, &site_from_pixels(1, &square), "utm", 1, &store)
        .unwrap();

    let full = full.artifacts().unwrap();
    let reduced = reduced.artifacts().unwrap();
    assert_eq!(reduced.output_size.0.max(reduced.output_size.1), 50);
    assert!(reduced.scale < 0.26 && reduced.scale > 0.24);

    let predicted = full.mask_area as f64 * reduced.scale * reduced.scale;
    let relative = (reduced.mask_area as f64 - predicted).abs() / predicted;
    assert!(relative < 0.05, "reduced mask {} vs predicted {}", reduced.mask_area, predicted);
}

#[test]
fn test_outline_is_drawn_on_annotated_crop_only() {
    let dir = TempDir::new().unwrap();
    let raster = utm_raster(&dir);
    let store = MemoryStore::new();
    let config = PipelineConfig::default();
    let square = [(100.0, 100.0), (200.0, 100.0), (200.0, 200.0), (100.0, 200.0)];

    let outcome = CropExtractor::new(&config)
        .extract(&raster, &site_from_pixels(7, &square), "utm", 3, &store)
        .unwrap();
    let artifacts = outcome.artifacts().unwrap();

    let annotated = image::load_from_memory(&store.get(&artifacts.annotated_key).unwrap())
        .unwrap()
        .to_rgb8();
    let masked = image::load_from_memory(&artifacts.masked_jpeg).unwrap().to_rgb8();
    let (w, h) = annotated.dimensions();
    assert_eq!((w as usize, h as usize), artifacts.output_size);

    // the top edge runs through the first rows: red on the annotated crop, grey on the masked one
    let red = (0..4).any(|y| {
        let p = annotated.get_pixel(w / 2, y).0;
        p[0] > 180 && p[1] < 90
    });
    assert!(red, "no outline near the top edge");
    let inside = masked.get_pixel(w / 2, h / 2).0;
    assert!((inside[0] as i32 - 120).abs() < 12);
}

#[test]
fn test_no_overlap_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let raster = utm_raster(&dir);
    let store = MemoryStore::new();
    let far = [(1000.0, 1000.0), (1100.0, 1000.0), (1100.0, 1100.0), (1000.0, 1100.0)];

    let outcome = CropExtractor::new(&PipelineConfig::default())
        .extract(&raster, &site_from_pixels(2, &far), "utm", 0, &store)
        .unwrap();
    assert!(matches!(outcome, CropOutcome::NoOverlap));
    assert!(store.is_empty());
}
