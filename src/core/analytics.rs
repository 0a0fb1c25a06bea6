//! Aggregate views over processed results: key metrics, per-polygon
//! obstruction heat map, and obstruction counts over time.

use crate::io::catalog::InMemoryCatalog;
use crate::types::{CroppedImage, PolygonId};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Polygon count per latest status ("clear", "temporary", "permanent")
    pub status_counts: BTreeMap<String, usize>,
    pub total_polygons: usize,
    pub total_images: usize,
    pub total_cropped: usize,
    pub vehicle_count: usize,
    pub flammable_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatMapEntry {
    pub polygon_id: PolygonId,
    pub name: Option<String>,
    /// Exterior ring as [lat, lon] pairs, the order map widgets expect
    pub coordinates: Vec<[f64; 2]>,
    pub obstruction_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    /// Start of the bucket containing `date` (weeks start on Monday)
    pub fn truncate(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Granularity::Day => date,
            Granularity::Week => date - Duration::days(date.weekday().num_days_from_monday() as i64),
            Granularity::Month => date.with_day(1).unwrap_or(date),
            Granularity::Year => date.with_ordinal(1).unwrap_or(date),
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = crate::types::AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "year" => Ok(Granularity::Year),
            other => Err(crate::types::AccessError::Config(format!("Unknown granularity: {}", other))),
        }
    }
}

pub fn metrics(catalog: &InMemoryCatalog) -> Metrics {
    let polygons = catalog.polygons();
    let crops = catalog.all_cropped_images();

    let mut status_counts = BTreeMap::new();
    for polygon in &polygons {
        *status_counts.entry(polygon.latest_status.to_string()).or_insert(0) += 1;
    }

    Metrics {
        status_counts,
        total_polygons: polygons.len(),
        total_images: catalog.images().len(),
        total_cropped: crops.len(),
        vehicle_count: crops.iter().filter(|c| c.analysis.is_vehicle).count(),
        flammable_count: crops.iter().filter(|c| c.analysis.is_flammable).count(),
    }
}

/// Every polygon with the number of its crops that found an obstruction
pub fn heat_map(catalog: &InMemoryCatalog) -> Vec<HeatMapEntry> {
    let mut counts: HashMap<PolygonId, usize> = HashMap::new();
    for crop in catalog.all_cropped_images() {
        if crop.analysis.obstruction_present {
            *counts.entry(crop.polygon_id).or_insert(0) += 1;
        }
    }

    catalog
        .polygons()
        .into_iter()
        .map(|p| HeatMapEntry {
            polygon_id: p.id,
            coordinates: p.geometry.exterior().coords().map(|c| [c.y, c.x]).collect(),
            obstruction_count: counts.get(&p.id).copied().unwrap_or(0),
            name: p.name,
        })
        .collect()
}

/// Obstructed crops per bucket, ordered by date. Empty buckets are omitted.
pub fn obstruction_timeseries(
    catalog: &InMemoryCatalog,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    granularity: Granularity,
) -> Vec<(NaiveDate, usize)> {
    let in_range = |c: &CroppedImage| {
        start.map_or(true, |s| c.created_at >= s) && end.map_or(true, |e| c.created_at <= e)
    };

    let mut buckets: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for crop in catalog.all_cropped_images().iter().filter(|c| c.analysis.obstruction_present && in_range(c)) {
        *buckets.entry(granularity.truncate(crop.created_at.date_naive())).or_insert(0) += 1;
    }
    buckets.into_iter().collect()
}
