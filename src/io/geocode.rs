use crate::config::ServiceConfig;
use crate::types::{AccessError, AccessResult};
use geo::Coord;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Turns a WGS84 (lon, lat) point into a human-readable location
pub trait ReverseGeocoder: Send + Sync {
    fn reverse(&self, point: Coord<f64>) -> AccessResult<String>;
}

/// Nominatim `/reverse` client
pub struct NominatimGeocoder {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(base_url: impl Into<String>) -> AccessResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Blockfinder")
            .build()
            .map_err(|e| AccessError::Geocoding(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &ServiceConfig) -> AccessResult<Self> {
        Self::new(&config.nominatim_url)
    }
}

impl ReverseGeocoder for NominatimGeocoder {
    fn reverse(&self, point: Coord<f64>) -> AccessResult<String> {
        let start = Instant::now();
        let url = format!(
            "{}/reverse?lon={}&lat={}&format=json&addressdetails=1",
            self.base_url, point.x, point.y
        );

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| AccessError::Geocoding(format!("Request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AccessError::Geocoding(format!("HTTP {} from {}", response.status().as_u16(), url)));
        }

        let body: Value = response
            .json()
            .map_err(|e| AccessError::Geocoding(format!("Unreadable reply: {}", e)))?;
        log::info!("Reverse geocoding completed in {:.2}s", start.elapsed().as_secs_f64());
        Ok(format_address(&body))
    }
}

/// `"{road}, {city}"` from a Nominatim reply
pub fn format_address(reply: &Value) -> String {
    let Some(address) = reply.get("address") else {
        return "No address found for the given coordinates.".to_string();
    };
    let road = address.get("road").and_then(Value::as_str).unwrap_or("No address found");
    let city = address.get("city").and_then(Value::as_str).unwrap_or("No city found");
    format!("{}, {}", road, city)
}
