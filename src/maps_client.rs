// Maps Client - distance-matrix and geocoding against the maps provider
//
// The provider seam is a trait so the resolver can be exercised against a
// stub. Upstream calls are bounded by the configured timeout; transport
// errors get exactly one retry with a 250 ms backoff, 4xx never retries.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use anyhow::Context;
use log::{debug, warn};

use crate::settings::Maps as MapsSettings;

const METERS_PER_MILE: f64 = 1609.344;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum MapsError {
    #[error("no drivable route between endpoints")]
    NotRoutable,
    #[error("geocoding failed: {0}")]
    GeocodingFailed(String),
    #[error("maps transport error: {0}")]
    Transport(String),
    #[error("maps API returned HTTP {0}")]
    Api(u16),
    #[error("maps response malformed: {0}")]
    Malformed(String),
}

impl MapsError {
    /// 4xx responses are caller errors and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MapsError::Transport(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteLeg {
    pub miles: f64,
    pub seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[async_trait]
pub trait MapsProvider: Send + Sync {
    /// Driving distance between two free-form addresses.
    async fn distance_matrix(&self, origin: &str, destination: &str)
        -> Result<RouteLeg, MapsError>;
    /// Resolve an address to coordinates.
    async fn geocode(&self, address: &str) -> Result<GeoPoint, MapsError>;
    fn provider_name(&self) -> &'static str;
}

// ==================== GOOGLE-SHAPED RESPONSES ====================

#[derive(Debug, Deserialize)]
struct MatrixResponse {
    status: String,
    #[serde(default)]
    rows: Vec<MatrixRow>,
}

#[derive(Debug, Deserialize)]
struct MatrixRow {
    #[serde(default)]
    elements: Vec<MatrixElement>,
}

#[derive(Debug, Deserialize)]
struct MatrixElement {
    status: String,
    distance: Option<ValueField>,
    duration: Option<ValueField>,
}

#[derive(Debug, Deserialize)]
struct ValueField {
    value: f64,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: Location,
}

#[derive(Debug, Deserialize)]
struct Location {
    lat: f64,
    lng: f64,
}

pub struct GoogleMapsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GoogleMapsClient {
    pub fn new(settings: &MapsSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("Failed to create maps HTTP client")?;
        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    async fn get_with_retry(&self, url: Url) -> Result<reqwest::Response, MapsError> {
        let mut attempt = 0u8;
        loop {
            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    return Err(MapsError::Api(status.as_u16()));
                }
                Err(e) if attempt == 0 => {
                    attempt += 1;
                    warn!("⚠️ Maps transport error, retrying in {:?}: {}", RETRY_BACKOFF, e);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(MapsError::Transport(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl MapsProvider for GoogleMapsClient {
    async fn distance_matrix(
        &self,
        origin: &str,
        destination: &str,
    ) -> Result<RouteLeg, MapsError> {
        let url = Url::parse_with_params(
            &format!("{}/maps/api/distancematrix/json", self.base_url),
            &[
                ("origins", origin),
                ("destinations", destination),
                ("mode", "driving"),
                ("units", "imperial"),
                ("key", self.api_key.as_str()),
            ],
        )
        .map_err(|e| MapsError::Malformed(e.to_string()))?;

        let response = self.get_with_retry(url).await?;
        let body: MatrixResponse = response
            .json()
            .await
            .map_err(|e| MapsError::Malformed(e.to_string()))?;

        if body.status != "OK" {
            return Err(MapsError::Transport(format!(
                "matrix status '{}'",
                body.status
            )));
        }

        let element = body
            .rows
            .first()
            .and_then(|r| r.elements.first())
            .ok_or_else(|| MapsError::Malformed("matrix response had no elements".into()))?;

        match element.status.as_str() {
            "OK" => {
                let distance = element
                    .distance
                    .as_ref()
                    .ok_or_else(|| MapsError::Malformed("element missing distance".into()))?;
                let duration = element
                    .duration
                    .as_ref()
                    .ok_or_else(|| MapsError::Malformed("element missing duration".into()))?;
                let leg = RouteLeg {
                    miles: distance.value / METERS_PER_MILE,
                    seconds: duration.value as u64,
                };
                debug!(
                    "🗺️  Routed '{}' -> '{}': {:.1} mi",
                    origin, destination, leg.miles
                );
                Ok(leg)
            }
            "ZERO_RESULTS" => Err(MapsError::NotRoutable),
            "NOT_FOUND" => Err(MapsError::GeocodingFailed(format!(
                "'{}' or '{}' not found",
                origin, destination
            ))),
            other => Err(MapsError::Malformed(format!("element status '{}'", other))),
        }
    }

    async fn geocode(&self, address: &str) -> Result<GeoPoint, MapsError> {
        let url = Url::parse_with_params(
            &format!("{}/maps/api/geocode/json", self.base_url),
            &[("address", address), ("key", self.api_key.as_str())],
        )
        .map_err(|e| MapsError::Malformed(e.to_string()))?;

        let response = self.get_with_retry(url).await?;
        let body: GeocodeResponse = response
            .json()
            .await
            .map_err(|e| MapsError::Malformed(e.to_string()))?;

        match body.status.as_str() {
            "OK" => {
                let result = body
                    .results
                    .first()
                    .ok_or_else(|| MapsError::Malformed("geocode response had no results".into()))?;
                Ok(GeoPoint {
                    lat: result.geometry.location.lat,
                    lon: result.geometry.location.lng,
                })
            }
            "ZERO_RESULTS" => Err(MapsError::GeocodingFailed(address.to_string())),
            other => Err(MapsError::Transport(format!("geocode status '{}'", other))),
        }
    }

    fn provider_name(&self) -> &'static str {
        "google_maps"
    }
}
