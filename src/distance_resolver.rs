// Distance Resolver - cache-first road distance between two addresses
//
// Hit path never leaves the cache. Miss path calls the maps provider,
// persists the result under a TTL and returns it; a not-routable result
// degrades to geocoded great-circle miles times the road factor.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::cache_store::{CacheError, CacheStore};
use crate::latency_recorder::{RecorderHandle, SampleStatus, Service};
use crate::maps_client::{MapsError, MapsProvider};
use crate::metrics;
use crate::quoting_math::{distance_pair_key, haversine_miles, miles_from_f64};
use crate::settings::Maps as MapsSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Direct,
    FallbackGeocoded,
    Cached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceRecord {
    pub miles: Decimal,
    pub seconds: u64,
    pub provider: String,
    pub resolved_at: DateTime<Utc>,
    pub method: ResolutionMethod,
}

#[derive(Debug, thiserror::Error)]
pub enum DistanceError {
    #[error("geocoding failed: {0}")]
    GeocodingFailed(String),
    #[error("maps upstream unavailable: {0}")]
    Upstream(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub fn distance_cache_key(origin: &str, destination: &str) -> String {
    format!("distance:{}", distance_pair_key(origin, destination))
}

pub struct DistanceResolver {
    cache: CacheStore,
    maps: Arc<dyn MapsProvider>,
    recorder: RecorderHandle,
    road_factor: f64,
    direct_ttl: Duration,
    fallback_ttl: Duration,
}

impl DistanceResolver {
    pub fn new(
        cache: CacheStore,
        maps: Arc<dyn MapsProvider>,
        recorder: RecorderHandle,
        settings: &MapsSettings,
    ) -> Self {
        Self {
            cache,
            maps,
            recorder,
            road_factor: settings.road_factor,
            direct_ttl: Duration::from_secs(settings.distance_ttl_s),
            fallback_ttl: Duration::from_secs(settings.fallback_distance_ttl_s),
        }
    }

    /// Cache-only lookup. Used by the quote path to prefer branches whose
    /// distance is already warm before fanning out upstream.
    pub async fn peek_cached(
        &self,
        origin: &str,
        destination: &str,
    ) -> Result<Option<DistanceRecord>, CacheError> {
        self.cache
            .get_json(&distance_cache_key(origin, destination))
            .await
    }

    pub async fn resolve(
        &self,
        origin: &str,
        destination: &str,
    ) -> Result<DistanceRecord, DistanceError> {
        let key = distance_cache_key(origin, destination);

        if let Some(mut record) = self.cache.get_json::<DistanceRecord>(&key).await? {
            metrics::increment_distance_cache_hit();
            record.method = ResolutionMethod::Cached;
            return Ok(record);
        }
        metrics::increment_distance_cache_miss();

        // Upstream distance-matrix call, measured under the maps service.
        let timer = self.recorder.scope(Service::Maps, "distance_matrix");
        let matrix_result = self.maps.distance_matrix(origin, destination).await;
        match matrix_result {
            Ok(leg) => {
                timer.finish(SampleStatus::Ok);
                let record = DistanceRecord {
                    miles: miles_from_f64(leg.miles),
                    seconds: leg.seconds,
                    provider: self.maps.provider_name().to_string(),
                    resolved_at: Utc::now(),
                    method: ResolutionMethod::Direct,
                };
                self.persist(&key, &record, self.direct_ttl).await;
                Ok(record)
            }
            Err(MapsError::NotRoutable) => {
                timer.finish(SampleStatus::Failed);
                debug!(
                    "🧭 Not routable '{}' -> '{}', trying geocoded fallback",
                    origin, destination
                );
                self.resolve_fallback(&key, origin, destination).await
            }
            Err(MapsError::GeocodingFailed(detail)) => {
                timer.finish(SampleStatus::Failed);
                Err(DistanceError::GeocodingFailed(detail))
            }
            Err(e) => {
                timer.finish(SampleStatus::Failed);
                Err(DistanceError::Upstream(e.to_string()))
            }
        }
    }

    /// Great-circle estimate when the provider cannot route but can place
    /// both endpoints. Persisted with the shorter TTL.
    async fn resolve_fallback(
        &self,
        key: &str,
        origin: &str,
        destination: &str,
    ) -> Result<DistanceRecord, DistanceError> {
        let timer = self.recorder.scope(Service::Maps, "geocode");
        let (origin_point, destination_point) =
            tokio::join!(self.maps.geocode(origin), self.maps.geocode(destination));

        let (origin_point, destination_point) = match (origin_point, destination_point) {
            (Ok(a), Ok(b)) => {
                timer.finish(SampleStatus::Ok);
                (a, b)
            }
            (Err(e), _) | (_, Err(e)) => {
                timer.finish(SampleStatus::Failed);
                return match e {
                    MapsError::GeocodingFailed(detail) => {
                        Err(DistanceError::GeocodingFailed(detail))
                    }
                    other => Err(DistanceError::Upstream(other.to_string())),
                };
            }
        };

        let great_circle = haversine_miles(
            origin_point.lat,
            origin_point.lon,
            destination_point.lat,
            destination_point.lon,
        );
        let road_miles = great_circle * self.road_factor;
        // Rough driving-speed estimate for the duration field.
        let seconds = (road_miles / 45.0 * 3600.0) as u64;

        metrics::increment_distance_fallback();
        let record = DistanceRecord {
            miles: miles_from_f64(road_miles),
            seconds,
            provider: format!("{}+great_circle", self.maps.provider_name()),
            resolved_at: Utc::now(),
            method: ResolutionMethod::FallbackGeocoded,
        };
        self.persist(key, &record, self.fallback_ttl).await;
        Ok(record)
    }

    async fn persist(&self, key: &str, record: &DistanceRecord, ttl: Duration) {
        // A failed cache write costs a future upstream call, not this quote.
        if let Err(e) = self.cache.set_json(key, record, Some(ttl)).await {
            warn!("⚠️ Failed to persist distance record {}: {}", key, e);
        }
    }

    pub fn road_factor(&self) -> Decimal {
        Decimal::from_f64(self.road_factor).unwrap_or(Decimal::ONE)
    }
}
