// Metrics Readback - query surface over the latency recorder's sinks
//
// Percentiles come from the capped sorted sets, the running mean from the
// sum/count counters, trends from the raw sample streams. Reports carry a
// staleness flag when the sample count is below the configured minimum.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache_store::{CacheError, CacheStore};
use crate::latency_recorder::{count_key, sorted_key, stream_key, sum_key, Service};
use crate::settings::Latency as LatencySettings;

pub const SUPPORTED_PERCENTILES: [u8; 4] = [50, 90, 95, 99];

#[derive(Debug, Clone, Serialize)]
pub struct PercentileReport {
    pub service: String,
    pub p: u8,
    pub value_ms: Option<f64>,
    pub sample_count: u64,
    pub stale: bool,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub service: String,
    pub average_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub sample_count: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub services: Vec<ServiceSummary>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentSample {
    pub operation: String,
    pub ms: u64,
    pub status: String,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentReport {
    pub service: String,
    pub samples: Vec<RecentSample>,
    pub computed_at: DateTime<Utc>,
}

/// Percentile over an already-fetched score list: sort (redundant but
/// defensive against sink ordering bugs), then pick at the rounded-up
/// index.
pub fn percentile_from_scores(scores: &mut Vec<f64>, p: u8) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = scores.len();
    let rank = ((p as f64 / 100.0) * n as f64).ceil() as usize;
    let index = rank.max(1).min(n) - 1;
    Some(scores[index])
}

pub struct MetricsReadback {
    cache: CacheStore,
    min_samples: u64,
}

impl MetricsReadback {
    pub fn new(cache: CacheStore, settings: &LatencySettings) -> Self {
        Self {
            cache,
            min_samples: settings.min_samples_for_stats,
        }
    }

    async fn sample_count(&self, service: Service) -> Result<u64, CacheError> {
        let raw = self.cache.get_string(&count_key(service)).await?;
        Ok(raw.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0))
    }

    async fn scores(&self, service: Service) -> Result<Vec<f64>, CacheError> {
        let members = self
            .cache
            .range_by_score(&sorted_key(service), f64::NEG_INFINITY, f64::INFINITY)
            .await?;
        Ok(members.into_iter().map(|(_, score)| score).collect())
    }

    pub async fn percentile(
        &self,
        service: Service,
        p: u8,
    ) -> Result<PercentileReport, CacheError> {
        let mut scores = self.scores(service).await?;
        let count = self.sample_count(service).await?;
        Ok(PercentileReport {
            service: service.as_str().to_string(),
            p,
            value_ms: percentile_from_scores(&mut scores, p),
            sample_count: count,
            stale: count < self.min_samples,
            computed_at: Utc::now(),
        })
    }

    /// Running mean from the sum/count counters.
    pub async fn average(&self, service: Service) -> Result<(Option<f64>, u64), CacheError> {
        let sum = self
            .cache
            .get_string(&sum_key(service))
            .await?
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let count = self.sample_count(service).await?;
        let average = if count > 0 {
            Some(sum / count as f64)
        } else {
            None
        };
        Ok((average, count))
    }

    pub async fn recent(&self, service: Service, n: usize) -> Result<RecentReport, CacheError> {
        let entries = self.cache.stream_recent(&stream_key(service), n).await?;
        let samples = entries
            .into_iter()
            .map(|entry| {
                let field = |name: &str| {
                    entry
                        .fields
                        .iter()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default()
                };
                RecentSample {
                    operation: field("operation"),
                    ms: field("ms").parse().unwrap_or(0),
                    status: field("status"),
                    ts_ms: field("ts").parse().unwrap_or(0),
                }
            })
            .collect();
        Ok(RecentReport {
            service: service.as_str().to_string(),
            samples,
            computed_at: Utc::now(),
        })
    }

    pub async fn all_services_summary(&self) -> Result<SummaryReport, CacheError> {
        let mut services = Vec::with_capacity(Service::ALL.len());
        for service in Service::ALL {
            let (average_ms, count) = self.average(service).await?;
            let mut scores = self.scores(service).await?;
            services.push(ServiceSummary {
                service: service.as_str().to_string(),
                average_ms,
                p50_ms: percentile_from_scores(&mut scores, 50),
                p90_ms: percentile_from_scores(&mut scores, 90),
                p95_ms: percentile_from_scores(&mut scores, 95),
                p99_ms: percentile_from_scores(&mut scores, 99),
                sample_count: count,
                stale: count < self.min_samples,
            });
        }
        Ok(SummaryReport {
            services,
            computed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_index_rounds_up() {
        let mut scores: Vec<f64> = (1..=10).map(|v| v as f64 * 10.0).collect();
        // 10 samples: p50 -> 5th (50.0), p95 -> 10th (100.0), p99 -> 10th.
        assert_eq!(percentile_from_scores(&mut scores.clone(), 50), Some(50.0));
        assert_eq!(percentile_from_scores(&mut scores.clone(), 90), Some(90.0));
        assert_eq!(percentile_from_scores(&mut scores.clone(), 95), Some(100.0));
        assert_eq!(percentile_from_scores(&mut scores, 99), Some(100.0));
    }

    #[test]
    fn test_percentile_single_sample() {
        let mut scores = vec![42.0];
        for p in SUPPORTED_PERCENTILES {
            assert_eq!(percentile_from_scores(&mut scores, p), Some(42.0));
        }
    }

    #[test]
    fn test_percentile_empty_is_none() {
        let mut scores = Vec::new();
        assert_eq!(percentile_from_scores(&mut scores, 95), None);
    }

    #[test]
    fn test_percentile_sorts_defensively() {
        let mut scores = vec![300.0, 10.0, 200.0, 50.0];
        assert_eq!(percentile_from_scores(&mut scores, 50), Some(50.0));
    }
}
