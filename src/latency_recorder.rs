// Latency Recorder - scoped measurements for cache ops and outbound calls
// Non-blocking: request paths push into a bounded channel; a dedicated
// worker fans each sample out to the percentile / average / trend sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::cache_store::CacheStore;
use crate::metrics;
use crate::settings::Latency as LatencySettings;

/// Services with their own latency key family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Quote,
    Location,
    Maps,
    Crm,
    Voice,
    Cache,
}

impl Service {
    pub const ALL: [Service; 6] = [
        Service::Quote,
        Service::Location,
        Service::Maps,
        Service::Crm,
        Service::Voice,
        Service::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Quote => "quote",
            Service::Location => "location",
            Service::Maps => "maps",
            Service::Crm => "crm",
            Service::Voice => "voice",
            Service::Cache => "cache",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "quote" => Some(Service::Quote),
            "location" => Some(Service::Location),
            "maps" => Some(Service::Maps),
            "crm" => Some(Service::Crm),
            "voice" => Some(Service::Voice),
            "cache" => Some(Service::Cache),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStatus {
    Ok,
    Failed,
    Cancelled,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStatus::Ok => "ok",
            SampleStatus::Failed => "failed",
            SampleStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LatencySample {
    pub service: Service,
    pub operation: String,
    pub ms: u64,
    pub status: SampleStatus,
    pub ts_ms: i64,
}

// Key family: latency:{service}:sorted|sum|count|stream
pub fn sorted_key(service: Service) -> String {
    format!("latency:{}:sorted", service.as_str())
}
pub fn sum_key(service: Service) -> String {
    format!("latency:{}:sum", service.as_str())
}
pub fn count_key(service: Service) -> String {
    format!("latency:{}:count", service.as_str())
}
pub fn stream_key(service: Service) -> String {
    format!("latency:{}:stream", service.as_str())
}

/// Clonable, non-blocking producer side of the recorder. A full channel
/// drops the sample and bumps the drop counter; the request path never
/// waits on the sink.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<LatencySample>,
    dropped: Arc<AtomicU64>,
}

impl RecorderHandle {
    /// Build the bounded channel pair. The receiver goes to [`LatencyWorker`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LatencySample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn record(&self, sample: LatencySample) {
        if self.tx.try_send(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::increment_latency_sample_dropped();
        }
    }

    pub fn record_elapsed(
        &self,
        service: Service,
        operation: &str,
        elapsed: Duration,
        status: SampleStatus,
    ) {
        self.record(LatencySample {
            service,
            operation: operation.to_string(),
            ms: elapsed.as_millis() as u64,
            status,
            ts_ms: chrono::Utc::now().timestamp_millis(),
        });
    }

    /// Start a scoped measurement. The sample is recorded exactly once:
    /// on `finish(...)`, or with `status=cancelled` when the guard is
    /// dropped mid-flight (client disconnect, deadline breach).
    pub fn scope(&self, service: Service, operation: &str) -> ScopedTimer {
        ScopedTimer {
            handle: self.clone(),
            service,
            operation: operation.to_string(),
            start: Instant::now(),
            finished: false,
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct ScopedTimer {
    handle: RecorderHandle,
    service: Service,
    operation: String,
    start: Instant,
    finished: bool,
}

impl ScopedTimer {
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(mut self, status: SampleStatus) {
        self.finished = true;
        self.handle
            .record_elapsed(self.service, &self.operation, self.start.elapsed(), status);
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        if !self.finished {
            self.handle.record_elapsed(
                self.service,
                &self.operation,
                self.start.elapsed(),
                SampleStatus::Cancelled,
            );
        }
    }
}

/// Sole consumer of the sample channel. Fans each sample out to the
/// sorted set (percentiles), sum/count counters (running mean) and the
/// capped raw stream (trend display), then trims the sorted set.
pub struct LatencyWorker {
    rx: mpsc::Receiver<LatencySample>,
    cache: CacheStore,
    sorted_cap: usize,
    max_sample_age: Duration,
    dropped: Arc<AtomicU64>,
}

impl LatencyWorker {
    /// `cache` must be an uninstrumented store: the worker's own writes
    /// must not feed back into the sample channel.
    pub fn new(
        rx: mpsc::Receiver<LatencySample>,
        cache: CacheStore,
        settings: &LatencySettings,
    ) -> Self {
        Self {
            rx,
            cache,
            sorted_cap: settings.sorted_set_cap,
            max_sample_age: Duration::from_secs(settings.max_sample_age_s),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn run(mut self) {
        log::info!(
            "🚀 Latency worker started (sorted cap: {}, max sample age: {:?})",
            self.sorted_cap,
            self.max_sample_age
        );
        let mut consecutive_failures = 0u32;

        while let Some(sample) = self.rx.recv().await {
            // Catching up after saturation: stale samples are not worth
            // their four sink writes.
            let age_ms = chrono::Utc::now().timestamp_millis() - sample.ts_ms;
            if age_ms > self.max_sample_age.as_millis() as i64 {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::increment_latency_sample_dropped();
                continue;
            }

            match self.sink(&sample).await {
                Ok(()) => {
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures % 25 == 1 {
                        warn!(
                            "⚠️ Latency sink write failed (consecutive: {}): {}",
                            consecutive_failures, e
                        );
                    }
                }
            }
        }
        debug!("Latency worker channel closed, shutting down");
    }

    async fn sink(&self, sample: &LatencySample) -> Result<(), crate::cache_store::CacheError> {
        let member = format!("{}:{}", sample.ms, uuid::Uuid::new_v4());
        self.cache
            .add_sorted(&sorted_key(sample.service), sample.ms as f64, &member)
            .await?;
        self.cache
            .incr(&sum_key(sample.service), sample.ms as i64)
            .await?;
        self.cache.incr(&count_key(sample.service), 1).await?;
        self.cache
            .stream_append(
                &stream_key(sample.service),
                &[
                    ("operation".to_string(), sample.operation.clone()),
                    ("ms".to_string(), sample.ms.to_string()),
                    ("status".to_string(), sample.status.as_str().to_string()),
                    ("ts".to_string(), sample.ts_ms.to_string()),
                ],
                self.sorted_cap,
            )
            .await?;
        self.cache
            .trim_sorted(&sorted_key(sample.service), self.sorted_cap)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_roundtrip() {
        for service in Service::ALL {
            assert_eq!(Service::parse(service.as_str()), Some(service));
        }
        assert_eq!(Service::parse("nope"), None);
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_counts() {
        let (handle, _rx) = RecorderHandle::channel(2);
        for _ in 0..5 {
            handle.record_elapsed(
                Service::Quote,
                "build",
                Duration::from_millis(10),
                SampleStatus::Ok,
            );
        }
        // Capacity 2, five records: three dropped without blocking.
        assert_eq!(handle.dropped_count(), 3);
    }

    #[tokio::test]
    async fn test_scope_records_on_finish() {
        let (handle, mut rx) = RecorderHandle::channel(8);
        let timer = handle.scope(Service::Maps, "distance_matrix");
        timer.finish(SampleStatus::Ok);

        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.service, Service::Maps);
        assert_eq!(sample.operation, "distance_matrix");
        assert_eq!(sample.status, SampleStatus::Ok);
    }

    #[tokio::test]
    async fn test_dropped_scope_records_cancelled() {
        let (handle, mut rx) = RecorderHandle::channel(8);
        {
            let _timer = handle.scope(Service::Quote, "build");
            // Guard dropped without finish: the cancelled path.
        }
        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.status, SampleStatus::Cancelled);
    }

    #[test]
    fn test_key_families() {
        assert_eq!(sorted_key(Service::Quote), "latency:quote:sorted");
        assert_eq!(sum_key(Service::Maps), "latency:maps:sum");
        assert_eq!(count_key(Service::Cache), "latency:cache:count");
        assert_eq!(stream_key(Service::Voice), "latency:voice:stream");
    }
}
