// Location Lookup - fire-and-forget distance prewarm with an audit trail
//
// `schedule` returns an audit id immediately; the background task carries
// its own context derived from the process root, so a disconnecting HTTP
// caller never cancels it. Audit status transitions are monotonic: the
// spawned task is the single writer for its id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use log::{debug, info, warn};

use crate::cache_store::{CacheError, CacheStore};
use crate::catalog::CatalogReader;
use crate::distance_resolver::{DistanceError, DistanceRecord, DistanceResolver, ResolutionMethod};
use crate::latency_recorder::{RecorderHandle, SampleStatus, Service};
use crate::quoting_math::normalize_address;
use crate::settings::Location as LocationSettings;

const AUDIT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Pending,
    Processing,
    Success,
    Failed,
    FallbackUsed,
    GeocodingFailed,
    DistanceCalcFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationLookupAudit {
    pub id: Uuid,
    pub query_raw: String,
    pub query_normalized: String,
    pub nearest_branch_id: Option<String>,
    pub miles: Option<Decimal>,
    pub seconds: Option<u64>,
    pub status: AuditStatus,
    pub processing_ms: Option<u64>,
    pub api_calls_made: u32,
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

pub fn audit_key(id: Uuid) -> String {
    format!("audit:location:{}", id)
}

/// Estimated upstream calls behind one resolution, by how it was served.
fn api_calls_for(method: ResolutionMethod) -> u32 {
    match method {
        ResolutionMethod::Cached => 0,
        ResolutionMethod::Direct => 1,
        // One matrix attempt plus two geocodes.
        ResolutionMethod::FallbackGeocoded => 3,
    }
}

pub struct LocationLookupService {
    cache: CacheStore,
    resolver: Arc<DistanceResolver>,
    catalog: Arc<CatalogReader>,
    recorder: RecorderHandle,
    /// In-flight dedupe: normalized address -> completion notifier.
    inflight: DashMap<String, (Arc<Notify>, Instant)>,
    bg_timeout: Duration,
    dedupe_window: Duration,
}

impl LocationLookupService {
    pub fn new(
        cache: CacheStore,
        resolver: Arc<DistanceResolver>,
        catalog: Arc<CatalogReader>,
        recorder: RecorderHandle,
        settings: &LocationSettings,
    ) -> Self {
        Self {
            cache,
            resolver,
            catalog,
            recorder,
            inflight: DashMap::new(),
            bg_timeout: Duration::from_secs(settings.bg_timeout_s),
            dedupe_window: Duration::from_secs(settings.dedupe_window_s),
        }
    }

    /// Write the pending audit and schedule the background resolution.
    /// Returns as soon as the audit record exists.
    pub async fn schedule(self: Arc<Self>, address: &str) -> Result<Uuid, CacheError> {
        let id = Uuid::new_v4();
        let audit = LocationLookupAudit {
            id,
            query_raw: address.to_string(),
            query_normalized: normalize_address(address),
            nearest_branch_id: None,
            miles: None,
            seconds: None,
            status: AuditStatus::Pending,
            processing_ms: None,
            api_calls_made: 0,
            cache_hit: false,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };
        self.write_audit(&audit).await?;

        debug!("📍 Scheduled location lookup {} for '{}'", id, address);

        let service = Arc::clone(&self);
        let address = address.to_string();
        tokio::spawn(async move {
            service.run_background(audit, address).await;
        });

        Ok(id)
    }

    pub async fn get_audit(&self, id: Uuid) -> Result<Option<LocationLookupAudit>, CacheError> {
        self.cache.get_json(&audit_key(id)).await
    }

    async fn run_background(self: Arc<Self>, mut audit: LocationLookupAudit, address: String) {
        let timer = self.recorder.scope(Service::Location, "lookup");
        let started = Instant::now();
        let normalized = audit.query_normalized.clone();

        // Dedupe window: a lookup already in flight for the same address
        // warms the same cache entries; wait for it briefly instead of
        // doubling the upstream fan-out.
        let owned_notify = self.enter_inflight(&normalized).await;

        let outcome = tokio::time::timeout(
            self.bg_timeout,
            self.resolve_nearest(&address, &mut audit),
        )
        .await;

        audit.processing_ms = Some(started.elapsed().as_millis() as u64);
        audit.completed_at = Some(Utc::now());

        match outcome {
            Ok(()) => {}
            Err(_) => {
                audit.status = AuditStatus::Failed;
                audit.error_message = Some(format!(
                    "internal deadline of {:?} exceeded",
                    self.bg_timeout
                ));
            }
        }

        let status = audit.status;
        if let Err(e) = self.write_audit(&audit).await {
            warn!("⚠️ Failed to write terminal audit {}: {}", audit.id, e);
        }

        if let Some(notify) = owned_notify {
            notify.notify_waiters();
            self.inflight.remove(&normalized);
        }

        match status {
            AuditStatus::Success | AuditStatus::FallbackUsed => {
                timer.finish(SampleStatus::Ok);
                info!(
                    "📍 Lookup {} resolved: branch={:?} miles={:?} ({} api calls)",
                    audit.id, audit.nearest_branch_id, audit.miles, audit.api_calls_made
                );
            }
            _ => {
                timer.finish(SampleStatus::Failed);
                warn!(
                    "📍 Lookup {} ended '{:?}': {}",
                    audit.id,
                    status,
                    audit.error_message.as_deref().unwrap_or("-")
                );
            }
        }
    }

    /// Returns the notifier we own, or None if we waited on someone else's.
    /// The map guard is dropped before any await.
    async fn enter_inflight(&self, normalized: &str) -> Option<Arc<Notify>> {
        use dashmap::mapref::entry::Entry;

        let to_wait = match self.inflight.entry(normalized.to_string()) {
            Entry::Occupied(mut entry) => {
                let (notify, since) = entry.get().clone();
                if since.elapsed() < self.dedupe_window {
                    notify
                } else {
                    // Stale owner (crashed or slow past the window); take over.
                    let fresh = Arc::new(Notify::new());
                    entry.insert((fresh.clone(), Instant::now()));
                    return Some(fresh);
                }
            }
            Entry::Vacant(slot) => {
                let notify = Arc::new(Notify::new());
                slot.insert((notify.clone(), Instant::now()));
                return Some(notify);
            }
        };

        let wait = self.dedupe_window.min(Duration::from_secs(5));
        let _ = tokio::time::timeout(wait, to_wait.notified()).await;
        None
    }

    async fn resolve_nearest(&self, address: &str, audit: &mut LocationLookupAudit) {
        audit.status = AuditStatus::Processing;
        if let Err(e) = self.write_audit(audit).await {
            warn!("⚠️ Failed to mark audit {} processing: {}", audit.id, e);
        }

        let snapshot = match self.catalog.current().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                audit.status = AuditStatus::Failed;
                audit.error_message = Some("no pricing catalog installed yet".to_string());
                return;
            }
            Err(e) => {
                audit.status = AuditStatus::Failed;
                audit.error_message = Some(format!("catalog read failed: {}", e));
                return;
            }
        };

        // Fan out one resolution per branch; bounded by the branch count.
        let lookups = snapshot.branches.iter().map(|branch| {
            let resolver = Arc::clone(&self.resolver);
            async move {
                let result = resolver.resolve(address, &branch.address).await;
                (branch.id.clone(), result)
            }
        });
        let results: Vec<(String, Result<DistanceRecord, DistanceError>)> =
            futures::future::join_all(lookups).await;

        let mut nearest: Option<(String, DistanceRecord)> = None;
        let mut geocoding_failures = 0usize;
        let mut failures = 0usize;

        for (branch_id, result) in results {
            match result {
                Ok(record) => {
                    audit.api_calls_made += api_calls_for(record.method);
                    if record.method == ResolutionMethod::Cached {
                        audit.cache_hit = true;
                    }
                    let closer = nearest
                        .as_ref()
                        .map(|(_, best)| record.miles < best.miles)
                        .unwrap_or(true);
                    if closer {
                        nearest = Some((branch_id, record));
                    }
                }
                Err(DistanceError::GeocodingFailed(_)) => geocoding_failures += 1,
                Err(e) => {
                    debug!("📍 Branch '{}' resolution failed: {}", branch_id, e);
                    failures += 1;
                }
            }
        }

        match nearest {
            Some((branch_id, record)) => {
                audit.nearest_branch_id = Some(branch_id);
                audit.miles = Some(record.miles);
                audit.seconds = Some(record.seconds);
                audit.status = if record.method == ResolutionMethod::FallbackGeocoded {
                    AuditStatus::FallbackUsed
                } else {
                    AuditStatus::Success
                };
            }
            None if geocoding_failures > 0 && failures == 0 => {
                audit.status = AuditStatus::GeocodingFailed;
                audit.error_message = Some("address could not be geocoded".to_string());
            }
            None => {
                audit.status = AuditStatus::DistanceCalcFailed;
                audit.error_message =
                    Some("no branch distance could be resolved".to_string());
            }
        }
    }

    async fn write_audit(&self, audit: &LocationLookupAudit) -> Result<(), CacheError> {
        self.cache
            .set_json(&audit_key(audit.id), audit, Some(AUDIT_RETENTION))
            .await
    }
}
