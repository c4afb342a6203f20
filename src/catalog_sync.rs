// Catalog Sync - atomically replaces the cached pricing catalog
//
// Single-writer discipline: a best-effort lease (`catalog:sync:lock`,
// SET NX EX) guards the whole fetch -> parse -> validate -> publish run.
// The lease is re-checked immediately before the pointer flip; losing it
// mid-run aborts without touching `catalog:current_version`, so readers
// keep the previous snapshot.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use log::{debug, error, info, warn};

use crate::cache_store::CacheStore;
use crate::catalog::{CatalogPublisher, CatalogSnapshot, CatalogValidationError};
use crate::latency_recorder::{RecorderHandle, SampleStatus, Service};
use crate::metrics;
use crate::sheets_client::{
    parse_branches, parse_config, parse_generators, parse_products, SheetsClient,
};
use crate::settings::Sheets as SheetsSettings;

pub const SYNC_LOCK_KEY: &str = "catalog:sync:lock";
const SYNC_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("catalog sync already running")]
    AlreadyRunning,
    #[error("fetch failed at '{step}': {cause}")]
    Fetch { step: &'static str, cause: String },
    #[error("parse failed at '{step}': {cause}")]
    Parse { step: &'static str, cause: String },
    #[error("validation failed: {0}")]
    Validation(#[from] CatalogValidationError),
    #[error("sync lease lost before publish")]
    LeaseLost,
    #[error("cache failed at '{step}': {cause}")]
    Cache { step: &'static str, cause: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Startup,
    Periodic,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Startup => "startup",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub version: u64,
    pub products: usize,
    pub generators: usize,
    pub branches: usize,
    pub duration: Duration,
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "v{} ({} products, {} generators, {} branches) in {:?}",
            self.version, self.products, self.generators, self.branches, self.duration
        )
    }
}

pub struct CatalogSync {
    sheets: SheetsClient,
    cache: CacheStore,
    publisher: Arc<dyn CatalogPublisher>,
    recorder: RecorderHandle,
    settings: SheetsSettings,
}

impl CatalogSync {
    pub fn new(
        sheets: SheetsClient,
        cache: CacheStore,
        publisher: Arc<dyn CatalogPublisher>,
        recorder: RecorderHandle,
        settings: SheetsSettings,
    ) -> Self {
        Self {
            sheets,
            cache,
            publisher,
            recorder,
            settings,
        }
    }

    /// One full sync pass. Returns `AlreadyRunning` when another holder
    /// owns the lease; concurrent triggers coalesce instead of queueing.
    pub async fn sync_once(&self, trigger: SyncTrigger) -> Result<SyncOutcome, SyncError> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .cache
            .set_nx_ex(SYNC_LOCK_KEY, &token, SYNC_LOCK_TTL)
            .await
            .map_err(|e| SyncError::Cache {
                step: "lock",
                cause: e.to_string(),
            })?;
        if !acquired {
            metrics::increment_catalog_sync(trigger.as_str(), "already_running");
            return Err(SyncError::AlreadyRunning);
        }

        let result = self.run_locked(&token).await;
        self.release_lock(&token).await;

        match &result {
            Ok(outcome) => {
                info!("✅ Catalog sync ({}): {}", trigger.as_str(), outcome);
                metrics::increment_catalog_sync(trigger.as_str(), "ok");
                metrics::set_catalog_version(outcome.version);
            }
            Err(e) => {
                error!("❌ Catalog sync ({}) failed: {}", trigger.as_str(), e);
                metrics::increment_catalog_sync(trigger.as_str(), "error");
            }
        }
        result
    }

    /// Manual-trigger path for the admin endpoint: acquires the lease
    /// synchronously (so contention reports `already_running` immediately),
    /// then finishes the run in the background.
    pub async fn trigger_detached(self: Arc<Self>, trigger: SyncTrigger) -> Result<(), SyncError> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .cache
            .set_nx_ex(SYNC_LOCK_KEY, &token, SYNC_LOCK_TTL)
            .await
            .map_err(|e| SyncError::Cache {
                step: "lock",
                cause: e.to_string(),
            })?;
        if !acquired {
            metrics::increment_catalog_sync(trigger.as_str(), "already_running");
            return Err(SyncError::AlreadyRunning);
        }

        let sync = Arc::clone(&self);
        tokio::spawn(async move {
            let result = sync.run_locked(&token).await;
            sync.release_lock(&token).await;
            match result {
                Ok(outcome) => {
                    info!("✅ Catalog sync ({}): {}", trigger.as_str(), outcome);
                    metrics::increment_catalog_sync(trigger.as_str(), "ok");
                    metrics::set_catalog_version(outcome.version);
                }
                Err(e) => {
                    error!("❌ Catalog sync ({}) failed: {}", trigger.as_str(), e);
                    metrics::increment_catalog_sync(trigger.as_str(), "error");
                }
            }
        });
        Ok(())
    }

    async fn run_locked(&self, token: &str) -> Result<SyncOutcome, SyncError> {
        let started = Instant::now();

        // 1. Fetch all four ranges concurrently.
        let timer = self.recorder.scope(Service::Crm, "sheet_fetch");
        let fetched = tokio::try_join!(
            self.fetch_tab("products", &self.settings.range_products),
            self.fetch_tab("generators", &self.settings.range_generators),
            self.fetch_tab("branches", &self.settings.range_branches),
            self.fetch_tab("config", &self.settings.range_config),
        );
        let (products_rows, generators_rows, branches_rows, config_rows) = match fetched {
            Ok(rows) => {
                timer.finish(SampleStatus::Ok);
                rows
            }
            Err(e) => {
                timer.finish(SampleStatus::Failed);
                return Err(e);
            }
        };

        // 2-4. Parse + normalize + cross-validate. Any bad row rejects the
        // whole sync; the previous snapshot stays current.
        let products = parse_products(&products_rows).map_err(|e| SyncError::Parse {
            step: "products",
            cause: e.to_string(),
        })?;
        let generators = parse_generators(&generators_rows).map_err(|e| SyncError::Parse {
            step: "generators",
            cause: e.to_string(),
        })?;
        let branches = parse_branches(&branches_rows).map_err(|e| SyncError::Parse {
            step: "branches",
            cause: e.to_string(),
        })?;
        let config = parse_config(&config_rows).map_err(|e| SyncError::Parse {
            step: "config",
            cause: e.to_string(),
        })?;

        // 5. Assign the next version.
        let previous = self
            .publisher
            .current_version()
            .await
            .map_err(|e| SyncError::Cache {
                step: "current_version",
                cause: e.to_string(),
            })?;
        let version = previous.unwrap_or(0) + 1;

        let snapshot = CatalogSnapshot {
            products,
            generators,
            branches,
            config,
            version,
            installed_at: Utc::now(),
        };
        snapshot.validate()?;

        // 6. Stage the blobs, then flip the pointer - but only if the lease
        // is still ours. A lost lease here means another writer may have
        // started; publishing would race the pointer.
        self.publisher
            .stage(&snapshot)
            .await
            .map_err(|e| SyncError::Cache {
                step: "stage",
                cause: e.to_string(),
            })?;

        let holder = self
            .cache
            .get_string(SYNC_LOCK_KEY)
            .await
            .map_err(|e| SyncError::Cache {
                step: "lease_check",
                cause: e.to_string(),
            })?;
        if holder.as_deref() != Some(token) {
            return Err(SyncError::LeaseLost);
        }

        self.publisher
            .commit(version)
            .await
            .map_err(|e| SyncError::Cache {
                step: "commit",
                cause: e.to_string(),
            })?;

        Ok(SyncOutcome {
            version,
            products: snapshot.products.len(),
            generators: snapshot.generators.len(),
            branches: snapshot.branches.len(),
            duration: started.elapsed(),
        })
    }

    async fn fetch_tab(
        &self,
        step: &'static str,
        range: &str,
    ) -> Result<Vec<Vec<String>>, SyncError> {
        self.sheets
            .fetch_range(range)
            .await
            .map_err(|e| SyncError::Fetch {
                step,
                cause: e.to_string(),
            })
    }

    async fn release_lock(&self, token: &str) {
        // Best effort: only delete the lock if we still hold it. The TTL
        // cleans up after a crashed holder.
        match self.cache.get_string(SYNC_LOCK_KEY).await {
            Ok(Some(holder)) if holder == token => {
                if let Err(e) = self.cache.delete(SYNC_LOCK_KEY).await {
                    warn!("⚠️ Failed to release sync lock: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("⚠️ Failed to inspect sync lock on release: {}", e),
        }
    }

    /// Background loop: startup sync when no snapshot exists, then a
    /// periodic pass at the configured cadence.
    pub async fn run_periodic(self: Arc<Self>) {
        info!("🚀 Starting catalog sync loop");
        info!("   Interval: {}s", self.settings.sync_interval_s);

        match self.publisher.current_version().await {
            Ok(Some(version)) => {
                info!("📖 Catalog v{} already installed, skipping startup sync", version);
                metrics::set_catalog_version(version);
            }
            Ok(None) => {
                info!("🔥 No catalog installed, running startup sync...");
                if let Err(e) = self.sync_once(SyncTrigger::Startup).await {
                    warn!("⚠️ Startup sync failed, quotes unavailable until first success: {}", e);
                }
            }
            Err(e) => warn!("⚠️ Could not read catalog version at startup: {}", e),
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.sync_interval_s));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; the startup pass above covers it.
        ticker.tick().await;

        let mut iteration = 0u64;
        loop {
            ticker.tick().await;
            iteration += 1;
            match self.sync_once(SyncTrigger::Periodic).await {
                Ok(outcome) => debug!("✅ [Sync #{}] {}", iteration, outcome),
                Err(SyncError::AlreadyRunning) => {
                    debug!("⏭️  [Sync #{}] already running, coalesced", iteration)
                }
                Err(e) => warn!("⚠️ [Sync #{}] failed: {}", iteration, e),
            }
        }
    }
}
