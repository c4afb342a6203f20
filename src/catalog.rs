// Catalog data model - the immutable versioned snapshot the quote path reads
//
// A snapshot is the unit of atomic swap: the sync layer writes the four
// version-suffixed blobs, then flips `catalog:current_version`. Readers
// dereference the pointer once per request and work against an immutable
// object for the rest of the computation.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use crate::cache_store::{CacheError, CacheStore};
use crate::quoting_math::MonthDay;

pub const CURRENT_VERSION_KEY: &str = "catalog:current_version";

pub fn products_key(version: u64) -> String {
    format!("catalog:v{}:products", version)
}
pub fn generators_key(version: u64) -> String {
    format!("catalog:v{}:generators", version)
}
pub fn branches_key(version: u64) -> String {
    format!("catalog:v{}:branches", version)
}
pub fn config_key(version: u64) -> String {
    format!("catalog:v{}:config", version)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    RestroomTrailer,
    ShowerTrailer,
    ComboTrailer,
    SpecialtyTrailer,
    PortableToilet,
}

impl ProductCategory {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "restroom_trailer" => Some(Self::RestroomTrailer),
            "shower_trailer" => Some(Self::ShowerTrailer),
            "combo_trailer" => Some(Self::ComboTrailer),
            "specialty_trailer" => Some(Self::SpecialtyTrailer),
            "portable_toilet" => Some(Self::PortableToilet),
            _ => None,
        }
    }
}

/// Per-day rates for one bracket of rental days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationTier {
    pub min_days: u32,
    pub max_days: u32,
    pub event_rate: Decimal,
    pub rate_28_day: Decimal,
    pub rate_2_5_month: Decimal,
    pub rate_6_plus_month: Decimal,
    #[serde(default)]
    pub features_included: BTreeSet<String>,
}

impl DurationTier {
    pub fn contains(&self, rental_days: u32) -> bool {
        self.min_days <= rental_days && rental_days <= self.max_days
    }

    /// Rate selection inside the tier. Event usage only qualifies for the
    /// event rate up to a week; everything else falls through by length.
    pub fn daily_rate(&self, rental_days: u32, event_usage: bool) -> (Decimal, &'static str) {
        if rental_days <= 7 && event_usage {
            (self.event_rate, "event_rate")
        } else if rental_days <= 28 {
            (self.rate_28_day, "rate_28_day")
        } else if rental_days <= 75 {
            (self.rate_2_5_month, "rate_2_5_month")
        } else {
            (self.rate_6_plus_month, "rate_6_plus_month")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRule {
    pub id: String,
    pub category: ProductCategory,
    #[serde(default)]
    pub seasonal_exempt: bool,
    /// Ordered by `min_days`; overlaps resolve to the smaller `min_days`.
    pub rates_by_duration: Vec<DurationTier>,
}

impl ProductRule {
    pub fn select_duration_tier(&self, rental_days: u32) -> Option<&DurationTier> {
        // Tiers are kept sorted by min_days at install time, so the first
        // containing tier is the smallest-min_days winner.
        self.rates_by_duration.iter().find(|t| t.contains(rental_days))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorRule {
    pub id: String,
    pub kw: Decimal,
    pub event_rate: Decimal,
    pub rate_7_day: Decimal,
    pub rate_28_day: Decimal,
    #[serde(default)]
    pub seasonal_exempt: bool,
}

impl GeneratorRule {
    /// Flat per-rental price for a generator attached as an extra.
    pub fn flat_rate(&self, rental_days: u32) -> (Decimal, &'static str) {
        if rental_days <= 7 {
            (self.event_rate, "event_rate")
        } else if rental_days <= 28 {
            (self.rate_7_day, "rate_7_day")
        } else {
            (self.rate_28_day, "rate_28_day")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub label: String,
    pub address: String,
    pub normalized_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalWindow {
    pub start_month_day: MonthDay,
    pub end_month_day: MonthDay,
    pub factor: Decimal,
}

impl SeasonalWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        MonthDay::contains(self.start_month_day, self.end_month_day, date)
    }

    pub fn label(&self) -> String {
        format!("{}..{}", self.start_month_day, self.end_month_day)
    }
}

/// A mileage bracket. `upper_bound_miles = None` means unbounded (the last
/// tier). Bounds are inclusive: `miles <= upper_bound` selects the tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceTier {
    pub tier_name: String,
    pub upper_bound_miles: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub per_mile_rates: IndexMap<String, Decimal>,
    pub base_fee_by_tier: IndexMap<String, Decimal>,
    pub seasonal_multipliers: Vec<SeasonalWindow>,
    pub distance_tiers: Vec<DistanceTier>,
}

/// The immutable versioned catalog. Never mutated in place: the sync layer
/// always builds a fresh snapshot and publishes it whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub products: IndexMap<String, ProductRule>,
    pub generators: IndexMap<String, GeneratorRule>,
    pub branches: Vec<Branch>,
    pub config: DeliveryConfig,
    pub version: u64,
    pub installed_at: DateTime<Utc>,
}

/// Persisted shape of `catalog:v{N}:config`: the delivery config plus the
/// install metadata, so the key families stay exactly four per version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigBlob {
    pub delivery: DeliveryConfig,
    pub version: u64,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogValidationError {
    #[error("catalog has no branches")]
    EmptyBranches,
    #[error("distance tiers invalid: {0}")]
    DistanceTiers(String),
    #[error("seasonal window invalid: {0}")]
    SeasonalWindow(String),
    #[error("product '{id}' invalid: {reason}")]
    Product { id: String, reason: String },
}

impl CatalogSnapshot {
    /// Seasonal factor for a rental start date. Defaults to 1.0 outside
    /// every window.
    pub fn seasonal_factor(&self, date: NaiveDate) -> (Decimal, Option<String>) {
        for window in &self.config.seasonal_multipliers {
            if window.contains(date) {
                return (window.factor, Some(window.label()));
            }
        }
        (Decimal::ONE, None)
    }

    /// Pick the mileage bracket for a delivery. Returns
    /// (tier name, base fee, per-mile rate).
    pub fn delivery_tier(&self, miles: Decimal) -> Option<(String, Decimal, Decimal)> {
        for tier in &self.config.distance_tiers {
            let matches = match tier.upper_bound_miles {
                Some(bound) => miles <= bound,
                None => true,
            };
            if matches {
                let base = self
                    .config
                    .base_fee_by_tier
                    .get(&tier.tier_name)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                let per_mile = self
                    .config
                    .per_mile_rates
                    .get(&tier.tier_name)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                return Some((tier.tier_name.clone(), base, per_mile));
            }
        }
        None
    }

    /// Whole-snapshot validation, run before publish. A snapshot that
    /// fails any check is rejected in full.
    pub fn validate(&self) -> Result<(), CatalogValidationError> {
        if self.branches.is_empty() {
            return Err(CatalogValidationError::EmptyBranches);
        }

        if self.config.distance_tiers.is_empty() {
            return Err(CatalogValidationError::DistanceTiers(
                "no distance tiers configured".into(),
            ));
        }
        let mut prev: Option<Decimal> = None;
        for (idx, tier) in self.config.distance_tiers.iter().enumerate() {
            let last = idx + 1 == self.config.distance_tiers.len();
            match (tier.upper_bound_miles, last) {
                (None, false) => {
                    return Err(CatalogValidationError::DistanceTiers(format!(
                        "tier '{}' is unbounded but not last",
                        tier.tier_name
                    )));
                }
                (Some(bound), _) => {
                    if let Some(prev) = prev {
                        if bound <= prev {
                            return Err(CatalogValidationError::DistanceTiers(format!(
                                "tier '{}' bound {} not strictly increasing",
                                tier.tier_name, bound
                            )));
                        }
                    }
                    prev = Some(bound);
                }
                (None, true) => {}
            }
        }
        if self
            .config
            .distance_tiers
            .last()
            .and_then(|t| t.upper_bound_miles)
            .is_some()
        {
            return Err(CatalogValidationError::DistanceTiers(
                "last tier must be unbounded".into(),
            ));
        }

        for window in &self.config.seasonal_multipliers {
            if window.start_month_day > window.end_month_day {
                return Err(CatalogValidationError::SeasonalWindow(format!(
                    "window {} starts after it ends",
                    window.label()
                )));
            }
        }
        // Every calendar day maps to at most one window.
        for (i, a) in self.config.seasonal_multipliers.iter().enumerate() {
            for b in self.config.seasonal_multipliers.iter().skip(i + 1) {
                let disjoint =
                    a.end_month_day < b.start_month_day || b.end_month_day < a.start_month_day;
                if !disjoint {
                    return Err(CatalogValidationError::SeasonalWindow(format!(
                        "windows {} and {} overlap",
                        a.label(),
                        b.label()
                    )));
                }
            }
        }

        for product in self.products.values() {
            if product.rates_by_duration.is_empty() {
                return Err(CatalogValidationError::Product {
                    id: product.id.clone(),
                    reason: "no duration tiers".into(),
                });
            }
            for tier in &product.rates_by_duration {
                if tier.min_days > tier.max_days {
                    return Err(CatalogValidationError::Product {
                        id: product.id.clone(),
                        reason: format!(
                            "tier [{}, {}] has min > max",
                            tier.min_days, tier.max_days
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

// ==================== PUBLISHER SEAM ====================

/// Where the sync layer writes snapshots. The sync never imports its
/// consumers; the composition root hands it this interface.
#[async_trait]
pub trait CatalogPublisher: Send + Sync {
    async fn current_version(&self) -> Result<Option<u64>, CacheError>;
    /// Write the version-suffixed blobs without making them current.
    async fn stage(&self, snapshot: &CatalogSnapshot) -> Result<(), CacheError>;
    /// Flip the single pointer. Only called while the sync lease is held.
    async fn commit(&self, version: u64) -> Result<(), CacheError>;
}

/// Cache-backed publisher used in production.
pub struct CacheCatalogPublisher {
    cache: CacheStore,
}

impl CacheCatalogPublisher {
    pub fn new(cache: CacheStore) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl CatalogPublisher for CacheCatalogPublisher {
    async fn current_version(&self) -> Result<Option<u64>, CacheError> {
        let raw = self.cache.get_string(CURRENT_VERSION_KEY).await?;
        Ok(raw.and_then(|s| s.parse::<u64>().ok()))
    }

    async fn stage(&self, snapshot: &CatalogSnapshot) -> Result<(), CacheError> {
        let v = snapshot.version;
        self.cache
            .set_json(&products_key(v), &snapshot.products, None)
            .await?;
        self.cache
            .set_json(&generators_key(v), &snapshot.generators, None)
            .await?;
        self.cache
            .set_json(&branches_key(v), &snapshot.branches, None)
            .await?;
        let blob = ConfigBlob {
            delivery: snapshot.config.clone(),
            version: v,
            installed_at: snapshot.installed_at,
        };
        self.cache.set_json(&config_key(v), &blob, None).await?;
        Ok(())
    }

    async fn commit(&self, version: u64) -> Result<(), CacheError> {
        self.cache
            .set_string(CURRENT_VERSION_KEY, &version.to_string())
            .await
    }
}

// ==================== READER ====================

/// Read side of the snapshot swap. Dereferences the cross-process pointer
/// once per request; the snapshot object behind it is immutable, so
/// concurrent quotes that observe the same version share one `Arc`.
pub struct CatalogReader {
    cache: CacheStore,
    latest: ArcSwapOption<CatalogSnapshot>,
}

impl CatalogReader {
    pub fn new(cache: CacheStore) -> Self {
        Self {
            cache,
            latest: ArcSwapOption::empty(),
        }
    }

    /// Current snapshot, or `None` when no catalog has been installed yet.
    pub async fn current(&self) -> Result<Option<Arc<CatalogSnapshot>>, CacheError> {
        let pointer = match self.cache.get_string(CURRENT_VERSION_KEY).await? {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| CacheError::Codec(format!("{}: {}", CURRENT_VERSION_KEY, e)))?,
            None => return Ok(None),
        };

        if let Some(cached) = self.latest.load_full() {
            if cached.version == pointer {
                return Ok(Some(cached));
            }
        }

        let snapshot = Arc::new(self.load_version(pointer).await?);
        debug!("📖 Catalog v{} loaded into process cache", pointer);
        self.latest.store(Some(snapshot.clone()));
        Ok(Some(snapshot))
    }

    async fn load_version(&self, version: u64) -> Result<CatalogSnapshot, CacheError> {
        let products: IndexMap<String, ProductRule> = self
            .cache
            .get_json(&products_key(version))
            .await?
            .ok_or_else(|| CacheError::NotFound(products_key(version)))?;
        let generators: IndexMap<String, GeneratorRule> = self
            .cache
            .get_json(&generators_key(version))
            .await?
            .ok_or_else(|| CacheError::NotFound(generators_key(version)))?;
        let branches: Vec<Branch> = self
            .cache
            .get_json(&branches_key(version))
            .await?
            .ok_or_else(|| CacheError::NotFound(branches_key(version)))?;
        let blob: ConfigBlob = self
            .cache
            .get_json(&config_key(version))
            .await?
            .ok_or_else(|| CacheError::NotFound(config_key(version)))?;

        Ok(CatalogSnapshot {
            products,
            generators,
            branches,
            config: blob.delivery,
            version: blob.version,
            installed_at: blob.installed_at,
        })
    }
}
