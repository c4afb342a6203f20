// Quote Builder - synchronous pricing pipeline
//
// build() runs the eight phases: validate, snapshot read, distance,
// seasonal factor, duration tier, line items, totals, result. The math
// from phase 4 on is a pure function over (request, snapshot, distance)
// so pricing is testable without the cache or the maps provider.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use log::debug;

use crate::cache_store::CacheError;
use crate::catalog::{CatalogReader, CatalogSnapshot};
use crate::distance_resolver::{
    DistanceError, DistanceRecord, DistanceResolver, ResolutionMethod,
};
use crate::latency_recorder::RecorderHandle;
use crate::quoting_math::{round_intermediate, round_money};
use crate::settings::Quote as QuoteSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    Event,
    Commercial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraItem {
    pub id: String,
    pub qty: u32,
}

/// Inbound quote request. Unknown fields are rejected outright; payloads
/// are explicit schemas, not duck-typed bags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuoteRequest {
    pub delivery_location: String,
    pub trailer_type_id: String,
    pub rental_start_date: NaiveDate,
    pub rental_days: u32,
    pub usage_type: UsageType,
    #[serde(default)]
    pub extras: Vec<ExtraItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub label: String,
    pub unit_price: Decimal,
    pub qty: u32,
    pub subtotal: Decimal,
    pub rule_applied: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryQuote {
    pub miles: Decimal,
    pub tier: String,
    pub per_mile: Decimal,
    pub base: Decimal,
    pub subtotal: Decimal,
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalInfo {
    pub multiplier: Decimal,
    pub window_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Decimal,
    pub grand_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResult {
    pub request_echo: QuoteRequest,
    pub line_items: Vec<LineItem>,
    pub delivery: DeliveryQuote,
    pub seasonal: SeasonalInfo,
    pub totals: Totals,
    pub catalog_version: u64,
    pub computed_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub notes: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    #[error("invalid request: {field}: {message}")]
    InvalidRequest {
        field: &'static str,
        message: String,
    },
    #[error("no branch can deliver to this address")]
    Undeliverable,
    #[error("pricing catalog not installed yet")]
    CatalogUnavailable,
    #[error("distance provider unavailable and no cached record")]
    FallbackUnavailable,
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("internal quoting error: {0}")]
    Internal(String),
}

impl From<CacheError> for QuoteError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Codec(detail) => QuoteError::Internal(detail),
            other => QuoteError::CacheUnavailable(other.to_string()),
        }
    }
}

/// Distance phase output: the nearest branch and how we learned it.
#[derive(Debug, Clone)]
pub struct ResolvedDistance {
    pub branch_id: String,
    pub record: DistanceRecord,
}

pub struct QuoteEngine {
    catalog: Arc<CatalogReader>,
    resolver: Arc<DistanceResolver>,
    recorder: RecorderHandle,
    local_threshold: Decimal,
}

impl QuoteEngine {
    pub fn new(
        catalog: Arc<CatalogReader>,
        resolver: Arc<DistanceResolver>,
        recorder: RecorderHandle,
        settings: &QuoteSettings,
    ) -> Self {
        use rust_decimal::prelude::FromPrimitive;
        Self {
            catalog,
            resolver,
            recorder,
            local_threshold: Decimal::from_f64(settings.local_distance_threshold_miles)
                .unwrap_or_else(|| Decimal::from(180)),
        }
    }

    pub fn recorder(&self) -> &RecorderHandle {
        &self.recorder
    }

    pub async fn build(&self, req: QuoteRequest) -> Result<QuoteResult, QuoteError> {
        let started = Instant::now();

        // Phase 1 - scalar validation.
        validate_request(&req)?;

        // Phase 2 - one consistent snapshot for the rest of the computation.
        let snapshot = self
            .catalog
            .current()
            .await?
            .ok_or(QuoteError::CatalogUnavailable)?;

        // Catalog-dependent validation.
        validate_against_catalog(&req, snapshot.as_ref())?;

        // Phase 3 - distance to the nearest branch.
        let (distance, notes) = self
            .resolve_distance(&req.delivery_location, snapshot.as_ref())
            .await?;

        // Phases 4-8 - pure pricing.
        let mut result = price_snapshot_quote(
            &req,
            snapshot.as_ref(),
            &distance,
            notes,
            self.local_threshold,
            Utc::now(),
        )?;
        result.latency_ms = started.elapsed().as_millis() as u64;
        debug!(
            "💰 Quote built: {} for {} days -> ${} (catalog v{}, {} ms)",
            req.trailer_type_id,
            req.rental_days,
            result.totals.grand_total,
            result.catalog_version,
            result.latency_ms
        );
        Ok(result)
    }

    /// Nearest-branch selection: prefer branches whose distance is already
    /// cached; otherwise resolve against every branch in parallel, each
    /// bounded by the maps timeout.
    async fn resolve_distance(
        &self,
        delivery_location: &str,
        snapshot: &CatalogSnapshot,
    ) -> Result<(ResolvedDistance, Vec<String>), QuoteError> {
        let mut notes = Vec::new();

        // Cached-only pass first: zero upstream calls when warm.
        let mut cached_best: Option<ResolvedDistance> = None;
        for branch in &snapshot.branches {
            if let Some(mut record) = self
                .resolver
                .peek_cached(delivery_location, &branch.address)
                .await?
            {
                record.method = ResolutionMethod::Cached;
                let closer = cached_best
                    .as_ref()
                    .map(|best| record.miles < best.record.miles)
                    .unwrap_or(true);
                if closer {
                    cached_best = Some(ResolvedDistance {
                        branch_id: branch.id.clone(),
                        record,
                    });
                }
            }
        }
        if let Some(best) = cached_best {
            return Ok((best, notes));
        }

        // Cold path: fan out per branch.
        let lookups = snapshot.branches.iter().map(|branch| {
            let resolver = Arc::clone(&self.resolver);
            async move {
                let result = resolver.resolve(delivery_location, &branch.address).await;
                (branch.id.clone(), result)
            }
        });
        let results = futures::future::join_all(lookups).await;

        let mut best: Option<ResolvedDistance> = None;
        let mut geocoding_failures = 0usize;
        let mut upstream_failures = 0usize;

        for (branch_id, result) in results {
            match result {
                Ok(record) => {
                    let closer = best
                        .as_ref()
                        .map(|b| record.miles < b.record.miles)
                        .unwrap_or(true);
                    if closer {
                        best = Some(ResolvedDistance { branch_id, record });
                    }
                }
                Err(DistanceError::GeocodingFailed(_)) => geocoding_failures += 1,
                Err(e) => {
                    // One unreachable branch is a soft note as long as any
                    // other branch resolves.
                    notes.push(format!("branch '{}' unreachable", branch_id));
                    debug!("💰 Branch '{}' distance failed: {}", branch_id, e);
                    upstream_failures += 1;
                }
            }
        }

        match best {
            Some(resolved) => {
                if resolved.record.method == ResolutionMethod::FallbackGeocoded {
                    notes.push("fallback distance used".to_string());
                }
                Ok((resolved, notes))
            }
            None if upstream_failures > 0 && geocoding_failures == 0 => {
                Err(QuoteError::FallbackUnavailable)
            }
            None => Err(QuoteError::Undeliverable),
        }
    }
}

fn validate_request(req: &QuoteRequest) -> Result<(), QuoteError> {
    if req.delivery_location.trim().is_empty() {
        return Err(QuoteError::InvalidRequest {
            field: "delivery_location",
            message: "must not be empty".into(),
        });
    }
    if req.trailer_type_id.trim().is_empty() {
        return Err(QuoteError::InvalidRequest {
            field: "trailer_type_id",
            message: "must not be empty".into(),
        });
    }
    if req.rental_days < 1 {
        return Err(QuoteError::InvalidRequest {
            field: "rental_days",
            message: "must be at least 1".into(),
        });
    }
    for extra in &req.extras {
        if extra.qty < 1 {
            return Err(QuoteError::InvalidRequest {
                field: "extras",
                message: format!("extra '{}' has qty 0", extra.id),
            });
        }
    }
    Ok(())
}

fn validate_against_catalog(
    req: &QuoteRequest,
    snapshot: &CatalogSnapshot,
) -> Result<(), QuoteError> {
    let trailer_id = req.trailer_type_id.trim().to_lowercase();
    if !snapshot.products.contains_key(&trailer_id) {
        return Err(QuoteError::InvalidRequest {
            field: "trailer_type_id",
            message: format!("unknown product '{}'", req.trailer_type_id),
        });
    }
    for extra in &req.extras {
        let extra_id = extra.id.trim().to_lowercase();
        if !snapshot.products.contains_key(&extra_id)
            && !snapshot.generators.contains_key(&extra_id)
        {
            return Err(QuoteError::InvalidRequest {
                field: "extras",
                message: format!("unknown extra '{}'", extra.id),
            });
        }
    }
    Ok(())
}

/// Phases 4-8: seasonal factor, duration tier, line items, delivery,
/// totals. Pure over its inputs; `latency_ms` is stamped by the caller.
pub fn price_snapshot_quote(
    req: &QuoteRequest,
    snapshot: &CatalogSnapshot,
    distance: &ResolvedDistance,
    mut notes: Vec<String>,
    local_threshold: Decimal,
    computed_at: DateTime<Utc>,
) -> Result<QuoteResult, QuoteError> {
    // Phase 4 - seasonal factor for the rental start date.
    let (seasonal_factor, window_label) = snapshot.seasonal_factor(req.rental_start_date);

    // Phase 5 - duration tier and per-day rate.
    let trailer_id = req.trailer_type_id.trim().to_lowercase();
    let product = snapshot
        .products
        .get(&trailer_id)
        .ok_or_else(|| QuoteError::InvalidRequest {
            field: "trailer_type_id",
            message: format!("unknown product '{}'", req.trailer_type_id),
        })?;
    let tier = product
        .select_duration_tier(req.rental_days)
        .ok_or_else(|| QuoteError::InvalidRequest {
            field: "rental_days",
            message: format!(
                "no duration tier covers {} days for '{}'",
                req.rental_days, trailer_id
            ),
        })?;
    let event_usage = req.usage_type == UsageType::Event;
    let (daily_rate, rate_rule) = tier.daily_rate(req.rental_days, event_usage);

    // Phase 6 - line items.
    let mut line_items = Vec::with_capacity(1 + req.extras.len());

    let trailer_factor = if product.seasonal_exempt {
        Decimal::ONE
    } else {
        seasonal_factor
    };
    line_items.push(line_item(
        product.id.clone(),
        daily_rate,
        req.rental_days,
        trailer_factor,
        rate_rule.to_string(),
    ));

    for extra in &req.extras {
        let extra_id = extra.id.trim().to_lowercase();
        let (unit_price, rule, exempt) = if let Some(generator) =
            snapshot.generators.get(&extra_id)
        {
            let (rate, rule) = generator.flat_rate(req.rental_days);
            (rate, rule, generator.seasonal_exempt)
        } else if let Some(extra_product) = snapshot.products.get(&extra_id) {
            let extra_tier = extra_product
                .select_duration_tier(req.rental_days)
                .ok_or_else(|| QuoteError::InvalidRequest {
                    field: "extras",
                    message: format!(
                        "no duration tier covers {} days for extra '{}'",
                        req.rental_days, extra_id
                    ),
                })?;
            let (rate, rule) = extra_tier.daily_rate(req.rental_days, event_usage);
            (rate, rule, extra_product.seasonal_exempt)
        } else {
            return Err(QuoteError::InvalidRequest {
                field: "extras",
                message: format!("unknown extra '{}'", extra.id),
            });
        };

        let factor = if exempt { Decimal::ONE } else { seasonal_factor };
        let rule_applied = if exempt {
            format!("{} (seasonal_exempt)", rule)
        } else {
            rule.to_string()
        };
        line_items.push(line_item(
            extra_id,
            unit_price,
            extra.qty,
            factor,
            rule_applied,
        ));
    }

    // Delivery: tier by miles, never scaled by the seasonal factor.
    let miles = distance.record.miles;
    let (tier_name, base, per_mile) =
        snapshot
            .delivery_tier(miles)
            .ok_or_else(|| QuoteError::Internal(format!(
                "no delivery tier covers {} miles",
                miles
            )))?;
    let delivery_subtotal = round_money(round_intermediate(base + miles * per_mile));
    let delivery = DeliveryQuote {
        miles,
        tier: tier_name,
        per_mile,
        base,
        subtotal: delivery_subtotal,
        local: miles < local_threshold,
    };

    // Phase 7 - totals.
    let items_subtotal = round_money(
        line_items
            .iter()
            .fold(Decimal::ZERO, |acc, item| acc + item.subtotal),
    );
    let grand_total = round_money(items_subtotal + delivery.subtotal);

    // Phase 8 - assemble.
    notes.dedup();
    Ok(QuoteResult {
        request_echo: req.clone(),
        line_items,
        delivery,
        seasonal: SeasonalInfo {
            multiplier: seasonal_factor,
            window_label,
        },
        totals: Totals {
            subtotal: items_subtotal,
            grand_total,
        },
        catalog_version: snapshot.version,
        computed_at,
        latency_ms: 0,
        notes,
    })
}

fn line_item(
    label: String,
    unit_price: Decimal,
    qty: u32,
    factor: Decimal,
    rule_applied: String,
) -> LineItem {
    let raw = unit_price * Decimal::from(qty) * factor;
    LineItem {
        label,
        unit_price,
        qty,
        subtotal: round_money(round_intermediate(raw)),
        rule_applied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        Branch, DeliveryConfig, DistanceTier, DurationTier, GeneratorRule, ProductCategory,
        ProductRule, SeasonalWindow,
    };
    use crate::quoting_math::MonthDay;
    use indexmap::IndexMap;
    use std::collections::BTreeSet;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn snapshot() -> CatalogSnapshot {
        let mut products = IndexMap::new();
        products.insert(
            "3stall_combo".to_string(),
            ProductRule {
                id: "3stall_combo".to_string(),
                category: ProductCategory::ComboTrailer,
                seasonal_exempt: false,
                rates_by_duration: vec![DurationTier {
                    min_days: 1,
                    max_days: 3650,
                    event_rate: dec("1200"),
                    rate_28_day: dec("950"),
                    rate_2_5_month: dec("800"),
                    rate_6_plus_month: dec("650"),
                    features_included: BTreeSet::new(),
                }],
            },
        );
        products.insert(
            "handwash_station".to_string(),
            ProductRule {
                id: "handwash_station".to_string(),
                category: ProductCategory::PortableToilet,
                seasonal_exempt: false,
                rates_by_duration: vec![DurationTier {
                    min_days: 1,
                    max_days: 3650,
                    event_rate: dec("75"),
                    rate_28_day: dec("60"),
                    rate_2_5_month: dec("50"),
                    rate_6_plus_month: dec("40"),
                    features_included: BTreeSet::new(),
                }],
            },
        );

        let mut generators = IndexMap::new();
        generators.insert(
            "gen_20kw".to_string(),
            GeneratorRule {
                id: "gen_20kw".to_string(),
                kw: dec("20"),
                event_rate: dec("250"),
                rate_7_day: dec("600"),
                rate_28_day: dec("1500"),
                seasonal_exempt: true,
            },
        );

        CatalogSnapshot {
            products,
            generators,
            branches: vec![Branch {
                id: "omaha".into(),
                label: "Omaha".into(),
                address: "3035 Whitmore Street, Omaha, NE".into(),
                normalized_address: "3035 whitmore street, omaha, ne".into(),
            }],
            config: DeliveryConfig {
                per_mile_rates: IndexMap::from([
                    ("tier_0".to_string(), dec("0")),
                    ("tier_3".to_string(), dec("2.50")),
                ]),
                base_fee_by_tier: IndexMap::from([
                    ("tier_0".to_string(), dec("150")),
                    ("tier_3".to_string(), dec("500")),
                ]),
                seasonal_multipliers: vec![SeasonalWindow {
                    start_month_day: MonthDay::parse("06-01").unwrap(),
                    end_month_day: MonthDay::parse("08-31").unwrap(),
                    factor: dec("1.15"),
                }],
                distance_tiers: vec![
                    DistanceTier {
                        tier_name: "tier_0".into(),
                        upper_bound_miles: Some(dec("25")),
                    },
                    DistanceTier {
                        tier_name: "tier_3".into(),
                        upper_bound_miles: None,
                    },
                ],
            },
            version: 3,
            installed_at: Utc::now(),
        }
    }

    fn request() -> QuoteRequest {
        QuoteRequest {
            delivery_location: "3035 Whitmore Street, Omaha, NE".into(),
            trailer_type_id: "3stall_combo".into(),
            rental_start_date: NaiveDate::from_ymd_opt(2025, 7, 4).unwrap(),
            rental_days: 3,
            usage_type: UsageType::Event,
            extras: vec![],
        }
    }

    fn distance(miles: &str, method: ResolutionMethod) -> ResolvedDistance {
        ResolvedDistance {
            branch_id: "omaha".into(),
            record: DistanceRecord {
                miles: dec(miles),
                seconds: 0,
                provider: "test".into(),
                resolved_at: Utc::now(),
                method,
            },
        }
    }

    fn price(
        req: &QuoteRequest,
        snap: &CatalogSnapshot,
        dist: &ResolvedDistance,
        notes: Vec<String>,
    ) -> QuoteResult {
        price_snapshot_quote(req, snap, dist, notes, dec("180"), Utc::now()).unwrap()
    }

    #[test]
    fn test_event_peak_season_in_area() {
        // Event rate, 1.15 seasonal window, zero miles: the S1 scenario.
        let result = price(
            &request(),
            &snapshot(),
            &distance("0.0", ResolutionMethod::Cached),
            vec![],
        );

        assert_eq!(result.line_items.len(), 1);
        let trailer = &result.line_items[0];
        assert_eq!(trailer.unit_price, dec("1200"));
        assert_eq!(trailer.qty, 3);
        assert_eq!(trailer.subtotal, dec("4140.00"));
        assert_eq!(trailer.rule_applied, "event_rate");

        assert_eq!(result.delivery.tier, "tier_0");
        assert_eq!(result.delivery.subtotal, dec("150.00"));
        assert!(result.delivery.local);

        assert_eq!(result.totals.subtotal, dec("4140.00"));
        assert_eq!(result.totals.grand_total, dec("4290.00"));
        assert_eq!(result.seasonal.multiplier, dec("1.15"));
        assert!(result.catalog_version >= 1);
        assert!(result.notes.is_empty());
    }

    #[test]
    fn test_long_term_commercial_fallback_distance() {
        // 120-day commercial rental, 312 fallback miles: the S2 scenario.
        let mut req = request();
        req.delivery_location = "Aspen, CO".into();
        req.rental_days = 120;
        req.usage_type = UsageType::Commercial;

        let result = price(
            &req,
            &snapshot(),
            &distance("312.0", ResolutionMethod::FallbackGeocoded),
            vec!["fallback distance used".to_string()],
        );

        let trailer = &result.line_items[0];
        assert_eq!(trailer.rule_applied, "rate_6_plus_month");
        assert_eq!(trailer.unit_price, dec("650"));

        assert_eq!(result.delivery.tier, "tier_3");
        // 500 + 312 * 2.50
        assert_eq!(result.delivery.subtotal, dec("1280.00"));
        assert!(!result.delivery.local);
        assert!(result.notes.iter().any(|n| n == "fallback distance used"));
    }

    #[test]
    fn test_grand_total_is_sum_of_parts() {
        let mut req = request();
        req.extras = vec![
            ExtraItem {
                id: "gen_20kw".into(),
                qty: 1,
            },
            ExtraItem {
                id: "handwash_station".into(),
                qty: 2,
            },
        ];
        let result = price(
            &req,
            &snapshot(),
            &distance("40.0", ResolutionMethod::Direct),
            vec![],
        );

        let items: Decimal = result
            .line_items
            .iter()
            .fold(Decimal::ZERO, |acc, i| acc + i.subtotal);
        assert_eq!(
            result.totals.grand_total,
            round_money(items + result.delivery.subtotal)
        );
    }

    #[test]
    fn test_seasonal_exempt_extra_skips_multiplier() {
        let mut req = request();
        req.extras = vec![
            ExtraItem {
                id: "gen_20kw".into(),
                qty: 1,
            },
            ExtraItem {
                id: "handwash_station".into(),
                qty: 1,
            },
        ];
        let result = price(
            &req,
            &snapshot(),
            &distance("0.0", ResolutionMethod::Cached),
            vec![],
        );

        // Generator is exempt: flat event rate, no 1.15.
        let generator = &result.line_items[1];
        assert_eq!(generator.subtotal, dec("250.00"));
        assert!(generator.rule_applied.contains("seasonal_exempt"));

        // Handwash station scales: 75 * 1 * 1.15.
        let handwash = &result.line_items[2];
        assert_eq!(handwash.subtotal, dec("86.25"));
    }

    #[test]
    fn test_extra_quantities_multiply() {
        let mut req = request();
        req.rental_start_date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(); // off-season
        req.extras = vec![ExtraItem {
            id: "handwash_station".into(),
            qty: 4,
        }];
        let result = price(
            &req,
            &snapshot(),
            &distance("0.0", ResolutionMethod::Cached),
            vec![],
        );
        assert_eq!(result.line_items[1].subtotal, dec("300.00"));
        assert_eq!(result.seasonal.multiplier, Decimal::ONE);
    }

    #[test]
    fn test_delivery_never_scaled_by_season() {
        // Peak season, long haul: delivery stays base + miles * rate.
        let result = price(
            &request(),
            &snapshot(),
            &distance("200.0", ResolutionMethod::Direct),
            vec![],
        );
        assert_eq!(result.delivery.subtotal, dec("1000.00"));
    }

    #[test]
    fn test_delivery_tier_upper_bound_inclusive() {
        let at_bound = price(
            &request(),
            &snapshot(),
            &distance("25.0", ResolutionMethod::Cached),
            vec![],
        );
        assert_eq!(at_bound.delivery.tier, "tier_0");

        let over_bound = price(
            &request(),
            &snapshot(),
            &distance("25.1", ResolutionMethod::Cached),
            vec![],
        );
        assert_eq!(over_bound.delivery.tier, "tier_3");
    }

    #[test]
    fn test_commercial_short_rental_skips_event_rate() {
        let mut req = request();
        req.usage_type = UsageType::Commercial;
        let result = price(
            &req,
            &snapshot(),
            &distance("0.0", ResolutionMethod::Cached),
            vec![],
        );
        assert_eq!(result.line_items[0].rule_applied, "rate_28_day");
        assert_eq!(result.line_items[0].unit_price, dec("950"));
    }

    #[test]
    fn test_validate_rejects_bad_scalars() {
        let mut req = request();
        req.rental_days = 0;
        let err = validate_request(&req).unwrap_err();
        assert!(matches!(
            err,
            QuoteError::InvalidRequest {
                field: "rental_days",
                ..
            }
        ));

        let mut req = request();
        req.delivery_location = "   ".into();
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_validate_against_catalog_unknown_ids() {
        let snap = snapshot();

        let mut req = request();
        req.trailer_type_id = "no_such_trailer".into();
        assert!(validate_against_catalog(&req, &snap).is_err());

        let mut req = request();
        req.extras = vec![ExtraItem {
            id: "no_such_extra".into(),
            qty: 1,
        }];
        assert!(validate_against_catalog(&req, &snap).is_err());

        // Trailer id resolution is case-insensitive.
        let mut req = request();
        req.trailer_type_id = "3Stall_Combo".into();
        assert!(validate_against_catalog(&req, &snap).is_ok());
    }

    #[test]
    fn test_request_rejects_unknown_fields() {
        let raw = r#"{
            "delivery_location": "Omaha, NE",
            "trailer_type_id": "3stall_combo",
            "rental_start_date": "2025-07-04",
            "rental_days": 3,
            "usage_type": "event",
            "surprise_field": true
        }"#;
        assert!(serde_json::from_str::<QuoteRequest>(raw).is_err());
    }

    #[test]
    fn test_catalog_version_and_echo_stamped() {
        let result = price(
            &request(),
            &snapshot(),
            &distance("0.0", ResolutionMethod::Cached),
            vec![],
        );
        assert_eq!(result.catalog_version, 3);
        assert_eq!(result.request_echo, request());
    }
}
