//! Integration tests for the quote pricing pipeline
//!
//! Tests cover:
//! - The two reference scenarios (peak-season event, long-term commercial
//!   with fallback distance)
//! - Duration tier and delivery tier boundary selection
//! - Seasonal window endpoints and exemptions
//! - Rounding and totals invariants
//!
//! Note: these run the pure pricing core; no cache or maps provider needed.

use chrono::{NaiveDate, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::str::FromStr;

use rental_quoting_sdk::catalog::{
    Branch, CatalogSnapshot, DeliveryConfig, DistanceTier, DurationTier, GeneratorRule,
    ProductCategory, ProductRule, SeasonalWindow,
};
use rental_quoting_sdk::distance_resolver::{DistanceRecord, ResolutionMethod};
use rental_quoting_sdk::quote_builder::{
    price_snapshot_quote, ExtraItem, QuoteRequest, QuoteResult, ResolvedDistance, UsageType,
};
use rental_quoting_sdk::quoting_math::{round_money, MonthDay};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn duration_tier(min: u32, max: u32, rates: [&str; 4]) -> DurationTier {
    DurationTier {
        min_days: min,
        max_days: max,
        event_rate: dec(rates[0]),
        rate_28_day: dec(rates[1]),
        rate_2_5_month: dec(rates[2]),
        rate_6_plus_month: dec(rates[3]),
        features_included: BTreeSet::new(),
    }
}

/// A catalog matching the reference scenarios: one Omaha branch, a
/// 3-stall combo trailer, a seasonal summer window and two delivery tiers.
fn reference_catalog() -> CatalogSnapshot {
    let mut products = IndexMap::new();
    products.insert(
        "3stall_combo".to_string(),
        ProductRule {
            id: "3stall_combo".to_string(),
            category: ProductCategory::ComboTrailer,
            seasonal_exempt: false,
            rates_by_duration: vec![
                duration_tier(1, 28, ["1200", "950", "800", "650"]),
                duration_tier(29, 3650, ["1200", "950", "800", "650"]),
            ],
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
        version: 1,
        installed_at: Utc::now(),
    }
}

fn resolved(miles: &str, method: ResolutionMethod) -> ResolvedDistance {
    ResolvedDistance {
        branch_id: "omaha".into(),
        record: DistanceRecord {
            miles: dec(miles),
            seconds: 1800,
            provider: "test".into(),
            resolved_at: Utc::now(),
            method,
        },
    }
}

fn price(req: &QuoteRequest, miles: &str, method: ResolutionMethod, notes: Vec<String>) -> QuoteResult {
    price_snapshot_quote(
        req,
        &reference_catalog(),
        &resolved(miles, method),
        notes,
        dec("180"),
        Utc::now(),
    )
    .unwrap()
}

fn event_request(days: u32) -> QuoteRequest {
    QuoteRequest {
        delivery_location: "3035 Whitmore Street, Omaha, NE".into(),
        trailer_type_id: "3stall_combo".into(),
        rental_start_date: NaiveDate::from_ymd_opt(2025, 7, 4).unwrap(),
        rental_days: days,
        usage_type: UsageType::Event,
        extras: vec![],
    }
}

/// Scenario: 3-day event over July 4th, branch at the delivery address.
#[test]
fn test_peak_season_event_in_area() {
    let result = price(&event_request(3), "0.0", ResolutionMethod::Cached, vec![]);

    // 1200 * 3 * 1.15
    assert_eq!(result.line_items[0].subtotal, dec("4140.00"));
    assert_eq!(result.delivery.subtotal, dec("150.00"));
    assert_eq!(result.totals.grand_total, dec("4290.00"));
    assert!(result.catalog_version >= 1);
    assert!(result.notes.is_empty());
    assert_eq!(result.seasonal.window_label.as_deref(), Some("06-01..08-31"));
}

/// Scenario: 120-day commercial rental, not routable, 312 fallback miles.
#[test]
fn test_long_term_commercial_out_of_area() {
    let mut req = event_request(120);
    req.delivery_location = "Aspen, CO".into();
    req.usage_type = UsageType::Commercial;

    let result = price(
        &req,
        "312.0",
        ResolutionMethod::FallbackGeocoded,
        vec!["fallback distance used".to_string()],
    );

    assert_eq!(result.line_items[0].rule_applied, "rate_6_plus_month");
    // 500 + 312 * 2.50
    assert_eq!(result.delivery.subtotal, dec("1280.00"));
    assert!(result.notes.iter().any(|n| n == "fallback distance used"));
}

#[test]
fn test_duration_tier_boundaries() {
    // rental_days = 1, = tier.max_days, = tier.max_days + 1
    for (days, expected_tier_max) in [(1u32, 28u32), (28, 28), (29, 3650)] {
        let catalog = reference_catalog();
        let tier = catalog.products["3stall_combo"]
            .select_duration_tier(days)
            .unwrap();
        assert_eq!(tier.max_days, expected_tier_max, "days={days}");
    }
}

#[test]
fn test_delivery_tier_boundaries() {
    for (miles, expected_tier) in [("0", "tier_0"), ("25", "tier_0"), ("25.1", "tier_3")] {
        let result = price(&event_request(3), miles, ResolutionMethod::Cached, vec![]);
        assert_eq!(result.delivery.tier, expected_tier, "miles={miles}");
    }
}

#[test]
fn test_seasonal_window_endpoints_apply_factor() {
    for date in ["2025-06-01", "2025-08-31"] {
        let mut req = event_request(3);
        req.rental_start_date = NaiveDate::from_str(date).unwrap();
        let result = price(&req, "0.0", ResolutionMethod::Cached, vec![]);
        assert_eq!(result.seasonal.multiplier, dec("1.15"), "date={date}");
    }

    let mut req = event_request(3);
    req.rental_start_date = NaiveDate::from_str("2025-09-01").unwrap();
    let result = price(&req, "0.0", ResolutionMethod::Cached, vec![]);
    assert_eq!(result.seasonal.multiplier, Decimal::ONE);
}

#[test]
fn test_empty_extras_quote_succeeds() {
    let result = price(&event_request(3), "10.0", ResolutionMethod::Direct, vec![]);
    assert_eq!(result.line_items.len(), 1);
    assert!(result.totals.grand_total > Decimal::ZERO);
}

#[test]
fn test_seasonal_exempt_generator_extra() {
    let mut req = event_request(3);
    req.extras = vec![ExtraItem {
        id: "gen_20kw".into(),
        qty: 2,
    }];
    let result = price(&req, "0.0", ResolutionMethod::Cached, vec![]);

    // Exempt: 250 * 2, no 1.15 factor even in peak season.
    assert_eq!(result.line_items[1].subtotal, dec("500.00"));
}

#[test]
fn test_totals_invariant_holds_across_requests() {
    // grand_total == round2(delivery + sum(line items)) for a spread of
    // shapes: different days, extras, seasons, distances.
    let cases: Vec<(u32, &str, &str, UsageType)> = vec![
        (1, "2025-07-04", "0.0", UsageType::Event),
        (7, "2025-01-15", "42.7", UsageType::Event),
        (28, "2025-06-01", "25.0", UsageType::Commercial),
        (75, "2025-08-31", "180.0", UsageType::Commercial),
        (120, "2025-12-31", "312.0", UsageType::Commercial),
    ];

    for (days, date, miles, usage) in cases {
        let mut req = event_request(days);
        req.rental_start_date = NaiveDate::from_str(date).unwrap();
        req.usage_type = usage;
        req.extras = vec![ExtraItem {
            id: "gen_20kw".into(),
            qty: 1,
        }];

        let result = price(&req, miles, ResolutionMethod::Direct, vec![]);
        let items_sum = result
            .line_items
            .iter()
            .fold(Decimal::ZERO, |acc, item| acc + item.subtotal);
        assert_eq!(
            result.totals.grand_total,
            round_money(result.delivery.subtotal + items_sum),
            "days={days} date={date} miles={miles}"
        );
        // Money is always at 2-digit scale.
        assert!(result.totals.grand_total.scale() <= 2);
    }
}

#[test]
fn test_local_tagging_threshold() {
    let local = price(&event_request(3), "179.9", ResolutionMethod::Direct, vec![]);
    assert!(local.delivery.local);

    let not_local = price(&event_request(3), "180.0", ResolutionMethod::Direct, vec![]);
    assert!(!not_local.delivery.local);
}

#[test]
fn test_single_branch_is_always_nearest() {
    let result = price(&event_request(3), "55.0", ResolutionMethod::Direct, vec![]);
    assert_eq!(result.request_echo.trailer_type_id, "3stall_combo");
    // The only branch in the catalog carried the resolution.
    assert_eq!(result.delivery.miles, dec("55.0"));
}
