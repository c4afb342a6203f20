// Sheets Client - pulls the pricing catalog tabs from the spreadsheet provider
//
// The provider contract: a named range returns tabular rows, headers on the
// first row, column order not assumed. Row parsing is all-or-nothing per
// tab; a single bad row rejects the whole sync.

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use log::{debug, warn};
use serde::Deserialize;

use crate::catalog::{
    Branch, DeliveryConfig, DistanceTier, DurationTier, GeneratorRule, ProductCategory,
    ProductRule, SeasonalWindow,
};
use crate::quoting_math::{normalize_address, MonthDay};
use crate::settings::Sheets as SheetsSettings;

#[derive(Debug, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

fn cell_to_string(cell: &serde_json::Value) -> String {
    match cell {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

pub struct SheetsClient {
    client: reqwest::Client,
    base_url: String,
    sheet_id: String,
    api_key: String,
}

impl SheetsClient {
    pub fn new(settings: &SheetsSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.fetch_timeout_s))
            .build()
            .context("Failed to create sheets HTTP client")?;
        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            sheet_id: settings.sheet_id.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    /// Fetch one named range as rows of strings.
    pub async fn fetch_range(&self, range: &str) -> Result<Vec<Vec<String>>> {
        let url = Url::parse_with_params(
            &format!(
                "{}/v4/spreadsheets/{}/values/{}",
                self.base_url, self.sheet_id, range
            ),
            &[("key", self.api_key.as_str())],
        )
        .context("Failed to build sheets URL")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Sheet fetch failed for range '{}'", range))?;

        if !response.status().is_success() {
            bail!(
                "Sheet fetch for range '{}' returned HTTP {}",
                range,
                response.status()
            );
        }

        let body: ValuesResponse = response
            .json()
            .await
            .with_context(|| format!("Sheet range '{}' returned malformed JSON", range))?;

        let rows: Vec<Vec<String>> = body
            .values
            .iter()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect();
        debug!("📥 Fetched {} rows from range '{}'", rows.len(), range);
        Ok(rows)
    }
}

// ==================== ROW PARSING ====================

/// Header-addressed row access. Column order is free; header matching is
/// case- and whitespace-insensitive.
struct HeaderMap {
    index: HashMap<String, usize>,
}

impl HeaderMap {
    fn from_row(header: &[String]) -> Self {
        let index = header
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_lowercase(), i))
            .collect();
        Self { index }
    }

    fn get<'a>(&self, row: &'a [String], column: &str) -> Option<&'a str> {
        let idx = *self.index.get(column)?;
        row.get(idx).map(|s| s.trim()).filter(|s| !s.is_empty())
    }

    fn require<'a>(&self, row: &'a [String], column: &str, row_no: usize) -> Result<&'a str> {
        self.get(row, column)
            .ok_or_else(|| anyhow!("row {}: missing required column '{}'", row_no, column))
    }
}

fn parse_decimal(raw: &str, column: &str, row_no: usize) -> Result<Decimal> {
    // Sheets export dollar amounts with currency noise at times.
    let cleaned = raw.replace(['$', ','], "");
    Decimal::from_str(cleaned.trim())
        .map_err(|e| anyhow!("row {}: column '{}' = '{}': {}", row_no, column, raw, e))
}

fn parse_u32(raw: &str, column: &str, row_no: usize) -> Result<u32> {
    raw.trim()
        .parse::<u32>()
        .map_err(|e| anyhow!("row {}: column '{}' = '{}': {}", row_no, column, raw, e))
}

fn parse_truthy(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|s| s.to_lowercase()).as_deref(),
        Some("true") | Some("yes") | Some("1")
    )
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

fn split_header<'a>(rows: &'a [Vec<String>], tab: &str) -> Result<(HeaderMap, &'a [Vec<String>])> {
    let (header, body) = rows
        .split_first()
        .ok_or_else(|| anyhow!("{} tab is empty (no header row)", tab))?;
    Ok((HeaderMap::from_row(header), body))
}

/// products tab: one row per (product, duration tier). Rows group by id;
/// tiers are sorted by min_days so overlap resolution stays stable.
pub fn parse_products(rows: &[Vec<String>]) -> Result<IndexMap<String, ProductRule>> {
    let (header, body) = split_header(rows, "products")?;
    let mut products: IndexMap<String, ProductRule> = IndexMap::new();

    for (i, row) in body.iter().enumerate() {
        let row_no = i + 2; // 1-based, after the header
        if is_blank(row) {
            continue;
        }

        let id = header.require(row, "id", row_no)?.trim().to_lowercase();
        let category_raw = header.require(row, "category", row_no)?;
        let category = ProductCategory::parse(category_raw)
            .ok_or_else(|| anyhow!("row {}: unknown category '{}'", row_no, category_raw))?;
        let seasonal_exempt = parse_truthy(header.get(row, "seasonal_exempt"));

        let tier = DurationTier {
            min_days: parse_u32(header.require(row, "min_days", row_no)?, "min_days", row_no)?,
            max_days: parse_u32(header.require(row, "max_days", row_no)?, "max_days", row_no)?,
            event_rate: parse_decimal(
                header.require(row, "event_rate", row_no)?,
                "event_rate",
                row_no,
            )?,
            rate_28_day: parse_decimal(
                header.require(row, "rate_28_day", row_no)?,
                "rate_28_day",
                row_no,
            )?,
            rate_2_5_month: parse_decimal(
                header.require(row, "rate_2_5_month", row_no)?,
                "rate_2_5_month",
                row_no,
            )?,
            rate_6_plus_month: parse_decimal(
                header.require(row, "rate_6_plus_month", row_no)?,
                "rate_6_plus_month",
                row_no,
            )?,
            features_included: header
                .get(row, "features_included")
                .map(|s| {
                    s.split(';')
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty())
                        .collect::<BTreeSet<_>>()
                })
                .unwrap_or_default(),
        };

        if tier.min_days > tier.max_days {
            bail!(
                "row {}: duration tier [{}, {}] has min > max",
                row_no,
                tier.min_days,
                tier.max_days
            );
        }

        match products.get_mut(&id) {
            Some(existing) => {
                if existing.category != category {
                    bail!(
                        "row {}: product '{}' declares category '{}' but earlier rows disagree",
                        row_no,
                        id,
                        category_raw
                    );
                }
                existing.rates_by_duration.push(tier);
            }
            None => {
                products.insert(
                    id.clone(),
                    ProductRule {
                        id,
                        category,
                        seasonal_exempt,
                        rates_by_duration: vec![tier],
                    },
                );
            }
        }
    }

    for product in products.values_mut() {
        product
            .rates_by_duration
            .sort_by_key(|tier| (tier.min_days, tier.max_days));
    }

    Ok(products)
}

pub fn parse_generators(rows: &[Vec<String>]) -> Result<IndexMap<String, GeneratorRule>> {
    let (header, body) = split_header(rows, "generators")?;
    let mut generators = IndexMap::new();

    for (i, row) in body.iter().enumerate() {
        let row_no = i + 2;
        if is_blank(row) {
            continue;
        }

        let id = header.require(row, "id", row_no)?.trim().to_lowercase();
        let rule = GeneratorRule {
            id: id.clone(),
            kw: parse_decimal(header.require(row, "kw", row_no)?, "kw", row_no)?,
            event_rate: parse_decimal(
                header.require(row, "event_rate", row_no)?,
                "event_rate",
                row_no,
            )?,
            rate_7_day: parse_decimal(
                header.require(row, "rate_7_day", row_no)?,
                "rate_7_day",
                row_no,
            )?,
            rate_28_day: parse_decimal(
                header.require(row, "rate_28_day", row_no)?,
                "rate_28_day",
                row_no,
            )?,
            seasonal_exempt: parse_truthy(header.get(row, "seasonal_exempt")),
        };

        if generators.insert(id.clone(), rule).is_some() {
            bail!("row {}: duplicate generator id '{}'", row_no, id);
        }
    }

    Ok(generators)
}

pub fn parse_branches(rows: &[Vec<String>]) -> Result<Vec<Branch>> {
    let (header, body) = split_header(rows, "branches")?;
    let mut branches = Vec::new();

    for (i, row) in body.iter().enumerate() {
        let row_no = i + 2;
        if is_blank(row) {
            continue;
        }

        let address = header.require(row, "address", row_no)?.to_string();
        branches.push(Branch {
            id: header.require(row, "id", row_no)?.trim().to_lowercase(),
            label: header.require(row, "label", row_no)?.to_string(),
            normalized_address: normalize_address(&address),
            address,
        });
    }

    Ok(branches)
}

/// config tab: row-typed. `entry_type = distance_tier` rows carry
/// (tier_name, upper_bound_miles?, base_fee, per_mile_rate); empty bound =
/// the unbounded final tier. `entry_type = seasonal` rows carry
/// (start_month_day, end_month_day, factor).
pub fn parse_config(rows: &[Vec<String>]) -> Result<DeliveryConfig> {
    let (header, body) = split_header(rows, "config")?;
    let mut config = DeliveryConfig {
        per_mile_rates: IndexMap::new(),
        base_fee_by_tier: IndexMap::new(),
        seasonal_multipliers: Vec::new(),
        distance_tiers: Vec::new(),
    };

    for (i, row) in body.iter().enumerate() {
        let row_no = i + 2;
        if is_blank(row) {
            continue;
        }

        let entry_type = header.require(row, "entry_type", row_no)?;
        match entry_type {
            "distance_tier" => {
                let tier_name = header.require(row, "tier_name", row_no)?.to_string();
                let upper_bound_miles = header
                    .get(row, "upper_bound_miles")
                    .map(|raw| parse_decimal(raw, "upper_bound_miles", row_no))
                    .transpose()?;
                let base_fee =
                    parse_decimal(header.require(row, "base_fee", row_no)?, "base_fee", row_no)?;
                let per_mile = parse_decimal(
                    header.require(row, "per_mile_rate", row_no)?,
                    "per_mile_rate",
                    row_no,
                )?;

                config.base_fee_by_tier.insert(tier_name.clone(), base_fee);
                config.per_mile_rates.insert(tier_name.clone(), per_mile);
                config.distance_tiers.push(DistanceTier {
                    tier_name,
                    upper_bound_miles,
                });
            }
            "seasonal" => {
                let start_raw = header.require(row, "start_month_day", row_no)?;
                let end_raw = header.require(row, "end_month_day", row_no)?;
                let window = SeasonalWindow {
                    start_month_day: MonthDay::parse(start_raw).ok_or_else(|| {
                        anyhow!("row {}: bad start_month_day '{}'", row_no, start_raw)
                    })?,
                    end_month_day: MonthDay::parse(end_raw)
                        .ok_or_else(|| anyhow!("row {}: bad end_month_day '{}'", row_no, end_raw))?,
                    factor: parse_decimal(
                        header.require(row, "factor", row_no)?,
                        "factor",
                        row_no,
                    )?,
                };
                config.seasonal_multipliers.push(window);
            }
            other => {
                warn!("⚠️ config row {}: unknown entry_type '{}', skipped", row_no, other);
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_parse_products_header_order_free() {
        // Same data, two different column orders.
        let a = rows(&[
            &["id", "category", "min_days", "max_days", "event_rate", "rate_28_day", "rate_2_5_month", "rate_6_plus_month"],
            &["3stall_combo", "combo_trailer", "1", "28", "1200", "900", "700", "500"],
        ]);
        let b = rows(&[
            &["event_rate", "max_days", "id", "min_days", "rate_6_plus_month", "rate_2_5_month", "rate_28_day", "category"],
            &["1200", "28", "3stall_combo", "1", "500", "700", "900", "combo_trailer"],
        ]);

        let pa = parse_products(&a).unwrap();
        let pb = parse_products(&b).unwrap();
        assert_eq!(pa, pb);
        assert_eq!(pa["3stall_combo"].rates_by_duration[0].max_days, 28);
    }

    #[test]
    fn test_parse_products_groups_tiers_and_sorts() {
        let data = rows(&[
            &["id", "category", "min_days", "max_days", "event_rate", "rate_28_day", "rate_2_5_month", "rate_6_plus_month"],
            &["2stall", "restroom_trailer", "29", "3650", "1000", "800", "600", "400"],
            &["2stall", "restroom_trailer", "1", "28", "1000", "850", "650", "450"],
        ]);
        let products = parse_products(&data).unwrap();
        let tiers = &products["2stall"].rates_by_duration;
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0].min_days, 1);
        assert_eq!(tiers[1].min_days, 29);
    }

    #[test]
    fn test_parse_products_lowercases_ids_and_cleans_money() {
        let data = rows(&[
            &["id", "category", "min_days", "max_days", "event_rate", "rate_28_day", "rate_2_5_month", "rate_6_plus_month", "seasonal_exempt"],
            &["  3Stall_Combo ", "combo_trailer", "1", "28", "$1,200.00", "900", "700", "500", "yes"],
        ]);
        let products = parse_products(&data).unwrap();
        let product = &products["3stall_combo"];
        assert!(product.seasonal_exempt);
        assert_eq!(
            product.rates_by_duration[0].event_rate,
            Decimal::from_str("1200.00").unwrap()
        );
    }

    #[test]
    fn test_parse_products_rejects_whole_tab_on_bad_row() {
        let data = rows(&[
            &["id", "category", "min_days", "max_days", "event_rate", "rate_28_day", "rate_2_5_month", "rate_6_plus_month"],
            &["good", "combo_trailer", "1", "28", "1200", "900", "700", "500"],
            &["bad", "combo_trailer", "not_a_number", "28", "1200", "900", "700", "500"],
        ]);
        let err = parse_products(&data).unwrap_err().to_string();
        assert!(err.contains("row 3"), "{err}");
    }

    #[test]
    fn test_parse_products_skips_blank_rows() {
        let data = rows(&[
            &["id", "category", "min_days", "max_days", "event_rate", "rate_28_day", "rate_2_5_month", "rate_6_plus_month"],
            &["", "", "", "", "", "", "", ""],
            &["p", "portable_toilet", "1", "28", "100", "80", "60", "40"],
        ]);
        assert_eq!(parse_products(&data).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_branches_normalizes_addresses() {
        let data = rows(&[
            &["id", "label", "address"],
            &["OMAHA", "Omaha", "3035  Whitmore Street, Omaha,  NE"],
        ]);
        let branches = parse_branches(&data).unwrap();
        assert_eq!(branches[0].id, "omaha");
        assert_eq!(
            branches[0].normalized_address,
            "3035 whitmore street, omaha, ne"
        );
        // Raw address preserved for display
        assert!(branches[0].address.contains("Whitmore"));
    }

    #[test]
    fn test_parse_config_assembles_tiers_and_windows() {
        let data = rows(&[
            &["entry_type", "tier_name", "upper_bound_miles", "base_fee", "per_mile_rate", "start_month_day", "end_month_day", "factor"],
            &["distance_tier", "tier_0", "25", "150", "0", "", "", ""],
            &["distance_tier", "tier_3", "", "500", "2.50", "", "", ""],
            &["seasonal", "", "", "", "", "06-01", "08-31", "1.15"],
        ]);
        let config = parse_config(&data).unwrap();
        assert_eq!(config.distance_tiers.len(), 2);
        assert_eq!(config.distance_tiers[1].upper_bound_miles, None);
        assert_eq!(
            config.base_fee_by_tier["tier_3"],
            Decimal::from_str("500").unwrap()
        );
        assert_eq!(config.seasonal_multipliers.len(), 1);
        assert_eq!(
            config.seasonal_multipliers[0].factor,
            Decimal::from_str("1.15").unwrap()
        );
    }

    #[test]
    fn test_parse_generators() {
        let data = rows(&[
            &["id", "kw", "event_rate", "rate_7_day", "rate_28_day", "seasonal_exempt"],
            &["gen_20kw", "20", "250", "600", "1500", "true"],
        ]);
        let generators = parse_generators(&data).unwrap();
        assert!(generators["gen_20kw"].seasonal_exempt);
    }

    #[tokio::test]
    async fn test_fetch_range_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "range": "branches!A1:C3",
            "majorDimension": "ROWS",
            "values": [["id", "label", "address"], ["omaha", "Omaha", "3035 Whitmore Street"]]
        });
        let mock = server
            .mock(
                "GET",
                "/v4/spreadsheets/sheet-1/values/branches!A1:Z",
            )
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let settings = SheetsSettings {
            sheet_id: "sheet-1".into(),
            api_key: "test-key".into(),
            base_url: server.url(),
            ..Default::default()
        };
        let client = SheetsClient::new(&settings).unwrap();
        let rows = client.fetch_range("branches!A1:Z").await.unwrap();

        mock.assert_async().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], "omaha");
    }
}
