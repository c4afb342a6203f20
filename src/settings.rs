use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub app_base_url: Option<String>,
    /// Shared secret required on /quote and /location_lookup.
    /// None = development mode (all requests pass).
    #[serde(default)]
    pub pricing_webhook_api_key: Option<String>,
    #[serde(default = "default_soft_connection_limit")]
    pub soft_connection_limit: usize,
    #[serde(default = "default_hard_connection_limit")]
    pub hard_connection_limit: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_soft_connection_limit() -> usize {
    80
}
fn default_hard_connection_limit() -> usize {
    100
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            app_base_url: None,
            pricing_webhook_api_key: None,
            soft_connection_limit: default_soft_connection_limit(),
            hard_connection_limit: default_hard_connection_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Cache {
    #[serde(default = "default_cache_url")]
    pub url: String,
    #[serde(default = "default_cache_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

fn default_cache_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_cache_op_timeout_ms() -> u64 {
    200
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            url: default_cache_url(),
            op_timeout_ms: default_cache_op_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Maps {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_maps_base_url")]
    pub base_url: String,
    #[serde(default = "default_maps_timeout_ms")]
    pub timeout_ms: u64,
    /// Great-circle miles are multiplied by this when the provider can
    /// geocode both endpoints but cannot route between them.
    #[serde(default = "default_road_factor")]
    pub road_factor: f64,
    #[serde(default = "default_distance_ttl_s")]
    pub distance_ttl_s: u64,
    #[serde(default = "default_fallback_distance_ttl_s")]
    pub fallback_distance_ttl_s: u64,
}

fn default_maps_base_url() -> String {
    "https://maps.googleapis.com".to_string()
}
fn default_maps_timeout_ms() -> u64 {
    1500
}
fn default_road_factor() -> f64 {
    1.3
}
fn default_distance_ttl_s() -> u64 {
    86_400 // 24 h
}
fn default_fallback_distance_ttl_s() -> u64 {
    21_600 // fallback estimates go stale faster
}

impl Default for Maps {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_maps_base_url(),
            timeout_ms: default_maps_timeout_ms(),
            road_factor: default_road_factor(),
            distance_ttl_s: default_distance_ttl_s(),
            fallback_distance_ttl_s: default_fallback_distance_ttl_s(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Sheets {
    #[serde(default)]
    pub sheet_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_sheets_base_url")]
    pub base_url: String,
    #[serde(default = "default_range_products")]
    pub range_products: String,
    #[serde(default = "default_range_generators")]
    pub range_generators: String,
    #[serde(default = "default_range_branches")]
    pub range_branches: String,
    #[serde(default = "default_range_config")]
    pub range_config: String,
    #[serde(default = "default_catalog_fetch_timeout_s")]
    pub fetch_timeout_s: u64,
    #[serde(default = "default_catalog_sync_interval_s")]
    pub sync_interval_s: u64,
}

fn default_sheets_base_url() -> String {
    "https://sheets.googleapis.com".to_string()
}
fn default_range_products() -> String {
    "products!A1:Z".to_string()
}
fn default_range_generators() -> String {
    "generators!A1:Z".to_string()
}
fn default_range_branches() -> String {
    "branches!A1:Z".to_string()
}
fn default_range_config() -> String {
    "config!A1:Z".to_string()
}
fn default_catalog_fetch_timeout_s() -> u64 {
    10
}
fn default_catalog_sync_interval_s() -> u64 {
    900 // 15 min
}

impl Default for Sheets {
    fn default() -> Self {
        Self {
            sheet_id: String::new(),
            api_key: String::new(),
            base_url: default_sheets_base_url(),
            range_products: default_range_products(),
            range_generators: default_range_generators(),
            range_branches: default_range_branches(),
            range_config: default_range_config(),
            fetch_timeout_s: default_catalog_fetch_timeout_s(),
            sync_interval_s: default_catalog_sync_interval_s(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Quote {
    #[serde(default = "default_quote_deadline_ms")]
    pub deadline_ms: u64,
    /// Deliveries at or below this are tagged "local".
    #[serde(default = "default_local_distance_threshold_miles")]
    pub local_distance_threshold_miles: f64,
}

fn default_quote_deadline_ms() -> u64 {
    3000
}
fn default_local_distance_threshold_miles() -> f64 {
    180.0
}

impl Default for Quote {
    fn default() -> Self {
        Self {
            deadline_ms: default_quote_deadline_ms(),
            local_distance_threshold_miles: default_local_distance_threshold_miles(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Location {
    #[serde(default = "default_location_bg_timeout_s")]
    pub bg_timeout_s: u64,
    #[serde(default = "default_dedupe_window_s")]
    pub dedupe_window_s: u64,
}

fn default_location_bg_timeout_s() -> u64 {
    30
}
fn default_dedupe_window_s() -> u64 {
    30
}

impl Default for Location {
    fn default() -> Self {
        Self {
            bg_timeout_s: default_location_bg_timeout_s(),
            dedupe_window_s: default_dedupe_window_s(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Latency {
    /// Bounded channel capacity between request paths and the drain worker.
    #[serde(default = "default_latency_sample_capacity")]
    pub sample_capacity: usize,
    /// Server-side cap on each per-service sorted set.
    #[serde(default = "default_latency_sorted_set_cap")]
    pub sorted_set_cap: usize,
    /// Samples older than this are discarded while the worker catches up.
    #[serde(default = "default_max_sample_age_s")]
    pub max_sample_age_s: u64,
    /// Readback reports `stale: true` below this sample count.
    #[serde(default = "default_min_samples_for_stats")]
    pub min_samples_for_stats: u64,
}

fn default_latency_sample_capacity() -> usize {
    4096
}
fn default_latency_sorted_set_cap() -> usize {
    1000
}
fn default_max_sample_age_s() -> u64 {
    60
}
fn default_min_samples_for_stats() -> u64 {
    30
}

impl Default for Latency {
    fn default() -> Self {
        Self {
            sample_capacity: default_latency_sample_capacity(),
            sorted_set_cap: default_latency_sorted_set_cap(),
            max_sample_age_s: default_max_sample_age_s(),
            min_samples_for_stats: default_min_samples_for_stats(),
        }
    }
}

/// Immutable process configuration, constructed once at startup and passed
/// explicitly to component constructors.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub maps: Maps,
    #[serde(default)]
    pub sheets: Sheets,
    #[serde(default)]
    pub quote: Quote,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub latency: Latency,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config.toml")
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Environment variable overrides for deployment-critical keys
        if let Ok(url) = env::var("CACHE_URL") {
            if !url.trim().is_empty() {
                settings.cache.url = url;
            }
        }
        if let Ok(key) = env::var("MAPS_API_KEY") {
            if !key.trim().is_empty() {
                settings.maps.api_key = key;
            }
        }
        if let Ok(key) = env::var("SHEETS_API_KEY") {
            if !key.trim().is_empty() {
                settings.sheets.api_key = key;
            }
        }
        if let Ok(id) = env::var("SHEET_ID") {
            if !id.trim().is_empty() {
                settings.sheets.sheet_id = id;
            }
        }
        if let Ok(key) = env::var("PRICING_WEBHOOK_API_KEY") {
            if !key.trim().is_empty() {
                settings.server.pricing_webhook_api_key = Some(key);
            }
        }
        if let Ok(addr) = env::var("BIND_ADDR") {
            if !addr.trim().is_empty() {
                settings.server.bind_addr = addr;
            }
        }

        Ok(settings)
    }
}
