//! # Rental Quoting SDK
//!
//! A high-performance Rust engine for real-time portable-sanitation rental
//! quoting. This crate provides the low-latency quote path and its support
//! layers: pricing catalog sync, road-distance resolution and per-call
//! latency instrumentation.
//!
//! ## Overview
//!
//! The quote path must return a priced, itemized quote in well under a
//! second while depending on a mutable pricing catalog, an external maps
//! provider and seasonal/tiered pricing rules. The crate keeps that path
//! fast by making everything around it asynchronous:
//!
//! - **Catalog Sync**: pulls product/generator/branch/config tabs from the
//!   pricing spreadsheet and atomically installs immutable snapshots
//! - **Distance Resolution**: cache-first road distance with a geocoded
//!   great-circle fallback
//! - **Location Lookup**: background prewarm of the distance cache with a
//!   persisted audit trail
//! - **Latency Recording**: non-blocking scoped measurements feeding
//!   percentiles, running means and trend streams
//!
//! ## Architecture
//!
//! Readers dereference a single `catalog:current_version` pointer per
//! request and then work against an immutable snapshot; the sync layer is
//! the only writer, under a distributed lease. Every cache operation and
//! outbound HTTP call is wrapped in a scoped latency measurement.

// Core infrastructure
/// Typed async facade over the key-value store
pub mod cache_store;
/// Scoped latency measurements and the sample drain worker
pub mod latency_recorder;
/// Process metrics facade (feature-gated)
pub mod metrics;
/// Process configuration
pub mod settings;

// Catalog
/// Catalog data model, snapshot reader and publisher seam
pub mod catalog;
/// Catalog synchronizer (fetch, validate, publish under lease)
pub mod catalog_sync;
/// Spreadsheet provider client and tab row parsers
pub mod sheets_client;

// Distance
/// Distance resolver with cache-first lookup and geocoded fallback
pub mod distance_resolver;
/// Maps provider seam (distance matrix + geocoding)
pub mod maps_client;

// Quoting
/// Background location lookup with audit trail
pub mod location_lookup;
/// The synchronous quote pipeline
pub mod quote_builder;

// HTTP surface
/// API key middleware
pub mod auth;
/// Axum router and handlers
pub mod http_api;
/// Read-only latency metric queries
pub mod metrics_readback;

// Utilities
/// Address normalization, hashing, distance and money helpers
pub mod quoting_math;

// Re-exports for convenience
pub use cache_store::CacheStore;
pub use catalog::{CatalogReader, CatalogSnapshot};
pub use catalog_sync::CatalogSync;
pub use distance_resolver::DistanceResolver;
pub use latency_recorder::RecorderHandle;
pub use location_lookup::LocationLookupService;
pub use quote_builder::QuoteEngine;
pub use settings::Settings;
