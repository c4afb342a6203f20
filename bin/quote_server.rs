//! # Quote Server
//!
//! Long-running service hosting the real-time quote endpoint and its
//! support layers: catalog sync, distance resolution, location lookups
//! and latency instrumentation.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin quote_server -- --config Config.toml
//! ```
//!
//! Press Ctrl+C to stop gracefully.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use rental_quoting_sdk::{
    catalog::{CacheCatalogPublisher, CatalogReader},
    catalog_sync::CatalogSync,
    distance_resolver::DistanceResolver,
    http_api::{api_router, ApiState},
    latency_recorder::{LatencyWorker, RecorderHandle},
    location_lookup::LocationLookupService,
    maps_client::GoogleMapsClient,
    metrics,
    metrics_readback::MetricsReadback,
    quote_builder::QuoteEngine,
    settings::Settings,
    sheets_client::SheetsClient,
    CacheStore,
};

#[derive(Parser, Debug)]
#[command(name = "quote_server", about = "Real-time rental quoting service")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "Config.toml")]
    config: String,

    /// Override the bind address from the config
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    env_logger::init();

    let args = Args::parse();

    println!("🚀 Starting Quote Server");
    println!("═══════════════════════════════════════════════════════════════════\n");

    // 1. Load settings
    let mut settings = Settings::from_file(&args.config).context("Failed to load settings")?;
    if let Some(bind) = args.bind {
        settings.server.bind_addr = bind;
    }
    println!("✅ Settings loaded from {}", args.config);
    if let Some(base_url) = &settings.server.app_base_url {
        println!("   Callback base URL: {}", base_url);
    }

    metrics::describe_metrics();

    // 2. Connect to the cache store
    let raw_cache = CacheStore::connect(
        &settings.cache.url,
        Duration::from_millis(settings.cache.op_timeout_ms),
    )
    .await
    .context("Failed to connect to cache store")?;
    println!("✅ Cache store connected");

    // 3. Start the latency recorder worker. The worker writes through the
    // uninstrumented store; everything else uses the instrumented clone.
    let (recorder, sample_rx) = RecorderHandle::channel(settings.latency.sample_capacity);
    let worker = LatencyWorker::new(sample_rx, raw_cache.clone(), &settings.latency);
    tokio::spawn(worker.run());
    let cache = raw_cache.with_recorder(recorder.clone());
    println!("✅ Latency recorder started");

    // 4. Catalog reader + sync loop
    let catalog = Arc::new(CatalogReader::new(cache.clone()));
    let publisher = Arc::new(CacheCatalogPublisher::new(cache.clone()));
    let sheets = SheetsClient::new(&settings.sheets).context("Failed to create sheets client")?;
    let sync = Arc::new(CatalogSync::new(
        sheets,
        cache.clone(),
        publisher,
        recorder.clone(),
        settings.sheets.clone(),
    ));
    tokio::spawn(Arc::clone(&sync).run_periodic());
    println!("✅ Catalog sync loop started");

    // 5. Distance resolver
    let maps = Arc::new(GoogleMapsClient::new(&settings.maps).context("Failed to create maps client")?);
    let resolver = Arc::new(DistanceResolver::new(
        cache.clone(),
        maps,
        recorder.clone(),
        &settings.maps,
    ));
    println!("✅ Distance resolver ready");

    // 6. Location lookup + quote engine + metrics readback
    let lookup = Arc::new(LocationLookupService::new(
        cache.clone(),
        Arc::clone(&resolver),
        Arc::clone(&catalog),
        recorder.clone(),
        &settings.location,
    ));
    let engine = Arc::new(QuoteEngine::new(
        Arc::clone(&catalog),
        Arc::clone(&resolver),
        recorder.clone(),
        &settings.quote,
    ));
    let readback = Arc::new(MetricsReadback::new(cache.clone(), &settings.latency));
    println!("✅ Quote engine ready");

    // 7. HTTP surface
    let state = Arc::new(ApiState::new(
        engine,
        lookup,
        readback,
        sync,
        catalog,
        cache,
        &settings,
    ));
    let app = api_router(state, &settings);

    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.bind_addr))?;
    println!("✅ Listening on {}", settings.server.bind_addr);
    println!("\n═══════════════════════════════════════════════════════════════════");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    println!("👋 Quote server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        log::error!("❌ Failed to listen for shutdown signal: {}", e);
        return;
    }
    println!("\n🛑 Shutdown signal received, draining...");
}
