// HTTP API - the quoting surface
//
// POST /quote            synchronous quote, 3 s wall-clock deadline
// POST /location_lookup  fire-and-forget prewarm, 202 + audit id
// GET  /location_lookup/{id}  audit readback
// GET  /metrics/percentiles|averages|recent
// POST /admin/catalog/sync    manual sync trigger (409 on contention)
// POST /admin/cache/clear     drop a cache key family
// GET  /health
//
// Quote and admin routes sit behind the static API key; every request is
// independent, bounded by a global concurrency limit at the hard cap.

use axum::{
    error_handling::HandleErrorLayer,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use log::{error, warn};

use crate::auth::AuthLayer;
use crate::cache_store::CacheStore;
use crate::catalog::{CatalogReader, CURRENT_VERSION_KEY};
use crate::catalog_sync::{CatalogSync, SyncError, SyncTrigger};
use crate::latency_recorder::{SampleStatus, Service};
use crate::location_lookup::LocationLookupService;
use crate::metrics;
use crate::metrics_readback::{MetricsReadback, SUPPORTED_PERCENTILES};
use crate::quote_builder::{QuoteEngine, QuoteError, QuoteRequest};
use crate::settings::Settings;

// ==================== ERROR ENVELOPE ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Undeliverable,
    AlreadyRunning,
    CatalogUnavailable,
    FallbackUnavailable,
    CacheUnavailable,
    Deadline,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Undeliverable => "undeliverable",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::CatalogUnavailable => "catalog_unavailable",
            ErrorKind::FallbackUnavailable => "fallback_unavailable",
            ErrorKind::CacheUnavailable => "cache_unavailable",
            ErrorKind::Deadline => "deadline",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound | ErrorKind::Undeliverable => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyRunning => StatusCode::CONFLICT,
            ErrorKind::CatalogUnavailable | ErrorKind::CacheUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::FallbackUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::Deadline => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Uniform error body: `{kind, message, request_id}`. Messages stay free
/// of internal identifiers; the request id is the correlation handle.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub request_id: Uuid,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            request_id: Uuid::new_v4(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "kind": self.kind.as_str(),
            "message": self.message,
            "request_id": self.request_id,
        });
        if self.kind == ErrorKind::CatalogUnavailable {
            body["retry_after_s"] = serde_json::json!(5);
        }
        if self.kind == ErrorKind::Internal {
            error!("❌ Internal error {}: {}", self.request_id, self.message);
        }
        (self.kind.status(), Json(body)).into_response()
    }
}

impl From<QuoteError> for ApiError {
    fn from(e: QuoteError) -> Self {
        match e {
            QuoteError::InvalidRequest { field, message } => ApiError::new(
                ErrorKind::InvalidRequest,
                format!("{}: {}", field, message),
            ),
            QuoteError::Undeliverable => ApiError::new(
                ErrorKind::Undeliverable,
                "we could not resolve a delivery route to this address",
            ),
            QuoteError::CatalogUnavailable => ApiError::new(
                ErrorKind::CatalogUnavailable,
                "pricing data is not available yet, retry shortly",
            ),
            QuoteError::FallbackUnavailable => ApiError::new(
                ErrorKind::FallbackUnavailable,
                "distance lookup is temporarily unavailable",
            ),
            QuoteError::CacheUnavailable(_) => ApiError::new(
                ErrorKind::CacheUnavailable,
                "a backing service is temporarily unavailable",
            ),
            QuoteError::Internal(detail) => ApiError::new(ErrorKind::Internal, detail),
        }
    }
}

// ==================== STATE / ROUTER ====================

pub struct ApiState {
    pub engine: Arc<QuoteEngine>,
    pub lookup: Arc<LocationLookupService>,
    pub readback: Arc<MetricsReadback>,
    pub sync: Arc<CatalogSync>,
    pub catalog: Arc<CatalogReader>,
    pub cache: CacheStore,
    pub quote_deadline: Duration,
    inflight: AtomicUsize,
    soft_limit: usize,
}

impl ApiState {
    pub fn new(
        engine: Arc<QuoteEngine>,
        lookup: Arc<LocationLookupService>,
        readback: Arc<MetricsReadback>,
        sync: Arc<CatalogSync>,
        catalog: Arc<CatalogReader>,
        cache: CacheStore,
        settings: &Settings,
    ) -> Self {
        Self {
            engine,
            lookup,
            readback,
            sync,
            catalog,
            cache,
            quote_deadline: Duration::from_millis(settings.quote.deadline_ms),
            inflight: AtomicUsize::new(0),
            soft_limit: settings.server.soft_connection_limit,
        }
    }
}

/// Build the full router. Quote and admin routes require the API key;
/// metrics and health stay open for the dashboard and probes.
pub fn api_router(state: Arc<ApiState>, settings: &Settings) -> Router {
    let guarded = Router::new()
        .route("/quote", post(post_quote))
        .route("/location_lookup", post(post_location_lookup))
        .route("/location_lookup/{id}", get(get_location_lookup))
        .route("/admin/catalog/sync", post(post_admin_sync))
        .route("/admin/cache/clear", post(post_admin_cache_clear))
        .layer(AuthLayer::new(
            settings.server.pricing_webhook_api_key.clone(),
        ));

    let open = Router::new()
        .route("/health", get(get_health))
        .route("/metrics/percentiles", get(get_percentiles))
        .route("/metrics/averages", get(get_averages))
        .route("/metrics/recent", get(get_recent));

    Router::new()
        .merge(guarded)
        .merge(open)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            track_inflight,
        ))
        .layer(
            // Shed load instead of queueing once the hard cap is reached.
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_err: tower::BoxError| async {
                    StatusCode::SERVICE_UNAVAILABLE
                }))
                .load_shed()
                .concurrency_limit(settings.server.hard_connection_limit),
        )
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn track_inflight(
    State(state): State<Arc<ApiState>>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let inflight = state.inflight.fetch_add(1, Ordering::Relaxed) + 1;
    metrics::set_http_inflight(inflight as f64);
    if inflight == state.soft_limit + 1 {
        warn!(
            "⚠️ In-flight requests above soft limit ({} > {})",
            inflight, state.soft_limit
        );
    }
    let response = next.run(req).await;
    state.inflight.fetch_sub(1, Ordering::Relaxed);
    response
}

// ==================== QUOTE ====================

/// Cancels the quote task if the response future is dropped (client
/// disconnect or deadline); a finished task aborts as a no-op.
struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn post_quote(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<QuoteRequest>, JsonRejection>,
) -> Response {
    let timer = state.engine.recorder().scope(Service::Quote, "quote");

    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            timer.finish(SampleStatus::Failed);
            metrics::increment_quote_request("invalid_request");
            return ApiError::new(ErrorKind::InvalidRequest, rejection.body_text())
                .into_response();
        }
    };

    // The build runs in its own task so a panic in any sub-step surfaces
    // as a join error, not a connection reset. The guard aborts it when
    // the client disconnects mid-request.
    let engine = Arc::clone(&state.engine);
    let mut task = AbortOnDrop(tokio::spawn(async move { engine.build(request).await }));

    match tokio::time::timeout(state.quote_deadline, &mut task.0).await {
        Err(_) => {
            timer.finish(SampleStatus::Cancelled);
            metrics::increment_quote_request("deadline");
            ApiError::new(
                ErrorKind::Deadline,
                "quote could not be computed within the deadline",
            )
            .into_response()
        }
        Ok(Ok(Ok(result))) => {
            metrics::record_quote_latency_ms(timer.elapsed().as_millis() as f64);
            metrics::increment_quote_request("ok");
            timer.finish(SampleStatus::Ok);
            (StatusCode::OK, Json(result)).into_response()
        }
        Ok(Ok(Err(e))) => {
            timer.finish(SampleStatus::Failed);
            let api_error = ApiError::from(e);
            metrics::increment_quote_request(api_error.kind.as_str());
            api_error.into_response()
        }
        Ok(Err(join_error)) => {
            timer.finish(SampleStatus::Failed);
            metrics::increment_quote_request("internal");
            // Panic inside a pricing phase: opaque 500, no details leaked.
            error!("❌ Quote task aborted: {}", join_error);
            ApiError::new(ErrorKind::Internal, "quote computation failed").into_response()
        }
    }
}

// ==================== LOCATION LOOKUP ====================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LocationLookupRequest {
    delivery_location: String,
}

#[derive(Debug, Serialize)]
struct LocationLookupAccepted {
    audit_id: Uuid,
}

async fn post_location_lookup(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<LocationLookupRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload
        .map_err(|rejection| ApiError::new(ErrorKind::InvalidRequest, rejection.body_text()))?;
    if request.delivery_location.trim().is_empty() {
        return Err(ApiError::new(
            ErrorKind::InvalidRequest,
            "delivery_location: must not be empty",
        ));
    }

    let audit_id = Arc::clone(&state.lookup)
        .schedule(&request.delivery_location)
        .await
        .map_err(|_| {
            ApiError::new(
                ErrorKind::CacheUnavailable,
                "could not schedule the lookup, retry shortly",
            )
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(LocationLookupAccepted { audit_id }),
    ))
}

async fn get_location_lookup(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::new(ErrorKind::InvalidRequest, "audit id must be a UUID"))?;
    let audit = state
        .lookup
        .get_audit(id)
        .await
        .map_err(|_| {
            ApiError::new(
                ErrorKind::CacheUnavailable,
                "audit store temporarily unavailable",
            )
        })?
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "no audit with this id"))?;
    Ok(Json(audit))
}

// ==================== METRICS READBACK ====================

#[derive(Debug, Deserialize)]
struct PercentilesQuery {
    service: String,
    p: u8,
}

fn parse_service(raw: &str) -> Result<Service, ApiError> {
    Service::parse(raw).ok_or_else(|| {
        ApiError::new(
            ErrorKind::InvalidRequest,
            format!("unknown service '{}'", raw),
        )
    })
}

async fn get_percentiles(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PercentilesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let service = parse_service(&query.service)?;
    if !SUPPORTED_PERCENTILES.contains(&query.p) {
        return Err(ApiError::new(
            ErrorKind::InvalidRequest,
            format!("p must be one of {:?}", SUPPORTED_PERCENTILES),
        ));
    }
    let report = state
        .readback
        .percentile(service, query.p)
        .await
        .map_err(|_| {
            ApiError::new(ErrorKind::CacheUnavailable, "metrics store unavailable")
        })?;
    Ok(Json(report))
}

async fn get_averages(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.readback.all_services_summary().await.map_err(|_| {
        ApiError::new(ErrorKind::CacheUnavailable, "metrics store unavailable")
    })?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    service: String,
    #[serde(default = "default_recent_n")]
    n: usize,
}

fn default_recent_n() -> usize {
    50
}

async fn get_recent(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RecentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let service = parse_service(&query.service)?;
    let report = state
        .readback
        .recent(service, query.n.min(500))
        .await
        .map_err(|_| {
            ApiError::new(ErrorKind::CacheUnavailable, "metrics store unavailable")
        })?;
    Ok(Json(report))
}

// ==================== ADMIN ====================

async fn post_admin_sync(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    match Arc::clone(&state.sync).trigger_detached(SyncTrigger::Manual).await {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "accepted"})),
        )),
        Err(SyncError::AlreadyRunning) => Err(ApiError::new(
            ErrorKind::AlreadyRunning,
            "a catalog sync is already in progress",
        )),
        Err(_) => Err(ApiError::new(
            ErrorKind::CacheUnavailable,
            "could not start the sync, retry shortly",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct CacheClearQuery {
    scope: String,
}

async fn post_admin_cache_clear(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<CacheClearQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let cleared = match query.scope.as_str() {
        "pricing" => clear_pricing(&state.cache).await,
        "distance" => state.cache.clear_prefix("distance:").await,
        "all" => match clear_pricing(&state.cache).await {
            Ok(pricing) => state
                .cache
                .clear_prefix("distance:")
                .await
                .map(|distance| pricing + distance),
            Err(e) => Err(e),
        },
        other => {
            return Err(ApiError::new(
                ErrorKind::InvalidRequest,
                format!("scope must be pricing|distance|all, got '{}'", other),
            ))
        }
    }
    .map_err(|_| ApiError::new(ErrorKind::CacheUnavailable, "cache clear failed"))?;

    Ok(Json(serde_json::json!({
        "scope": query.scope,
        "cleared_keys": cleared,
    })))
}

/// Pricing scope: versioned blobs plus the pointer. The sync lock is left
/// alone so an in-flight sync is not hijacked.
async fn clear_pricing(
    cache: &CacheStore,
) -> Result<usize, crate::cache_store::CacheError> {
    let count = cache.clear_prefix("catalog:v").await?;
    cache.delete(CURRENT_VERSION_KEY).await?;
    Ok(count + 1)
}

// ==================== HEALTH ====================

async fn get_health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let cache_up = state.cache.ping().await.is_ok();
    let catalog_version = match state.catalog.current().await {
        Ok(Some(snapshot)) => Some(snapshot.version),
        _ => None,
    };
    let healthy = cache_up;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "ok" } else { "degraded" },
            "cache": if cache_up { "up" } else { "down" },
            "catalog_version": catalog_version,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_envelope_carries_kind_and_request_id() {
        let error = ApiError::new(ErrorKind::Undeliverable, "no route");
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["kind"], "undeliverable");
        assert!(parsed["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_catalog_unavailable_includes_retry_hint() {
        let error = ApiError::from(QuoteError::CatalogUnavailable);
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["kind"], "catalog_unavailable");
        assert_eq!(parsed["retry_after_s"], 5);
    }

    #[test]
    fn test_quote_error_mapping() {
        assert_eq!(
            ApiError::from(QuoteError::Undeliverable).kind.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(QuoteError::FallbackUnavailable).kind.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(QuoteError::InvalidRequest {
                field: "rental_days",
                message: "must be at least 1".into()
            })
            .kind
            .status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_deadline_maps_to_504() {
        assert_eq!(ErrorKind::Deadline.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorKind::AlreadyRunning.status(), StatusCode::CONFLICT);
    }
}
