//! # HTTP API
//!
//! axum server over one shared [`Session`].
//!
//! ## Endpoints
//!
//! - `GET /health`
//! - `GET|POST /layers`, `DELETE /layers/{id}`, `GET /layers/{id}/stats`
//! - `GET|POST /cis`, `GET /cis/{id}`, `GET /cis/{id}/relations`, `GET /cis/{id}/traits`
//! - `POST /attributes`, `POST /attributes/remove`
//! - `POST /relations`, `POST /relations/remove`
//! - `GET /traits`, `GET /traits/{id}/effective`
//! - `GET|POST /predicates`
//! - `GET /changesets`
//! - `POST /export`
//!
//! Merged reads take `?layers=a,b,c` (most precedent first) and an optional
//! `at=<RFC 3339>` for as-of reads.
//!
//! ## Security
//!
//! - `LAYERKEEPER_CORS_ORIGINS`: comma-separated origins or "*" (default: localhost only)
//! - `LAYERKEEPER_RATE_LIMIT`: requests per second, 0 disables (default: 100)
//! - `LAYERKEEPER_API_KEY`: when set, Bearer authentication on every route but `/health`

mod auth;
mod error;
mod handlers;
mod middleware;
mod types;

pub use auth::get_api_key_from_env;
pub use error::ApiError;
pub use middleware::create_rate_limiter;
// Re-exported for the integration tests.
#[allow(unused_imports)]
pub use handlers::{
    changesets_handler, ci_relations_handler, ci_traits_handler, create_ci_handler,
    create_layer_handler, delete_layer_handler, effective_traits_handler, export_handler,
    get_ci_handler, health_handler, layer_stats_handler, list_cis_handler, list_layers_handler,
    list_predicates_handler, list_traits_handler, remove_attribute_handler,
    remove_relation_handler, set_attribute_handler, set_relation_handler,
    upsert_predicate_handler,
};
#[allow(unused_imports)]
pub use types::{
    ChangesetParams, CiResponse, CreateCiRequest, CreateLayerRequest, DeleteLayerResponse,
    EffectiveTraitsResponse, ErrorResponse, ExportRequest, ExportResponse, HealthResponse,
    LayerResponse, PredicateRequest, PredicateWriteResponse, ReadParams, RemoveAttributeRequest,
    RemoveRelationRequest, SetAttributeRequest, SetRelationRequest, TraitListResponse, ValueJson,
    WriteResponse,
};

use crate::config::AppConfig;
use crate::error::AppError;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{delete, get, post},
};
use layerkeeper_core::Session;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<RwLock<Session>>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// State with the default configuration.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self::with_config(session, AppConfig::default())
    }

    #[must_use]
    pub fn with_config(session: Session, config: AppConfig) -> Self {
        Self {
            session: Arc::new(RwLock::new(session)),
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

const CORS_METHODS: [Method; 4] = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];

/// CORS from the configured origins.
///
/// "*" allows everything, an unset or unparsable list falls back to localhost.
fn build_cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some("*") => {
            tracing::warn!("CORS: allowing ALL origins, do not use this in production");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|origin| match origin.parse::<HeaderValue>() {
                    Ok(hv) => {
                        tracing::info!(origin, "CORS: allowing origin");
                        Some(hv)
                    }
                    Err(e) => {
                        tracing::warn!(origin, error = %e, "CORS: invalid origin");
                        None
                    }
                })
                .collect();

            if allowed.is_empty() {
                tracing::warn!("CORS: no valid origins configured, defaulting to localhost only");
                build_localhost_cors()
            } else {
                CorsLayer::new()
                    .allow_origin(allowed)
                    .allow_methods(CORS_METHODS)
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            }
        }
        None => {
            tracing::info!("CORS: no origins configured, defaulting to localhost only");
            build_localhost_cors()
        }
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(CORS_METHODS)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Build the router with every endpoint and middleware.
///
/// Middleware stack, outer to inner: tracing, CORS, body limit, rate
/// limiting (when enabled), authentication (when configured).
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(state.config.cors_origins().as_deref());

    let rate_limit = state.config.rate_limit();
    let rate_limiter = if rate_limit > 0 {
        tracing::info!(rate_limit, "rate limiting enabled");
        Some(create_rate_limiter(rate_limit))
    } else {
        tracing::info!("rate limiting disabled");
        None
    };

    let has_auth = get_api_key_from_env().is_some();
    if has_auth {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED, every endpoint is public. \
             Set LAYERKEEPER_API_KEY to enable it."
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route(
            "/layers",
            get(handlers::list_layers_handler).post(handlers::create_layer_handler),
        )
        .route("/layers/{id}", delete(handlers::delete_layer_handler))
        .route("/layers/{id}/stats", get(handlers::layer_stats_handler))
        .route(
            "/cis",
            get(handlers::list_cis_handler).post(handlers::create_ci_handler),
        )
        .route("/cis/{id}", get(handlers::get_ci_handler))
        .route("/cis/{id}/relations", get(handlers::ci_relations_handler))
        .route("/cis/{id}/traits", get(handlers::ci_traits_handler))
        .route("/attributes", post(handlers::set_attribute_handler))
        .route("/attributes/remove", post(handlers::remove_attribute_handler))
        .route("/relations", post(handlers::set_relation_handler))
        .route("/relations/remove", post(handlers::remove_relation_handler))
        .route("/traits", get(handlers::list_traits_handler))
        .route(
            "/traits/{id}/effective",
            get(handlers::effective_traits_handler),
        )
        .route(
            "/predicates",
            get(handlers::list_predicates_handler).post(handlers::upsert_predicate_handler),
        )
        .route("/changesets", get(handlers::changesets_handler))
        .route("/export", post(handlers::export_handler));

    if has_auth {
        router = router.layer(axum_middleware::from_fn(auth::api_key_auth_middleware));
    }

    if let Some(limiter) = rate_limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Bind `addr` and serve until the process stops.
pub async fn run_server(addr: &str, session: Session, config: AppConfig) -> Result<(), AppError> {
    let router = create_router(AppState::with_config(session, config));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Io(format!("Bind {}: {}", addr, e)))?;

    tracing::info!(addr, "layerkeeper HTTP server listening");

    axum::serve(listener, router)
        .await
        .map_err(|e| AppError::Io(format!("Server error: {}", e)))
}

// =============================================================================
// TESTS
// =============================================================================
