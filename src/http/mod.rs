//! The HTTP API: axum router, auth, CORS, and rate limiting.

mod auth;
mod error;
mod jobs;
mod rate_limit;

pub use self::auth::AuthUser;
pub use self::error::ApiError;
pub use self::rate_limit::RateLimiter;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::middleware;
use axum::routing::{get, patch, post};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::config::Config;
use crate::store::JobStore;

/// Global API budget: 60 requests per second, bursting to 100.
const GLOBAL_RATE: f64 = 60.0;
const GLOBAL_BURST: f64 = 100.0;
/// Pause/resume flips are deliberately slow: 1 per second, bursting to 5.
const TOGGLE_RATE: f64 = 1.0;
const TOGGLE_BURST: f64 = 5.0;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Job records.
    pub jobs: JobStore,
    /// HS256 secret for bearer-JWT verification.
    pub jwt_secret: Arc<String>,
    /// Default page size when the caller passes none.
    pub default_limit: i64,
}

/// Build the full API router.
pub fn router(state: AppState, config: &Config) -> Router {
    let toggle_limiter = Arc::new(RateLimiter::new(TOGGLE_RATE, TOGGLE_BURST));
    let global_limiter = Arc::new(RateLimiter::new(GLOBAL_RATE, GLOBAL_BURST));

    let toggle_routes = Router::new()
        .route("/api/jobs/{id}/pause", patch(jobs::pause_job))
        .route("/api/jobs/{id}/resume", patch(jobs::resume_job))
        .route_layer(middleware::from_fn_with_state(
            toggle_limiter,
            rate_limit::rate_limit,
        ));

    Router::new()
        .route("/api/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route(
            "/api/jobs/{id}",
            get(jobs::get_job)
                .put(jobs::update_job)
                .delete(jobs::delete_job),
        )
        .merge(toggle_routes)
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn_with_state(
            global_limiter,
            rate_limit::rate_limit,
        ))
        .layer(cors_layer(config))
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true)
}
