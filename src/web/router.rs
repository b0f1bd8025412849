//! Router configuration for the Web API.

use axum::{
    http::Method,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    clear_cache, delete_script, get_autocomplete, list_scripts, run_method, upsert_script,
    AppState,
};

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/method/:name", post(run_method))
        .route("/autocomplete", get(get_autocomplete))
        .route("/admin/scripts", get(list_scripts).put(upsert_script))
        .route("/admin/scripts/:name", delete(delete_script))
        .route("/admin/clear-cache", post(clear_cache));

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer()),
        )
        .with_state(state)
}

/// Permissive CORS: the API is fronted by the host framework's own
/// origin policy in production.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_origin(Any)
}

async fn health_check() -> &'static str {
    "OK"
}
