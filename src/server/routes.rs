use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::AppState;
use crate::server::handlers;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state);
    let max_body_bytes = state.config().server.max_body_bytes;

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn api_routes(max_body_bytes: usize) -> Router<Arc<AppState>> {
    Router::new()
        .route("/credits/balance", get(handlers::get_balance))
        .route("/credits/recharge", post(handlers::recharge))
        .route(
            "/get_llm_response",
            post(handlers::get_llm_response).layer(DefaultBodyLimit::max(max_body_bytes)),
        )
}

/// Any origin in the local environment, the configured origins elsewhere.
fn cors_layer(state: &AppState) -> CorsLayer {
    let config = state.config();
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if config.is_local() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}
