//! Route modules for Stitch Server

pub mod health;
pub mod upload;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_chunk_size = state.config().upload.max_chunk_size;

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/upload", upload::router(max_chunk_size))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
