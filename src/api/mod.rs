// HTTP surface for the credential vault

pub mod tokens;

pub use tokens::{create_token_router, TokenAppState};

use axum::{response::Json, routing::get, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Liveness probe. Unauthenticated; reveals nothing about stored credentials.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Full application router: token API, liveness probe and CORS.
pub fn create_router(state: TokenAppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .merge(create_token_router(state))
        .layer(cors)
}
