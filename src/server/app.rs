use std::net::SocketAddr;

use axum::Router;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::server::routes;
use crate::server::state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    let json_routes = Router::new()
        .route("/api/send", post(routes::send))
        .route("/api/download", post(routes::download))
        .route_layer(middleware::from_fn(require_json_content_type));

    Router::new()
        .merge(json_routes)
        .route("/api/status", get(routes::status))
        .route("/api/session-backend", get(routes::session_backend))
        .route("/qr", get(routes::qr_page))
        .route("/status", get(routes::status_page))
        .route("/health", get(routes::health))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                .layer(TraceLayer::new_for_http()),
        )
        .layer(CorsLayer::new().allow_origin(Any))
}

pub fn bind_address(port: u16) -> SocketAddr {
    format!("0.0.0.0:{port}")
        .parse()
        .unwrap_or_else(|_| "0.0.0.0:8080".parse().expect("valid fallback bind"))
}

/// Enforces `Content-Type: application/json` on JSON-bodied endpoints (§4.8).
async fn require_json_content_type(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "expected Content-Type: application/json",
        )
            .into_response();
    }
    next.run(request).await
}
