pub mod dispatch;
pub mod execute;
pub mod manage;
pub mod shaper;

use axum::http::{HeaderName, HeaderValue};
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::state::SharedState;

pub fn api_routes(max_body_size: usize) -> Router<SharedState> {
    Router::new()
        .route("/api/execute", post(execute::execute))
        .route("/api/{*path}", get(dispatch::dispatch).post(dispatch::dispatch))
        .layer(RequestBodyLimitLayer::new(max_body_size))
}

/// Unauthenticated and cross-origin. Every response carries a permissive
/// `Access-Control-Allow-Origin`, errors included. The body limit sits
/// inside the header layer so a 413 is readable cross-origin too.
pub fn public_routes(max_body_size: usize) -> Router<SharedState> {
    Router::new()
        .route(
            "/api/public/execute",
            post(execute::public_execute).options(execute::public_options),
        )
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("access-control-allow-origin"),
            HeaderValue::from_static("*"),
        ))
}

pub fn manage_routes(max_body_size: usize) -> Router<SharedState> {
    Router::new()
        .route(
            "/manage/endpoints/{id}/logs",
            get(manage::list_logs).delete(manage::clear_logs),
        )
        .route("/manage/endpoints/{id}/production", get(manage::production))
        .layer(RequestBodyLimitLayer::new(max_body_size))
}
