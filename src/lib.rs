pub mod config;
pub mod error;
pub mod state;
pub mod auth;
pub mod db;
pub mod models;
pub mod request;
pub mod routes;
pub mod sandbox;
pub mod store;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::rate_limit::PublicRateLimiter;
use crate::sandbox::{Capabilities, ExecutionHost, FetchPolicy, HostLimits, ModuleAllowlist};
use crate::state::{AppState, SharedState};
use crate::store::EndpointStore;

/// Assemble shared state. Creates the sandbox fs root if it is missing.
pub fn build_state(config: Config, store: Arc<dyn EndpointStore>) -> Result<SharedState, String> {
    let fs_root = &config.sandbox.fs_root;
    std::fs::create_dir_all(fs_root)
        .map_err(|e| format!("Failed to create sandbox root {}: {e}", fs_root.display()))?;
    let fs_root = fs_root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve sandbox root {}: {e}", fs_root.display()))?;

    let fetch = FetchPolicy::from_list(&config.sandbox.fetch_origins);
    let capabilities = Arc::new(Capabilities {
        allowlist: ModuleAllowlist::standard(),
        fs_root: fs_root.clone(),
        fetch: fetch.clone(),
    });
    let public_capabilities = Arc::new(Capabilities {
        allowlist: ModuleAllowlist::public(),
        fs_root,
        fetch,
    });

    let host = ExecutionHost::new(HostLimits {
        timeout: config.sandbox.exec_timeout,
        settle_window: config.sandbox.settle_window,
        max_heap_size: config.sandbox.max_heap_mb * 1024 * 1024,
    });

    tracing::info!(
        fs_root = %capabilities.fs_root.display(),
        modules = ?capabilities.allowlist.module_names().collect::<Vec<_>>(),
        public_modules = ?public_capabilities.allowlist.module_names().collect::<Vec<_>>(),
        "Sandbox capabilities configured"
    );

    let public_limiter = PublicRateLimiter::new(
        config.public_rate_limit,
        Duration::from_secs(config.public_rate_window_secs),
    );

    Ok(Arc::new(AppState {
        store,
        config,
        host,
        capabilities,
        public_capabilities,
        public_limiter,
    }))
}

pub fn build_router(state: SharedState) -> Router {
    let max_body_size = state.config.max_body_size;

    Router::new()
        .merge(routes::public_routes(max_body_size))
        .merge(routes::api_routes(max_body_size))
        .merge(routes::manage_routes(max_body_size))
        .route("/health", axum::routing::get(health))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .with_state(state)
}

pub fn build_app(config: Config, store: Arc<dyn EndpointStore>) -> Result<Router, String> {
    Ok(build_router(build_state(config, store)?))
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::config::SandboxConfig;
    use crate::store::MemoryStore;

    fn app(root: &std::path::Path) -> Router {
        let config = Config {
            database_url: None,
            jwt_secret: "unit-test-secret".to_string(),
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            max_body_size: 64,
            trusted_proxies: vec![],
            log_level: "warn".to_string(),
            sandbox: SandboxConfig {
                exec_timeout: Duration::from_secs(1),
                settle_window: Duration::from_millis(100),
                max_heap_mb: 64,
                fs_root: root.join("nested/root"),
                fetch_origins: String::new(),
            },
            public_rate_limit: 5,
            public_rate_window_secs: 60,
        };
        build_app(config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn health_carries_security_headers() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
        assert_eq!(resp.headers()["x-frame-options"], "DENY");
        assert!(dir.path().join("nested/root").is_dir());
    }

    #[tokio::test]
    async fn oversized_bodies_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(r#"{{"code":"{}"}}"#, "x".repeat(200));
        let resp = app(dir.path())
            .oneshot(
                Request::post("/api/public/execute")
                    .header("content-type", "application/json")
                    .header("content-length", body.len())
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn oversized_bodies_are_refused_on_authenticated_routes() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(r#"{{"code":"{}"}}"#, "x".repeat(200));
        let resp = app(dir.path())
            .oneshot(
                Request::post("/api/execute")
                    .header("content-type", "application/json")
                    .header("content-length", body.len())
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(resp.headers().get("access-control-allow-origin").is_none());
    }
}
