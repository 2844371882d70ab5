use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::request::client_ip;
use crate::routes::shaper;
use crate::sandbox::{Capabilities, ExecError, SandboxSpec};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
}

/// `POST /api/execute`: ad-hoc run, standard module set.
pub async fn execute(
    State(state): State<SharedState>,
    _user: AuthUser,
    body: Bytes,
) -> Response {
    run_snippet(&state, state.capabilities.clone(), &body).await
}

/// `POST /api/public/execute`: ad-hoc run without `fetch`, limited per client.
pub async fn public_execute(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = client_ip(&headers, addr.ip(), &state.config.trusted_proxies);
    if let Err(retry_after) = state.public_limiter.check(ip) {
        tracing::info!(client_ip = %ip, "Public execute rate limited");
        return AppError::RateLimited(retry_after).into_response();
    }

    run_snippet(&state, state.public_capabilities.clone(), &body).await
}

pub async fn public_options() -> Response {
    (
        [
            ("Access-Control-Allow-Origin", "*"),
            ("Access-Control-Allow-Methods", "POST, OPTIONS"),
            ("Access-Control-Allow-Headers", "Content-Type"),
            ("Access-Control-Max-Age", "86400"),
        ],
        StatusCode::NO_CONTENT,
    )
        .into_response()
}

async fn run_snippet(state: &SharedState, capabilities: Arc<Capabilities>, body: &[u8]) -> Response {
    let request: ExecuteRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("Malformed execute body: {e}");
            return shaper::server_error(&e.to_string());
        }
    };

    let spec = SandboxSpec::async_wrapped(request.code.clone(), capabilities);
    match state.host.run(spec).await {
        Ok(report) => {
            tracing::debug!(
                mode = "async",
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Snippet executed"
            );
            shaper::async_success(&report)
        }
        Err(err) => {
            match &err {
                ExecError::Script(failure) => {
                    tracing::warn!(mode = "async", "Snippet failed: {}", failure.message)
                }
                ExecError::Host(message) => {
                    tracing::error!(mode = "async", "Snippet execution failed: {message}")
                }
            }
            shaper::exec_failure(&err, &request.code)
        }
    }
}
