use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::{with_prelude, Endpoint, ExecutionLogEntry};
use crate::state::SharedState;

#[derive(Debug, Serialize)]
pub struct ProductionCode {
    pub code: String,
    pub inlined: bool,
}

pub async fn list_logs(
    State(state): State<SharedState>,
    _user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ExecutionLogEntry>>, AppError> {
    let endpoint = load(&state, id).await?;
    Ok(Json(endpoint.log_entries()))
}

pub async fn clear_logs(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.store.clear_log(id).await.map_err(|e| match e {
        sqlx::Error::RowNotFound => AppError::NotFound("Endpoint not found".to_string()),
        other => AppError::Database(other),
    })?;

    tracing::info!(endpoint_id = %id, operator = %user.subject, "Execution log cleared");
    Ok(StatusCode::NO_CONTENT)
}

/// The code to ship: bundle lines inlined ahead of the endpoint's code when
/// the endpoint asks for it.
pub async fn production(
    State(state): State<SharedState>,
    _user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ProductionCode>, AppError> {
    let endpoint = load(&state, id).await?;

    let lines = match (endpoint.inline_variables, endpoint.variables_id) {
        (true, Some(variables_id)) => state.store.variable_lines(variables_id).await?,
        _ => None,
    };

    let production = match lines {
        Some(lines) => ProductionCode {
            code: with_prelude(&lines, &endpoint.code),
            inlined: true,
        },
        None => ProductionCode {
            code: endpoint.code,
            inlined: false,
        },
    };
    Ok(Json(production))
}

async fn load(state: &SharedState, id: Uuid) -> Result<Endpoint, AppError> {
    state
        .store
        .get_endpoint(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Endpoint not found".to_string()))
}
