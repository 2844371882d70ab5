use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use chrono::Utc;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::models::{normalize_path, with_prelude, Endpoint, ExecutionLogEntry, HttpMethod};
use crate::request;
use crate::routes::shaper;
use crate::sandbox::{diagnostic, ExecError, ExecutionReport, SandboxSpec};
use crate::state::SharedState;

/// `GET|POST /api/{*path}`: run the endpoint bound to this method and path.
pub async fn dispatch(
    State(state): State<SharedState>,
    _user: AuthUser,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let http_method = HttpMethod::from_http(&method).ok_or_else(shaper::not_found)?;
    let path = normalize_path(&path);

    let endpoint = state
        .store
        .find_endpoint(http_method, &path)
        .await
        .map_err(|e| {
            tracing::error!("Endpoint lookup failed for {} {path}: {e}", http_method.as_str());
            shaper::server_error(&e.to_string())
        })?
        .ok_or_else(shaper::not_found)?;

    let source = source_with_prelude(&state, &endpoint).await?;

    let descriptor = request::describe(&method, &uri, &headers, body).await;
    let request_text = serde_json::to_string(&descriptor).unwrap_or_default();

    let spec = SandboxSpec::direct(source.clone(), descriptor, state.capabilities.clone());
    let result = state.host.run(spec).await;

    let (response, entry) = match result {
        Ok(report) => match shaper::direct_success(&report) {
            Ok(response) => (response, log_entry(&report, request_text, true)),
            Err(message) => {
                tracing::warn!(endpoint_id = %endpoint.id, "{message}");
                let response = shaper::script_failure(diagnostic::render(&message, None, &source));
                (response, log_entry(&report, request_text, false))
            }
        },
        Err(err) => {
            match &err {
                ExecError::Script(failure) => tracing::warn!(
                    endpoint_id = %endpoint.id,
                    timed_out = failure.timed_out,
                    "Endpoint script failed: {}",
                    failure.message
                ),
                ExecError::Host(message) => tracing::error!(
                    endpoint_id = %endpoint.id,
                    "Endpoint execution failed: {message}"
                ),
            }
            let response = shaper::exec_failure(&err, &source);
            (response, failure_entry(&err, request_text))
        }
    };

    tracing::info!(
        endpoint_id = %endpoint.id,
        method = http_method.as_str(),
        path = %endpoint.path,
        success = entry.success,
        status = response.status().as_u16(),
        "Endpoint executed"
    );

    record(&state, endpoint.id, &entry).await;
    Ok(response)
}

/// The code actually run: the bundle's lines first when one is attached.
async fn source_with_prelude(state: &SharedState, endpoint: &Endpoint) -> Result<String, Response> {
    let Some(variables_id) = endpoint.variables_id else {
        return Ok(endpoint.code.clone());
    };

    match state.store.variable_lines(variables_id).await {
        Ok(Some(lines)) => Ok(with_prelude(&lines, &endpoint.code)),
        Ok(None) => {
            tracing::warn!(
                endpoint_id = %endpoint.id,
                variables_id = %variables_id,
                "Variable bundle not found, running endpoint code alone"
            );
            Ok(endpoint.code.clone())
        }
        Err(e) => {
            tracing::error!("Variable bundle lookup failed for {variables_id}: {e}");
            Err(shaper::server_error(&e.to_string()))
        }
    }
}

fn log_entry(report: &ExecutionReport, request: String, success: bool) -> ExecutionLogEntry {
    ExecutionLogEntry {
        timestamp: Utc::now(),
        output: report.output.clone(),
        console: report.console.clone(),
        return_value: report.return_value.clone(),
        request,
        success,
    }
}

fn failure_entry(err: &ExecError, request: String) -> ExecutionLogEntry {
    let (output, console) = match err {
        ExecError::Script(failure) => (failure.output.clone(), failure.console.clone()),
        ExecError::Host(_) => (String::new(), String::new()),
    };
    ExecutionLogEntry {
        timestamp: Utc::now(),
        output,
        console,
        return_value: None,
        request,
        success: false,
    }
}

/// Append to the endpoint's log. A failed append never changes the response.
async fn record(state: &SharedState, endpoint_id: Uuid, entry: &ExecutionLogEntry) {
    if let Err(e) = state.store.append_log(endpoint_id, entry).await {
        tracing::error!(endpoint_id = %endpoint_id, "Failed to append execution log: {e}");
    }
}
