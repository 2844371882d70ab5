//! Turns execution outcomes into HTTP responses.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::sandbox::{ExecError, ExecutionReport, ScriptResponse};

const NO_OUTPUT: &str = "Script executed successfully (no output)";

/// A request-bound run that completed. The script's own `response` wins when
/// it set a body; otherwise the output goes back in the success envelope.
///
/// Errs with a message when the script asked for an impossible status.
pub fn direct_success(report: &ExecutionReport) -> Result<Response, String> {
    match &report.response {
        Some(response) if !response.body.is_null() => script_response(response),
        _ => {
            let output = if report.output.is_empty() {
                NO_OUTPUT.to_string()
            } else {
                report.output.clone()
            };
            Ok(Json(json!({
                "success": true,
                "output": output,
                "error": null,
            }))
            .into_response())
        }
    }
}

fn script_response(response: &ScriptResponse) -> Result<Response, String> {
    let status = response
        .status
        .as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .and_then(|n| StatusCode::from_u16(n).ok())
        .ok_or_else(|| format!("Invalid response status: {}", response.status))?;

    let mut resp = match &response.body {
        Value::String(text) => text.clone().into_response(),
        other => Json(other.clone()).into_response(),
    };
    *resp.status_mut() = status;

    if let Some(headers) = response.headers.as_object() {
        for (name, value) in headers {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    resp.headers_mut().insert(name, value);
                }
                _ => tracing::warn!(header = %name, "Skipping invalid response header set by script"),
            }
        }
    }

    Ok(resp)
}

/// An async-wrapped run that completed, whatever the snippet did inside.
pub fn async_success(report: &ExecutionReport) -> Response {
    Json(json!({
        "success": true,
        "output": report.output,
        "consoleOutput": report.console,
        "returnValue": report.return_value,
        "error": null,
    }))
    .into_response()
}

/// A script-level failure, already rendered against its source.
pub fn script_failure(diagnostic: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "success": false,
            "output": null,
            "error": diagnostic,
        })),
    )
        .into_response()
}

/// Something outside the script broke.
pub fn server_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "output": null,
            "error": format!("Server Error: {message}"),
        })),
    )
        .into_response()
}

pub fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Endpoint not found" })),
    )
        .into_response()
}

/// Failure response for `err`, diagnostics rendered against `source`.
pub fn exec_failure(err: &ExecError, source: &str) -> Response {
    match err {
        ExecError::Script(failure) => script_failure(failure.diagnostic(source)),
        ExecError::Host(message) => server_error(message),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn report(output: &str, response: Option<ScriptResponse>) -> ExecutionReport {
        ExecutionReport {
            output: output.to_string(),
            console: output.to_string(),
            return_value: None,
            response,
            elapsed: Duration::from_millis(1),
        }
    }

    fn script(status: Value, headers: Value, body: Value) -> ScriptResponse {
        ScriptResponse {
            status,
            headers,
            body,
        }
    }

    #[test]
    fn body_is_returned_with_status_and_headers() {
        let resp = direct_success(&report(
            "",
            Some(script(
                json!(201),
                json!({ "x-trace": "abc", "bad header": "v" }),
                json!({ "ok": true }),
            )),
        ))
        .unwrap();

        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["x-trace"], "abc");
        assert!(resp.headers().get("bad header").is_none());
        assert_eq!(resp.headers()["content-type"], "application/json");
    }

    #[test]
    fn string_body_is_text() {
        let resp = direct_success(&report(
            "",
            Some(script(json!(200), json!({}), json!("hello"))),
        ))
        .unwrap();
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }

    #[test]
    fn script_content_type_overrides_default() {
        let resp = direct_success(&report(
            "",
            Some(script(
                json!(200),
                json!({ "content-type": "text/html" }),
                json!("<b>hi</b>"),
            )),
        ))
        .unwrap();
        assert_eq!(resp.headers()["content-type"], "text/html");
    }

    #[test]
    fn out_of_range_status_is_rejected() {
        let err = direct_success(&report(
            "",
            Some(script(json!(1200), json!({}), json!("x"))),
        ))
        .unwrap_err();
        assert_eq!(err, "Invalid response status: 1200");

        assert!(direct_success(&report("", Some(script(json!("abc"), json!({}), json!(1))))).is_err());
    }

    #[test]
    fn null_body_falls_back_to_envelope() {
        let resp = direct_success(&report(
            "",
            Some(script(json!(418), json!({}), Value::Null)),
        ))
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
