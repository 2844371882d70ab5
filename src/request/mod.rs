//! Turning an inbound HTTP request into what a script sees.

pub mod client_ip;
pub mod parser;

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri};
use serde_json::Value;

use crate::sandbox::RequestDescriptor;

pub use client_ip::client_ip;

/// Headers never handed to scripts.
const HIDDEN_HEADERS: &[&str] = &["authorization", "cookie"];

/// Build the descriptor for a request-bound run.
///
/// The body is parsed by content type; anything unparseable, or an empty
/// body, becomes `{}`.
pub async fn describe(method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> RequestDescriptor {
    let mut header_map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        if HIDDEN_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        header_map
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let query = parser::parse_query(uri.query())
        .into_iter()
        .map(|(k, v)| (k, v.as_str().unwrap_or_default().to_string()))
        .collect();

    let body = parse_request_body(headers, body).await;

    RequestDescriptor {
        method: method.as_str().to_string(),
        url: uri.to_string(),
        headers: header_map,
        query,
        body,
    }
}

async fn parse_request_body(headers: &HeaderMap, body: Bytes) -> Value {
    if body.is_empty() {
        return Value::Object(Default::default());
    }

    let content_type = headers.get("content-type").and_then(|v| v.to_str().ok());
    let parsed = if content_type.is_some_and(|ct| ct.contains("multipart/form-data")) {
        parser::parse_multipart(headers, body).await
    } else {
        parser::parse_body(content_type, &body)
    };

    parsed.unwrap_or_else(|e| {
        tracing::debug!("Request body not parsed, using empty object: {e}");
        Value::Object(Default::default())
    })
}
