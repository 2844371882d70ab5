use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ExecutionLogEntry;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub method: String,
    pub path: String,
    pub code: String,
    pub variables_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub inline_variables: bool,
    pub execution_log: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Entries in the stored log, oldest first. Malformed entries are skipped.
    pub fn log_entries(&self) -> Vec<ExecutionLogEntry> {
        self.execution_log
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| serde_json::from_value(e.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Input for creating an endpoint.
#[derive(Debug, Clone)]
pub struct NewEndpoint {
    pub method: HttpMethod,
    pub path: String,
    pub code: String,
    pub variables_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub inline_variables: bool,
}

impl NewEndpoint {
    pub fn new(method: HttpMethod, path: &str, code: &str) -> Self {
        Self {
            method,
            path: normalize_path(path),
            code: code.to_string(),
            variables_id: None,
            category_id: None,
            inline_variables: false,
        }
    }

    pub fn with_variables(mut self, variables_id: Uuid, inline: bool) -> Self {
        self.variables_id = Some(variables_id);
        self.inline_variables = inline;
        self
    }
}

/// The methods an endpoint can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }

    pub fn from_http(method: &axum::http::Method) -> Option<Self> {
        match *method {
            axum::http::Method::GET => Some(HttpMethod::Get),
            axum::http::Method::POST => Some(HttpMethod::Post),
            _ => None,
        }
    }
}

/// Paths the fixed execute routes answer before dispatch sees them.
pub const RESERVED_PATHS: [&str; 2] = ["/execute", "/public/execute"];

/// Whether an endpoint at `path` would be unreachable behind a fixed route.
pub fn is_reserved_path(path: &str) -> bool {
    RESERVED_PATHS.contains(&normalize_path(path).as_str())
}

/// `"/a/b/"`, `"a/b"` and `"//a/b"` all become `"/a/b"`.
pub fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}
