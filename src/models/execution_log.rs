use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One run, as stored in an endpoint's execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub output: String,
    pub console: String,
    pub return_value: Option<String>,
    /// The request descriptor, as JSON text.
    pub request: String,
    pub success: bool,
}
