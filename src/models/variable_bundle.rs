use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reusable code prelude.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct VariableBundle {
    pub id: Uuid,
    pub title: String,
    pub lines: Vec<String>,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The prelude lines, in order, followed by the endpoint code.
pub fn with_prelude(lines: &[String], code: &str) -> String {
    if lines.is_empty() {
        return code.to_string();
    }
    format!("{}\n{code}", lines.join("\n"))
}
