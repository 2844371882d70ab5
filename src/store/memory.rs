use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::EndpointStore;
use crate::models::{is_reserved_path, Endpoint, ExecutionLogEntry, HttpMethod, NewEndpoint, VariableBundle};

/// In-process store for development and tests. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    endpoints: DashMap<Uuid, Endpoint>,
    bundles: DashMap<Uuid, VariableBundle>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with a unique violation if `(method, path)` is taken.
    pub fn insert_endpoint(&self, new: NewEndpoint) -> Result<Endpoint, sqlx::Error> {
        if is_reserved_path(&new.path) {
            return Err(sqlx::Error::Protocol(format!("reserved endpoint path {}", new.path)));
        }
        let taken = self
            .endpoints
            .iter()
            .any(|e| e.method == new.method.as_str() && e.path == new.path);
        if taken {
            return Err(sqlx::Error::Protocol(format!(
                "duplicate endpoint {} {}",
                new.method.as_str(),
                new.path
            )));
        }

        let now = Utc::now();
        let endpoint = Endpoint {
            id: Uuid::now_v7(),
            method: new.method.as_str().to_string(),
            path: new.path,
            code: new.code,
            variables_id: new.variables_id,
            category_id: new.category_id,
            inline_variables: new.inline_variables,
            execution_log: serde_json::Value::Array(Vec::new()),
            created_at: now,
            updated_at: now,
        };
        self.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(endpoint)
    }

    pub fn insert_bundle(&self, title: &str, lines: Vec<String>) -> VariableBundle {
        let bundle = VariableBundle {
            id: Uuid::now_v7(),
            title: title.to_string(),
            lines,
            color: None,
            created_at: Utc::now(),
        };
        self.bundles.insert(bundle.id, bundle.clone());
        bundle
    }
}

#[async_trait]
impl EndpointStore for MemoryStore {
    async fn find_endpoint(
        &self,
        method: HttpMethod,
        path: &str,
    ) -> Result<Option<Endpoint>, sqlx::Error> {
        Ok(self
            .endpoints
            .iter()
            .find(|e| e.method == method.as_str() && e.path == path)
            .map(|e| e.value().clone()))
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, sqlx::Error> {
        Ok(self.endpoints.get(&id).map(|e| e.value().clone()))
    }

    async fn variable_lines(&self, id: Uuid) -> Result<Option<Vec<String>>, sqlx::Error> {
        Ok(self.bundles.get(&id).map(|b| b.lines.clone()))
    }

    async fn append_log(&self, endpoint_id: Uuid, entry: &ExecutionLogEntry) -> Result<(), sqlx::Error> {
        let value = serde_json::to_value(entry).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let mut endpoint = self
            .endpoints
            .get_mut(&endpoint_id)
            .ok_or(sqlx::Error::RowNotFound)?;

        if !endpoint.execution_log.is_array() {
            endpoint.execution_log = serde_json::Value::Array(Vec::new());
        }
        if let Some(entries) = endpoint.execution_log.as_array_mut() {
            entries.push(value);
        }
        endpoint.updated_at = Utc::now();
        Ok(())
    }

    async fn clear_log(&self, endpoint_id: Uuid) -> Result<(), sqlx::Error> {
        let mut endpoint = self
            .endpoints
            .get_mut(&endpoint_id)
            .ok_or(sqlx::Error::RowNotFound)?;
        endpoint.execution_log = serde_json::Value::Array(Vec::new());
        endpoint.updated_at = Utc::now();
        Ok(())
    }
}
