//! The persistence collaborator the dispatcher talks to.

mod memory;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::models::{Endpoint, ExecutionLogEntry, HttpMethod};

pub use memory::MemoryStore;

#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn find_endpoint(
        &self,
        method: HttpMethod,
        path: &str,
    ) -> Result<Option<Endpoint>, sqlx::Error>;

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, sqlx::Error>;

    /// Ordered prelude lines of a variable bundle.
    async fn variable_lines(&self, id: Uuid) -> Result<Option<Vec<String>>, sqlx::Error>;

    async fn append_log(&self, endpoint_id: Uuid, entry: &ExecutionLogEntry) -> Result<(), sqlx::Error>;

    async fn clear_log(&self, endpoint_id: Uuid) -> Result<(), sqlx::Error>;
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EndpointStore for PgStore {
    async fn find_endpoint(
        &self,
        method: HttpMethod,
        path: &str,
    ) -> Result<Option<Endpoint>, sqlx::Error> {
        db::endpoints::find_by_route(&self.pool, method.as_str(), path).await
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, sqlx::Error> {
        db::endpoints::find_by_id(&self.pool, id).await
    }

    async fn variable_lines(&self, id: Uuid) -> Result<Option<Vec<String>>, sqlx::Error> {
        Ok(db::variables::find_by_id(&self.pool, id)
            .await?
            .map(|bundle| bundle.lines))
    }

    async fn append_log(&self, endpoint_id: Uuid, entry: &ExecutionLogEntry) -> Result<(), sqlx::Error> {
        db::endpoints::append_log(&self.pool, endpoint_id, entry).await
    }

    async fn clear_log(&self, endpoint_id: Uuid) -> Result<(), sqlx::Error> {
        db::endpoints::clear_log(&self.pool, endpoint_id).await
    }
}
