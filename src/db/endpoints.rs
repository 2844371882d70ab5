use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{is_reserved_path, Endpoint, ExecutionLogEntry, NewEndpoint};

pub async fn create(pool: &PgPool, new: &NewEndpoint) -> Result<Endpoint, sqlx::Error> {
    if is_reserved_path(&new.path) {
        return Err(sqlx::Error::Protocol(format!("reserved endpoint path {}", new.path)));
    }
    sqlx::query_as::<_, Endpoint>(
        "INSERT INTO endpoints (method, path, code, variables_id, category_id, inline_variables)
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
    )
    .bind(new.method.as_str())
    .bind(&new.path)
    .bind(&new.code)
    .bind(new.variables_id)
    .bind(new.category_id)
    .bind(new.inline_variables)
    .fetch_one(pool)
    .await
}

/// Dispatch lookup by method and normalized path.
pub async fn find_by_route(
    pool: &PgPool,
    method: &str,
    path: &str,
) -> Result<Option<Endpoint>, sqlx::Error> {
    sqlx::query_as::<_, Endpoint>("SELECT * FROM endpoints WHERE method = $1 AND path = $2")
        .bind(method)
        .bind(path)
        .fetch_optional(pool)
        .await
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Endpoint>, sqlx::Error> {
    sqlx::query_as::<_, Endpoint>("SELECT * FROM endpoints WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Read the log, push `entry`, write the list back.
///
/// No row lock: two runs finishing together can drop one entry.
pub async fn append_log(
    pool: &PgPool,
    id: Uuid,
    entry: &ExecutionLogEntry,
) -> Result<(), sqlx::Error> {
    let current: Option<serde_json::Value> =
        sqlx::query_scalar("SELECT execution_log FROM endpoints WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    let Some(current) = current else {
        return Err(sqlx::Error::RowNotFound);
    };

    let mut entries = match current {
        serde_json::Value::Array(entries) => entries,
        _ => Vec::new(),
    };
    entries.push(serde_json::to_value(entry).map_err(|e| sqlx::Error::Encode(Box::new(e)))?);

    sqlx::query("UPDATE endpoints SET execution_log = $1, updated_at = now() WHERE id = $2")
        .bind(serde_json::Value::Array(entries))
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn clear_log(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    let result = sqlx::query(
        "UPDATE endpoints SET execution_log = '[]'::jsonb, updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}
