use sqlx::PgPool;
use uuid::Uuid;

use crate::models::VariableBundle;

pub async fn create(
    pool: &PgPool,
    title: &str,
    lines: &[String],
    color: Option<&str>,
) -> Result<VariableBundle, sqlx::Error> {
    sqlx::query_as::<_, VariableBundle>(
        "INSERT INTO variable_bundles (title, lines, color) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(title)
    .bind(lines)
    .bind(color)
    .fetch_one(pool)
    .await
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<VariableBundle>, sqlx::Error> {
    sqlx::query_as::<_, VariableBundle>("SELECT * FROM variable_bundles WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}
