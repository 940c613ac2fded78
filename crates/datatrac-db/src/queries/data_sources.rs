//! Database query functions for the `data_sources` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{DataSource, EngineKind};

/// Parameters for inserting a new data source row.
#[derive(Debug, Clone)]
pub struct NewDataSource<'a> {
    pub name: &'a str,
    pub kind: EngineKind,
    pub host: &'a str,
    pub port: i32,
    pub username: &'a str,
    /// Already sealed; callers encrypt before handing the value to the store.
    pub password_sealed: &'a str,
    pub default_schema: Option<&'a str>,
}

/// Insert a new data source row. Returns the inserted row with
/// server-generated defaults (id, timestamps).
pub async fn insert_data_source(pool: &PgPool, new: &NewDataSource<'_>) -> Result<DataSource> {
    let source = sqlx::query_as::<_, DataSource>(
        "INSERT INTO data_sources (name, kind, host, port, username, password_sealed, default_schema) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.name)
    .bind(new.kind)
    .bind(new.host)
    .bind(new.port)
    .bind(new.username)
    .bind(new.password_sealed)
    .bind(new.default_schema)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert data source {}", new.name))?;

    Ok(source)
}

/// Fetch a single data source by ID.
pub async fn get_data_source(pool: &PgPool, id: Uuid) -> Result<Option<DataSource>> {
    let source = sqlx::query_as::<_, DataSource>("SELECT * FROM data_sources WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch data source")?;

    Ok(source)
}

/// Fetch a single data source by name.
pub async fn get_data_source_by_name(pool: &PgPool, name: &str) -> Result<Option<DataSource>> {
    let source = sqlx::query_as::<_, DataSource>("SELECT * FROM data_sources WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch data source by name")?;

    Ok(source)
}

/// List all data sources, ordered by name.
pub async fn list_data_sources(pool: &PgPool) -> Result<Vec<DataSource>> {
    let sources =
        sqlx::query_as::<_, DataSource>("SELECT * FROM data_sources ORDER BY name ASC")
            .fetch_all(pool)
            .await
            .context("failed to list data sources")?;

    Ok(sources)
}

/// Delete a data source by ID. Fails if any task still references it.
pub async fn delete_data_source(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM data_sources WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete data source")?;

    Ok(result.rows_affected())
}
