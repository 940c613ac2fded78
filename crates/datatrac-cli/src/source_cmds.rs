//! `datatrac source` commands: manage data-source connection descriptors.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use datatrac_core::credentials::{self, SecretKey};
use datatrac_db::models::EngineKind;
use datatrac_db::queries::data_sources as source_db;

/// Add a data source, sealing the password under the deployment key.
#[allow(clippy::too_many_arguments)]
pub async fn run_add(
    pool: &PgPool,
    key: &SecretKey,
    name: &str,
    kind: &str,
    host: &str,
    port: i32,
    username: &str,
    password: &str,
    default_schema: Option<&str>,
) -> Result<()> {
    let kind: EngineKind = kind
        .parse()
        .map_err(|e| anyhow::anyhow!("{e} (expected sql or doc)"))?;

    if source_db::get_data_source_by_name(pool, name).await?.is_some() {
        bail!("data source {name:?} already exists");
    }

    let sealed = credentials::seal(key, password)
        .map_err(|e| anyhow::anyhow!("failed to seal password: {e}"))?;

    let source = source_db::insert_data_source(
        pool,
        &source_db::NewDataSource {
            name,
            kind,
            host,
            port,
            username,
            password_sealed: &sealed,
            default_schema,
        },
    )
    .await?;

    println!("Data source added: {} ({})", source.name, source.id);
    println!("  kind = {}, endpoint = {}:{}", source.kind, source.host, source.port);
    Ok(())
}

/// List all data sources.
pub async fn run_list(pool: &PgPool) -> Result<()> {
    let sources = source_db::list_data_sources(pool).await?;
    if sources.is_empty() {
        println!("No data sources configured.");
        return Ok(());
    }

    println!("Data sources ({}):", sources.len());
    for source in &sources {
        let schema = source
            .default_schema
            .as_deref()
            .map(|s| format!(", schema={s}"))
            .unwrap_or_default();
        println!(
            "  {} [{}] {}:{} user={}{schema} ({})",
            source.name, source.kind, source.host, source.port, source.username, source.id
        );
    }
    Ok(())
}

/// Remove a data source by name.
pub async fn run_remove(pool: &PgPool, name: &str) -> Result<()> {
    let source = source_db::get_data_source_by_name(pool, name)
        .await?
        .with_context(|| format!("data source {name:?} not found"))?;

    let deleted = source_db::delete_data_source(pool, source.id).await?;
    if deleted == 0 {
        bail!("data source {name:?} was not deleted (still referenced by a task?)");
    }
    println!("Data source {name} removed.");
    Ok(())
}
