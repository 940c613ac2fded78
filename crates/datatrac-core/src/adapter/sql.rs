//! SQL engine adapter (MySQL wire protocol).
//!
//! Cursors are `(limit, offset)` scans. Identifiers are validated before
//! they reach an identifier position; values always go through positional
//! placeholder binds. Byte values coming back from the driver are
//! hex-encoded before handoff, so records stay textual JSON.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row, TypeInfo};

use datatrac_db::models::{DataSource, EngineKind};

use crate::error::AdapterError;

use super::{Cursor, EngineAdapter, EntityRef, EntityShape, Record, SchemaCharset};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Adapter over one MySQL-family server.
pub struct SqlAdapter {
    pool: MySqlPool,
}

impl SqlAdapter {
    /// Open a connection with a bounded timeout. One unit owns the adapter,
    /// so the pool is kept at a single connection.
    pub async fn open(source: &DataSource, password: &str) -> Result<Self, AdapterError> {
        let port: u16 = source.port.try_into().map_err(|_| AdapterError::Connect {
            host: source.host.clone(),
            port: source.port,
            message: "port out of range".to_owned(),
        })?;

        let options = MySqlConnectOptions::new()
            .host(&source.host)
            .port(port)
            .username(&source.username)
            .password(password);

        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| AdapterError::Connect {
                host: source.host.clone(),
                port: source.port,
                message: e.to_string(),
            })?;

        Ok(Self { pool })
    }
}

/// Table/schema names must match `^[A-Za-z0-9_-]{1,64}$` before they are
/// allowed anywhere near an identifier position.
fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn quote_ident(name: &str) -> Result<String, AdapterError> {
    if !valid_identifier(name) {
        return Err(AdapterError::IllegalIdentifier(name.to_owned()));
    }
    Ok(format!("`{name}`"))
}

fn quote_entity(entity: &EntityRef) -> Result<String, AdapterError> {
    let name = quote_ident(&entity.name)?;
    match &entity.schema {
        Some(schema) => Ok(format!("{}.{name}", quote_ident(schema)?)),
        None => Ok(name),
    }
}

/// Convert one driver row into a JSON object, column by column.
fn row_to_record(row: &MySqlRow) -> Record {
    let mut object = Map::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, i, column.type_info().name());
        object.insert(column.name().to_owned(), value);
    }
    Value::Object(object)
}

fn decode_column(row: &MySqlRow, i: usize, type_name: &str) -> Value {
    let decoded = match type_name {
        "BOOLEAN" => row.try_get::<Option<bool>, _>(i).map(|v| v.map(Value::from)),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<Option<i64>, _>(i).map(|v| v.map(Value::from))
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => row.try_get::<Option<u64>, _>(i).map(|v| v.map(Value::from)),
        "FLOAT" => row.try_get::<Option<f32>, _>(i).map(|v| v.map(Value::from)),
        "DOUBLE" => row.try_get::<Option<f64>, _>(i).map(|v| v.map(Value::from)),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(i)
            .map(|v| v.map(|d| Value::from(d.to_string()))),
        "TIME" => row
            .try_get::<Option<chrono::NaiveTime>, _>(i)
            .map(|v| v.map(|t| Value::from(t.to_string()))),
        "DATETIME" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(i)
            .map(|v| v.map(|dt| Value::from(dt.format("%Y-%m-%d %H:%M:%S").to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
            .map(|v| v.map(|dt| Value::from(dt.format("%Y-%m-%d %H:%M:%S").to_string()))),
        "JSON" => row.try_get::<Option<Value>, _>(i),
        _ => row.try_get::<Option<String>, _>(i).map(|v| v.map(Value::from)),
    };

    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        // Unknown or binary column: surface bytes as hex text.
        Err(_) => match row.try_get::<Option<Vec<u8>>, _>(i) {
            Ok(Some(bytes)) => Value::from(hex::encode(bytes)),
            _ => Value::Null,
        },
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        // Nested structures land as their JSON text.
        other => query.bind(other.to_string()),
    }
}

#[async_trait]
impl EngineAdapter for SqlAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Sql
    }

    async fn count_records(&mut self, entity: &EntityRef) -> Result<u64, AdapterError> {
        let target = quote_entity(entity)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {target}"))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AdapterError::Read(format!("count on {entity}: {e}")))?;
        Ok(count.max(0) as u64)
    }

    async fn read_batch(
        &mut self,
        entity: &EntityRef,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> Result<(Vec<Record>, Option<Cursor>), AdapterError> {
        let offset = match cursor {
            None => 0,
            Some(Cursor::Offset(o)) => o,
            Some(Cursor::Token(_)) => {
                return Err(AdapterError::Unsupported(
                    "SQL reads use offset cursors".into(),
                ));
            }
        };

        let target = quote_entity(entity)?;
        let rows = sqlx::query(&format!("SELECT * FROM {target} LIMIT ? OFFSET ?"))
            .bind(limit as u64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AdapterError::Read(format!("read batch from {entity}: {e}")))?;

        let records: Vec<Record> = rows.iter().map(row_to_record).collect();
        let next = Some(Cursor::Offset(offset + records.len() as u64));
        Ok((records, next))
    }

    async fn write_batch(
        &mut self,
        entity: &EntityRef,
        records: &[Record],
    ) -> Result<(), AdapterError> {
        if records.is_empty() {
            return Ok(());
        }

        let target = quote_entity(entity)?;

        // Column set comes from the first record; later records supply NULL
        // for anything they lack.
        let first = records[0]
            .as_object()
            .ok_or_else(|| AdapterError::Write("record is not an object".into()))?;
        let columns: Vec<&String> = first.keys().collect();
        if columns.is_empty() {
            return Err(AdapterError::Write("record has no fields".into()));
        }
        let mut column_sql = Vec::with_capacity(columns.len());
        for column in &columns {
            column_sql.push(quote_ident(column)?);
        }

        let placeholder_row = format!("({})", vec!["?"; columns.len()].join(", "));
        let placeholders = vec![placeholder_row; records.len()].join(", ");
        let statement = format!(
            "INSERT INTO {target} ({}) VALUES {placeholders}",
            column_sql.join(", ")
        );

        let mut query = sqlx::query(&statement);
        for record in records {
            let object = record
                .as_object()
                .ok_or_else(|| AdapterError::Write("record is not an object".into()))?;
            for column in &columns {
                query = bind_value(query, object.get(*column).unwrap_or(&Value::Null));
            }
        }

        query
            .execute(&self.pool)
            .await
            .map_err(|e| AdapterError::Write(format!("write batch to {entity}: {e}")))?;
        Ok(())
    }

    async fn describe(&mut self, entity: &EntityRef) -> Result<EntityShape, AdapterError> {
        let target = quote_entity(entity)?;
        let row = sqlx::query(&format!("SHOW CREATE TABLE {target}"))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AdapterError::Schema(format!("describe {entity}: {e}")))?;
        let ddl: String = row
            .try_get(1)
            .map_err(|e| AdapterError::Schema(format!("describe {entity}: {e}")))?;
        Ok(EntityShape::Sql { ddl })
    }

    async fn create_entity(
        &mut self,
        entity: &EntityRef,
        shape: &EntityShape,
    ) -> Result<(), AdapterError> {
        let EntityShape::Sql { ddl } = shape else {
            return Err(AdapterError::Unsupported(
                "cannot clone a document index into a SQL table".into(),
            ));
        };

        let target = quote_entity(entity)?;
        // The source DDL names the source table; keep everything from the
        // column list onward (including charset/collation table options).
        let body = ddl
            .find('(')
            .map(|pos| &ddl[pos..])
            .ok_or_else(|| AdapterError::Schema(format!("unparseable DDL for {entity}")))?;
        let statement = format!("CREATE TABLE {target} {body}");

        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| AdapterError::Schema(format!("create {entity}: {e}")))?;
        Ok(())
    }

    async fn truncate(&mut self, entity: &EntityRef) -> Result<(), AdapterError> {
        let target = quote_entity(entity)?;
        sqlx::query(&format!("TRUNCATE TABLE {target}"))
            .execute(&self.pool)
            .await
            .map_err(|e| AdapterError::Schema(format!("truncate {entity}: {e}")))?;
        Ok(())
    }

    async fn drop_entity(&mut self, entity: &EntityRef) -> Result<(), AdapterError> {
        let target = quote_entity(entity)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {target}"))
            .execute(&self.pool)
            .await
            .map_err(|e| AdapterError::Schema(format!("drop {entity}: {e}")))?;
        Ok(())
    }

    async fn entity_exists(&mut self, entity: &EntityRef) -> Result<bool, AdapterError> {
        let schema = entity.schema.as_deref().ok_or_else(|| {
            AdapterError::IllegalIdentifier(format!("{entity}: table without schema"))
        })?;
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
        )
        .bind(schema)
        .bind(&entity.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AdapterError::Read(format!("exists check on {entity}: {e}")))?;
        Ok(found.is_some())
    }

    async fn ensure_schema(
        &mut self,
        schema: &str,
        charset: Option<&SchemaCharset>,
    ) -> Result<bool, AdapterError> {
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?",
        )
        .bind(schema)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AdapterError::Schema(format!("schema lookup for {schema}: {e}")))?;
        if found.is_some() {
            return Ok(false);
        }

        let quoted = quote_ident(schema)?;
        let default = SchemaCharset::default();
        let cs = charset.unwrap_or(&default);
        if !valid_identifier(&cs.charset) || !valid_identifier(&cs.collation) {
            return Err(AdapterError::IllegalIdentifier(format!(
                "{}/{}",
                cs.charset, cs.collation
            )));
        }
        let statement = format!(
            "CREATE DATABASE {quoted} CHARACTER SET {} COLLATE {}",
            cs.charset, cs.collation
        );
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| AdapterError::Schema(format!("create schema {schema}: {e}")))?;
        Ok(true)
    }

    async fn schema_charset(
        &mut self,
        schema: &str,
    ) -> Result<Option<SchemaCharset>, AdapterError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT DEFAULT_CHARACTER_SET_NAME, DEFAULT_COLLATION_NAME \
             FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?",
        )
        .bind(schema)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AdapterError::Read(format!("charset lookup for {schema}: {e}")))?;

        Ok(row.map(|(charset, collation)| SchemaCharset { charset, collation }))
    }

    async fn close(&mut self) {
        self.pool.close().await;
    }
}
