//! Engine adapters: the capability set the unit pipeline drives.
//!
//! Two families exist, SQL (MySQL wire) and DOC (Elasticsearch wire). An
//! adapter instance is owned by exactly one worker for one unit; nothing
//! here is shared, and `close` releases the underlying network resources
//! deterministically.

pub mod doc;
pub mod sql;

use async_trait::async_trait;

use datatrac_db::models::{DataSource, EngineKind};

use crate::credentials::{self, SecretKey};
use crate::error::AdapterError;

/// One record in transit: a JSON object keyed by column/field name.
///
/// Using one representation for both families lets a single pipeline serve
/// SQL↔SQL, SQL↔DOC, and DOC↔DOC flows.
pub type Record = serde_json::Value;

/// Continuation token for batch reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Row offset into an ordered scan (SQL engines).
    Offset(u64),
    /// Server-side continuation token (DOC scroll handle).
    Token(String),
}

/// Reference to a table or index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    /// Schema/database qualifier; `None` for index entities.
    pub schema: Option<String>,
    pub name: String,
}

impl EntityRef {
    pub fn table(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    pub fn index(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Source-entity structure, for same-family cloning under the `drop` policy.
#[derive(Debug, Clone)]
pub enum EntityShape {
    /// CREATE TABLE DDL as reported by the source engine.
    Sql { ddl: String },
    /// Index mappings and (portable) settings.
    Doc {
        mappings: serde_json::Value,
        settings: serde_json::Value,
    },
}

/// Character set and collation of a source schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaCharset {
    pub charset: String,
    pub collation: String,
}

impl Default for SchemaCharset {
    fn default() -> Self {
        Self {
            charset: "utf8mb4".to_owned(),
            collation: "utf8mb4_general_ci".to_owned(),
        }
    }
}

/// The capability set. Readers and writers are both this trait; which side
/// an instance plays is decided by the pipeline.
#[async_trait]
pub trait EngineAdapter: Send {
    fn kind(&self) -> EngineKind;

    /// Total records in the entity, captured once before streaming.
    async fn count_records(&mut self, entity: &EntityRef) -> Result<u64, AdapterError>;

    /// Read up to `limit` records from the position described by `cursor`
    /// (`None` starts from the beginning). Returns the page and the cursor
    /// for the next page; an empty page ends the scan.
    async fn read_batch(
        &mut self,
        entity: &EntityRef,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> Result<(Vec<Record>, Option<Cursor>), AdapterError>;

    /// Append a batch of records to the entity.
    async fn write_batch(
        &mut self,
        entity: &EntityRef,
        records: &[Record],
    ) -> Result<(), AdapterError>;

    /// Report the entity's structure for cloning.
    async fn describe(&mut self, entity: &EntityRef) -> Result<EntityShape, AdapterError>;

    /// Create the entity from a source shape. Cross-family shapes are
    /// accepted only where the engine can degrade gracefully (DOC targets
    /// fall back to dynamic mappings).
    async fn create_entity(
        &mut self,
        entity: &EntityRef,
        shape: &EntityShape,
    ) -> Result<(), AdapterError>;

    async fn truncate(&mut self, entity: &EntityRef) -> Result<(), AdapterError>;

    /// Drop the entity if it exists.
    async fn drop_entity(&mut self, entity: &EntityRef) -> Result<(), AdapterError>;

    async fn entity_exists(&mut self, entity: &EntityRef) -> Result<bool, AdapterError>;

    /// Ensure the schema exists, propagating the source charset where the
    /// engine has the concept. Returns `true` when the schema was actually
    /// created. Engines without schemas return `Ok(false)`.
    async fn ensure_schema(
        &mut self,
        schema: &str,
        charset: Option<&SchemaCharset>,
    ) -> Result<bool, AdapterError>;

    /// Charset/collation of a schema; `None` when the engine has no such
    /// concept or the metadata lookup is unavailable.
    async fn schema_charset(
        &mut self,
        schema: &str,
    ) -> Result<Option<SchemaCharset>, AdapterError>;

    /// Release underlying network resources. Called on every pipeline exit.
    async fn close(&mut self);
}

/// Opens adapters for units. The seam that lets tests run the controller
/// and pipeline against in-memory engines.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn open(&self, source: &DataSource) -> Result<Box<dyn EngineAdapter>, AdapterError>;
}

/// The production factory: unseals credentials and dials the engine.
pub struct ConnectFactory {
    key: SecretKey,
}

impl ConnectFactory {
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl AdapterFactory for ConnectFactory {
    async fn open(&self, source: &DataSource) -> Result<Box<dyn EngineAdapter>, AdapterError> {
        let password = credentials::unseal(&self.key, &source.password_sealed)?;
        match source.kind {
            EngineKind::Sql => Ok(Box::new(
                sql::SqlAdapter::open(source, &password).await?,
            )),
            EngineKind::Doc => Ok(Box::new(
                doc::DocAdapter::open(source, &password).await?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ref_display() {
        assert_eq!(EntityRef::table("shop", "orders").to_string(), "shop.orders");
        assert_eq!(EntityRef::index("logs-2024").to_string(), "logs-2024");
    }

    #[test]
    fn default_charset() {
        let cs = SchemaCharset::default();
        assert_eq!(cs.charset, "utf8mb4");
        assert_eq!(cs.collation, "utf8mb4_general_ci");
    }
}
