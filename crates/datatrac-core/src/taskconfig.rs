//! Parsing and validation of the task config blob.
//!
//! The config is stored as opaque JSON on the task row and parsed at start
//! time. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use datatrac_db::models::UnitKind;

use crate::error::ControlError;

/// Per-batch write failure behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log the failure, drop the batch, continue with the next one.
    #[default]
    Skip,
    /// Fail the unit and cancel the whole task.
    Pause,
}

/// Pre-run action on an existing target entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetExistsPolicy {
    /// Drop-if-exists, then clone structure from the source.
    Drop,
    /// Empty the target entity; schema untouched.
    Truncate,
    /// Leave the target as it is.
    #[default]
    Append,
}

/// A prefix/suffix/replace rewrite applied to schema or entity names.
///
/// Replace runs first, then prefix and suffix are attached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NameTransform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}

impl NameTransform {
    /// Apply the rewrite to a name.
    pub fn apply(&self, name: &str) -> String {
        let mut out = match (&self.search, &self.replacement) {
            (Some(search), Some(replacement)) if !search.is_empty() => {
                name.replace(search.as_str(), replacement)
            }
            _ => name.to_owned(),
        };
        if let Some(prefix) = &self.prefix {
            out = format!("{prefix}{out}");
        }
        if let Some(suffix) = &self.suffix {
            out.push_str(suffix);
        }
        out
    }
}

/// One table mapping within a schema selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMapping {
    pub source_name: String,
    pub target_name: String,
}

/// A source schema, its target schema, and the tables copied between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSelection {
    pub source_schema: String,
    pub target_schema: String,
    #[serde(default)]
    pub tables: Vec<TableMapping>,
}

/// The parsed task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_thread_count")]
    pub thread_count: u32,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    #[serde(default)]
    pub target_exists: TargetExistsPolicy,
    #[serde(default)]
    pub selected_databases: Vec<SchemaSelection>,
    /// DOC selectors: glob-style patterns the indices were discovered by.
    #[serde(default)]
    pub index_patterns: Vec<String>,
    /// DOC selectors: the concrete source indices to copy.
    #[serde(default)]
    pub selected_indices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name_transform: Option<NameTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name_transform: Option<NameTransform>,
}

fn default_batch_size() -> u32 {
    1_000
}

fn default_thread_count() -> u32 {
    4
}

pub const BATCH_SIZE_RANGE: std::ops::RangeInclusive<u32> = 100..=10_000;
pub const THREAD_COUNT_RANGE: std::ops::RangeInclusive<u32> = 1..=32;

impl TaskConfig {
    /// Parse and validate a config blob.
    pub fn parse(blob: &str) -> Result<Self, ControlError> {
        let config: TaskConfig = serde_json::from_str(blob)
            .map_err(|e| ControlError::Validation(format!("malformed task config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Range and shape validation.
    pub fn validate(&self) -> Result<(), ControlError> {
        if !BATCH_SIZE_RANGE.contains(&self.batch_size) {
            return Err(ControlError::Validation(format!(
                "batchSize {} outside {}..={}",
                self.batch_size,
                BATCH_SIZE_RANGE.start(),
                BATCH_SIZE_RANGE.end()
            )));
        }
        if !THREAD_COUNT_RANGE.contains(&self.thread_count) {
            return Err(ControlError::Validation(format!(
                "threadCount {} outside {}..={}",
                self.thread_count,
                THREAD_COUNT_RANGE.start(),
                THREAD_COUNT_RANGE.end()
            )));
        }
        for selection in &self.selected_databases {
            if selection.source_schema.is_empty() || selection.target_schema.is_empty() {
                return Err(ControlError::Validation(
                    "schema selection with empty schema name".into(),
                ));
            }
            for table in &selection.tables {
                if table.source_name.is_empty() || table.target_name.is_empty() {
                    return Err(ControlError::Validation(format!(
                        "empty table name in schema {}",
                        selection.source_schema
                    )));
                }
            }
        }
        if self.selected_databases.is_empty() && self.selected_indices.is_empty() {
            return Err(ControlError::Validation(
                "config selects no tables and no indices".into(),
            ));
        }
        Ok(())
    }

    /// Expand the selection into concrete unit plans, one per table/index,
    /// with all name transforms applied.
    pub fn unit_plans(&self) -> Vec<UnitPlan> {
        let mut plans = Vec::new();

        for selection in &self.selected_databases {
            let target_schema = match &self.schema_name_transform {
                Some(t) => t.apply(&selection.target_schema),
                None => selection.target_schema.clone(),
            };
            for table in &selection.tables {
                let target_name = match &self.table_name_transform {
                    Some(t) => t.apply(&table.target_name),
                    None => table.target_name.clone(),
                };
                plans.push(UnitPlan {
                    unit_name: format!("{target_schema}.{target_name}"),
                    kind: UnitKind::Table,
                    source_schema: Some(selection.source_schema.clone()),
                    source_name: table.source_name.clone(),
                    target_schema: Some(target_schema.clone()),
                    target_name,
                    pattern: selection.source_schema.clone(),
                });
            }
        }

        for index in &self.selected_indices {
            let target_name = match &self.table_name_transform {
                Some(t) => t.apply(index),
                None => index.clone(),
            };
            let pattern = self
                .index_patterns
                .iter()
                .find(|p| glob_match(p, index))
                .cloned()
                .unwrap_or_else(|| "*".to_owned());
            plans.push(UnitPlan {
                unit_name: target_name.clone(),
                kind: UnitKind::Index,
                source_schema: None,
                source_name: index.clone(),
                target_schema: None,
                target_name,
                pattern,
            });
        }

        plans
    }

    /// Look up the plan for a unit by its target-namespace name.
    ///
    /// Returns `None` when the runtime row has no mapping in the current
    /// config (e.g. the config was edited between runs).
    pub fn resolve_unit(&self, unit_name: &str) -> Option<UnitPlan> {
        self.unit_plans().into_iter().find(|p| p.unit_name == unit_name)
    }
}

/// A fully-resolved unit: where to read, where to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlan {
    /// `schema.entity` for tables, the index name for indices; target namespace.
    pub unit_name: String,
    pub kind: UnitKind,
    pub source_schema: Option<String>,
    pub source_name: String,
    pub target_schema: Option<String>,
    pub target_name: String,
    /// The selection pattern the unit came from, recorded in history rows.
    pub pattern: String,
}

/// Minimal glob match supporting `*` wildcards only.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}
