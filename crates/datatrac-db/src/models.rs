use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Engine family of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Sql,
    Doc,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sql => "sql",
            Self::Doc => "doc",
        };
        f.write_str(s)
    }
}

impl FromStr for EngineKind {
    type Err = EngineKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sql" => Ok(Self::Sql),
            "doc" => Ok(Self::Doc),
            other => Err(EngineKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EngineKind`] string.
#[derive(Debug, Clone)]
pub struct EngineKindParseError(pub String);

impl fmt::Display for EngineKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid engine kind: {:?}", self.0)
    }
}

impl std::error::Error for EngineKindParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle status of a sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Configured,
    Running,
    Paused,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "configured" => Ok(Self::Configured),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle status of a single unit (one table or index) within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl FromStr for UnitStatus {
    type Err = UnitStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            other => Err(UnitStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`UnitStatus`] string.
#[derive(Debug, Clone)]
pub struct UnitStatusParseError(pub String);

impl fmt::Display for UnitStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid unit status: {:?}", self.0)
    }
}

impl std::error::Error for UnitStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of unit: a relational table or a document index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Table,
    Index,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Table => "table",
            Self::Index => "index",
        };
        f.write_str(s)
    }
}

impl FromStr for UnitKind {
    type Err = UnitKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(Self::Table),
            "index" => Ok(Self::Index),
            other => Err(UnitKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`UnitKind`] string.
#[derive(Debug, Clone)]
pub struct UnitKindParseError(pub String);

impl fmt::Display for UnitKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid unit kind: {:?}", self.0)
    }
}

impl std::error::Error for UnitKindParseError {}

// ---------------------------------------------------------------------------

/// Sync mode. Only the bulk phase of `full` is executed; `incremental` is
/// recognized and runs the same bulk phase (change capture is not wired).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        };
        f.write_str(s)
    }
}

impl FromStr for SyncMode {
    type Err = SyncModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(SyncModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SyncMode`] string.
#[derive(Debug, Clone)]
pub struct SyncModeParseError(pub String);

impl fmt::Display for SyncModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid sync mode: {:?}", self.0)
    }
}

impl std::error::Error for SyncModeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A connection descriptor for one engine. Passwords are sealed at rest and
/// decrypted only inside adapter open.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DataSource {
    pub id: Uuid,
    pub name: String,
    pub kind: EngineKind,
    pub host: String,
    pub port: i32,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_sealed: String,
    pub default_schema: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A sync definition between two data sources.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncTask {
    pub id: Uuid,
    pub name: String,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub source_kind: EngineKind,
    pub target_kind: EngineKind,
    pub status: TaskStatus,
    pub is_running: bool,
    pub config: String,
    pub mode: SyncMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Intent row: one table or index the task copies. `unit_name` is
/// `schema.entity` in the target namespace.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskUnitConfig {
    pub id: Uuid,
    pub task_id: Uuid,
    pub unit_name: String,
    pub unit_kind: UnitKind,
    pub created_at: DateTime<Utc>,
}

/// State row: live progress of one unit. Exclusively mutated by the worker
/// that currently holds the unit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskUnitRuntime {
    pub id: Uuid,
    pub task_id: Uuid,
    pub unit_name: String,
    pub status: UnitStatus,
    pub total_records: i64,
    pub processed_records: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_batch_index: i64,
}

/// Append-only summary of a completed unit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskUnitHistory {
    pub id: Uuid,
    pub task_id: Uuid,
    pub unit_name: String,
    pub pattern: String,
    pub total_records: i64,
    pub duration_ms: i64,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
