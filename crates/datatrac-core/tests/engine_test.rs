//! End-to-end tests for the sync engine: controller, worker pool, and unit
//! pipeline running against in-memory mock adapters with the real
//! checkpoint store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use datatrac_core::SyncEngine;
use datatrac_core::adapter::{
    AdapterFactory, Cursor, EngineAdapter, EntityRef, EntityShape, Record, SchemaCharset,
};
use datatrac_core::error::{AdapterError, ControlError};
use datatrac_core::logbuf::LogLevel;
use datatrac_core::taskconfig::TaskConfig;
use datatrac_db::models::{EngineKind, SyncMode, TaskStatus, UnitStatus};
use datatrac_db::queries::data_sources::{NewDataSource, insert_data_source};
use datatrac_db::queries::tasks::{self as task_db, NewSyncTask};
use datatrac_db::queries::unit_configs;
use datatrac_db::queries::unit_histories;
use datatrac_db::queries::unit_runtimes as runtime_db;
use datatrac_test_utils::{create_test_db, drop_test_db};

// ===========================================================================
// Mock engine
// ===========================================================================

/// Shared in-memory engine state. Source tables are fixed row sets; writes
/// land in `written`; failures are injected per target entity by write-call
/// ordinal (1-based).
#[derive(Default)]
struct MockState {
    source_rows: HashMap<String, Vec<Record>>,
    written: HashMap<String, Vec<Record>>,
    fail_write_ordinals: HashMap<String, Vec<usize>>,
    write_calls: HashMap<String, usize>,
    write_log: Vec<String>,
    write_delay: Option<Duration>,
}

impl MockState {
    fn with_table(mut self, entity: &str, rows: usize) -> Self {
        let records = (0..rows).map(|i| json!({ "id": i as i64 })).collect();
        self.source_rows.insert(entity.to_owned(), records);
        self
    }

    fn failing_write(mut self, entity: &str, ordinal: usize) -> Self {
        self.fail_write_ordinals
            .entry(entity.to_owned())
            .or_default()
            .push(ordinal);
        self
    }

    fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }
}

struct MockAdapter {
    state: Arc<Mutex<MockState>>,
    kind: EngineKind,
}

#[async_trait]
impl EngineAdapter for MockAdapter {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn count_records(&mut self, entity: &EntityRef) -> Result<u64, AdapterError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .source_rows
            .get(&entity.to_string())
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn read_batch(
        &mut self,
        entity: &EntityRef,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> Result<(Vec<Record>, Option<Cursor>), AdapterError> {
        let offset = match cursor {
            None => 0,
            Some(Cursor::Offset(o)) => o as usize,
            Some(Cursor::Token(_)) => {
                return Err(AdapterError::Unsupported("offset cursors only".into()));
            }
        };
        let state = self.state.lock().unwrap();
        let rows = state
            .source_rows
            .get(&entity.to_string())
            .cloned()
            .unwrap_or_default();
        let end = (offset + limit as usize).min(rows.len());
        let page = if offset < rows.len() {
            rows[offset..end].to_vec()
        } else {
            Vec::new()
        };
        let next = offset + page.len();
        Ok((page, Some(Cursor::Offset(next as u64))))
    }

    async fn write_batch(
        &mut self,
        entity: &EntityRef,
        records: &[Record],
    ) -> Result<(), AdapterError> {
        let key = entity.to_string();
        let delay = {
            let mut state = self.state.lock().unwrap();
            let calls = state.write_calls.entry(key.clone()).or_insert(0);
            *calls += 1;
            let ordinal = *calls;
            state.write_log.push(key.clone());
            let fail = state
                .fail_write_ordinals
                .get(&key)
                .map(|ordinals| ordinals.contains(&ordinal))
                .unwrap_or(false);
            if fail {
                return Err(AdapterError::Write(format!(
                    "injected failure on write {ordinal} to {key}"
                )));
            }
            state
                .written
                .entry(key.clone())
                .or_default()
                .extend(records.iter().cloned());
            state.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn describe(&mut self, _entity: &EntityRef) -> Result<EntityShape, AdapterError> {
        Ok(EntityShape::Sql {
            ddl: "CREATE TABLE `mock` (`id` bigint NOT NULL)".to_owned(),
        })
    }

    async fn create_entity(
        &mut self,
        entity: &EntityRef,
        _shape: &EntityShape,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.written.entry(entity.to_string()).or_default();
        Ok(())
    }

    async fn truncate(&mut self, entity: &EntityRef) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.written.insert(entity.to_string(), Vec::new());
        Ok(())
    }

    async fn drop_entity(&mut self, entity: &EntityRef) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.written.remove(&entity.to_string());
        Ok(())
    }

    async fn entity_exists(&mut self, entity: &EntityRef) -> Result<bool, AdapterError> {
        let state = self.state.lock().unwrap();
        Ok(state.written.contains_key(&entity.to_string()))
    }

    async fn ensure_schema(
        &mut self,
        _schema: &str,
        _charset: Option<&SchemaCharset>,
    ) -> Result<bool, AdapterError> {
        Ok(false)
    }

    async fn schema_charset(
        &mut self,
        _schema: &str,
    ) -> Result<Option<SchemaCharset>, AdapterError> {
        Ok(None)
    }

    async fn close(&mut self) {}
}

struct MockFactory {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl AdapterFactory for MockFactory {
    async fn open(
        &self,
        source: &datatrac_db::models::DataSource,
    ) -> Result<Box<dyn EngineAdapter>, AdapterError> {
        Ok(Box::new(MockAdapter {
            state: Arc::clone(&self.state),
            kind: source.kind,
        }))
    }
}

// ===========================================================================
// Test harness
// ===========================================================================

struct TestHarness {
    pool: PgPool,
    db_name: String,
    state: Arc<Mutex<MockState>>,
    engine: SyncEngine,
}

impl TestHarness {
    async fn new(state: MockState) -> Self {
        let (pool, db_name) = create_test_db().await;
        let state = Arc::new(Mutex::new(state));
        let factory = Arc::new(MockFactory {
            state: Arc::clone(&state),
        });
        let engine = SyncEngine::new(pool.clone(), factory);
        Self {
            pool,
            db_name,
            state,
            engine,
        }
    }

    /// Insert two SQL data sources and a configured task, materializing the
    /// unit configs the way the task wizard does.
    async fn seed_task(&self, config: &str) -> Uuid {
        let source = insert_data_source(
            &self.pool,
            &NewDataSource {
                name: "src",
                kind: EngineKind::Sql,
                host: "localhost",
                port: 3306,
                username: "root",
                password_sealed: "00",
                default_schema: None,
            },
        )
        .await
        .expect("insert source");
        let target = insert_data_source(
            &self.pool,
            &NewDataSource {
                name: "dst",
                kind: EngineKind::Sql,
                host: "localhost",
                port: 3307,
                username: "root",
                password_sealed: "00",
                default_schema: None,
            },
        )
        .await
        .expect("insert target");

        let task = task_db::insert_task(
            &self.pool,
            &NewSyncTask {
                name: "engine-test",
                source_id: source.id,
                target_id: target.id,
                source_kind: EngineKind::Sql,
                target_kind: EngineKind::Sql,
                config,
                mode: SyncMode::Full,
            },
        )
        .await
        .expect("insert task");

        let parsed = TaskConfig::parse(config).expect("test config should parse");
        for plan in parsed.unit_plans() {
            unit_configs::insert_unit_config(&self.pool, task.id, &plan.unit_name, plan.kind)
                .await
                .expect("insert unit config");
        }
        task_db::update_task_config(&self.pool, task.id, config)
            .await
            .expect("configure task");

        task.id
    }

    async fn run_to_idle(&self, task_id: Uuid) {
        self.engine.start(task_id).await.expect("start should succeed");
        self.engine.wait_until_idle(task_id).await;
    }

    fn written(&self, entity: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.written.get(entity).map(|rows| rows.len()).unwrap_or(0)
    }

    fn write_calls(&self, entity: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.write_calls.get(entity).copied().unwrap_or(0)
    }

    async fn unit(&self, task_id: Uuid, name: &str) -> datatrac_db::models::TaskUnitRuntime {
        runtime_db::list_runtimes(&self.pool, task_id)
            .await
            .expect("list runtimes")
            .into_iter()
            .find(|u| u.unit_name == name)
            .unwrap_or_else(|| panic!("no runtime for {name}"))
    }

    async fn task_status(&self, task_id: Uuid) -> (TaskStatus, bool) {
        let task = task_db::get_task(&self.pool, task_id)
            .await
            .expect("get task")
            .expect("task exists");
        (task.status, task.is_running)
    }

    /// Poll until the aggregate processed counter reaches `target`.
    async fn wait_for_processed(&self, task_id: Uuid, target: i64) {
        for _ in 0..500 {
            let progress = runtime_db::get_unit_progress(&self.pool, task_id)
                .await
                .expect("progress");
            if progress.processed_records >= target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {target} processed records");
    }

    async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

fn two_table_config(batch_size: u32, thread_count: u32, error_policy: &str) -> String {
    format!(
        r#"{{
            "batchSize": {batch_size},
            "threadCount": {thread_count},
            "errorPolicy": "{error_policy}",
            "targetExists": "append",
            "selectedDatabases": [
                {{"sourceSchema": "shop", "targetSchema": "shop",
                  "tables": [
                    {{"sourceName": "orders", "targetName": "orders"}},
                    {{"sourceName": "users", "targetName": "users"}}
                  ]}}
            ]
        }}"#
    )
}

fn one_table_config(batch_size: u32, error_policy: &str) -> String {
    format!(
        r#"{{
            "batchSize": {batch_size},
            "threadCount": 1,
            "errorPolicy": "{error_policy}",
            "targetExists": "append",
            "selectedDatabases": [
                {{"sourceSchema": "shop", "targetSchema": "shop",
                  "tables": [{{"sourceName": "orders", "targetName": "orders"}}]}}
            ]
        }}"#
    )
}

// ===========================================================================
// Happy path
// ===========================================================================

#[tokio::test]
async fn happy_path_two_tables() {
    let state = MockState::default()
        .with_table("shop.orders", 2500)
        .with_table("shop.users", 500);
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&two_table_config(1000, 2, "skip")).await;

    harness.run_to_idle(task_id).await;

    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Completed);
    assert_eq!((orders.processed_records, orders.total_records), (2500, 2500));

    let users = harness.unit(task_id, "shop.users").await;
    assert_eq!(users.status, UnitStatus::Completed);
    assert_eq!((users.processed_records, users.total_records), (500, 500));

    assert_eq!(harness.written("shop.orders"), 2500);
    assert_eq!(harness.written("shop.users"), 500);
    // 2500 rows at batch size 1000 means exactly three writes.
    assert_eq!(harness.write_calls("shop.orders"), 3);
    assert_eq!(harness.write_calls("shop.users"), 1);

    let (status, is_running) = harness.task_status(task_id).await;
    assert_eq!(status, TaskStatus::Completed);
    assert!(!is_running);

    let histories = unit_histories::list_histories(&harness.pool, task_id)
        .await
        .expect("histories");
    assert_eq!(histories.len(), 2);

    harness.teardown().await;
}

// ===========================================================================
// Pause / resume
// ===========================================================================

#[tokio::test]
async fn pause_preserves_progress_and_resume_finishes() {
    let state = MockState::default()
        .with_table("shop.orders", 2500)
        .with_write_delay(Duration::from_millis(150));
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&one_table_config(1000, "skip")).await;

    harness.engine.start(task_id).await.expect("start");
    harness.wait_for_processed(task_id, 1000).await;
    harness.engine.pause(task_id).await.expect("pause");

    // is_running is cleared before pause returns; no unit stays running.
    let (status, is_running) = harness.task_status(task_id).await;
    assert!(!is_running);
    assert_eq!(status, TaskStatus::Paused);

    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Paused);
    assert!(orders.processed_records >= 1000 && orders.processed_records < 2500);
    assert_eq!(orders.processed_records % 1000, 0, "counter reflects whole batches");
    // The store counter matches what was actually written.
    assert_eq!(harness.written("shop.orders") as i64, orders.processed_records);

    // Resume: the scan continues from the stored counter, no duplicates.
    harness.run_to_idle(task_id).await;

    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Completed);
    assert_eq!(orders.processed_records, 2500);
    assert_eq!(harness.written("shop.orders"), 2500, "no batch may be written twice");

    let (status, _) = harness.task_status(task_id).await;
    assert_eq!(status, TaskStatus::Completed);

    harness.teardown().await;
}

#[tokio::test]
async fn pause_without_execution_is_not_running() {
    let harness = TestHarness::new(MockState::default().with_table("shop.orders", 10)).await;
    let task_id = harness.seed_task(&one_table_config(100, "skip")).await;

    let result = harness.engine.pause(task_id).await;
    assert!(matches!(result, Err(ControlError::NotRunning(_))));

    harness.teardown().await;
}

// ===========================================================================
// Error policies
// ===========================================================================

#[tokio::test]
async fn write_failure_under_skip_drops_batch_and_completes() {
    let state = MockState::default()
        .with_table("shop.orders", 3000)
        .failing_write("shop.orders", 2);
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&one_table_config(1000, "skip")).await;

    harness.run_to_idle(task_id).await;

    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Completed);
    assert_eq!(orders.total_records, 3000);
    assert_eq!(orders.processed_records, 2000, "the skipped batch is not counted");
    assert_eq!(harness.written("shop.orders"), 2000);

    let (status, _) = harness.task_status(task_id).await;
    assert_eq!(status, TaskStatus::Completed);

    let logs = harness.engine.get_logs(task_id, 100).await.expect("logs");
    assert!(
        logs.iter()
            .any(|entry| entry.level == LogLevel::Error && entry.message.contains("skipped")),
        "an error log entry must record the skipped batch"
    );

    harness.teardown().await;
}

#[tokio::test]
async fn write_failure_under_pause_fails_unit_and_task() {
    let state = MockState::default()
        .with_table("shop.orders", 3000)
        .with_table("shop.users", 5000)
        .failing_write("shop.orders", 2)
        .with_write_delay(Duration::from_millis(50));
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&two_table_config(1000, 2, "pause")).await;

    harness.run_to_idle(task_id).await;

    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Failed);
    let message = orders.error_message.expect("failed unit carries an error message");
    assert!(message.contains("injected failure"), "unexpected message: {message}");

    // The in-flight sibling observed the cancellation at a batch boundary.
    let users = harness.unit(task_id, "shop.users").await;
    assert!(
        users.status == UnitStatus::Paused || users.status == UnitStatus::Completed,
        "sibling unit should be paused (or already done), got {}",
        users.status
    );

    let (status, is_running) = harness.task_status(task_id).await;
    assert_eq!(status, TaskStatus::Failed);
    assert!(!is_running);

    let errors = harness.engine.get_errors(task_id).await.expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].unit_name.as_deref(), Some("shop.orders"));

    harness.teardown().await;
}

// ===========================================================================
// Re-run and stop
// ===========================================================================

#[tokio::test]
async fn full_rerun_after_completion_resets_and_converges() {
    let state = MockState::default()
        .with_table("shop.orders", 2500)
        .with_table("shop.users", 500);
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&two_table_config(1000, 2, "skip")).await;

    harness.run_to_idle(task_id).await;
    harness.run_to_idle(task_id).await;

    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Completed);
    assert_eq!((orders.processed_records, orders.total_records), (2500, 2500));

    let (status, _) = harness.task_status(task_id).await;
    assert_eq!(status, TaskStatus::Completed);

    // History rows accumulate across runs.
    let histories = unit_histories::list_histories(&harness.pool, task_id)
        .await
        .expect("histories");
    assert_eq!(histories.len(), 4);

    harness.teardown().await;
}

#[tokio::test]
async fn stop_abandons_progress_and_leaves_task_runnable() {
    let state = MockState::default()
        .with_table("shop.orders", 2500)
        .with_write_delay(Duration::from_millis(100));
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&one_table_config(1000, "skip")).await;

    harness.engine.start(task_id).await.expect("start");
    harness.wait_for_processed(task_id, 1000).await;
    harness.engine.stop(task_id).await.expect("stop");

    let (status, is_running) = harness.task_status(task_id).await;
    assert!(!is_running);
    assert_eq!(status, TaskStatus::Configured, "stopped task stays runnable");

    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Pending);
    assert_eq!(orders.processed_records, 0);
    assert_eq!(orders.total_records, 0);
    assert!(orders.started_at.is_none());

    // The task can immediately run again to completion.
    harness.run_to_idle(task_id).await;
    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Completed);
    assert_eq!(orders.processed_records, 2500);

    harness.teardown().await;
}

// ===========================================================================
// Boundary behaviors
// ===========================================================================

#[tokio::test]
async fn zero_row_source_completes_without_writes() {
    let state = MockState::default().with_table("shop.orders", 0);
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&one_table_config(1000, "skip")).await;

    harness.run_to_idle(task_id).await;

    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Completed);
    assert_eq!((orders.processed_records, orders.total_records), (0, 0));
    assert_eq!(harness.write_calls("shop.orders"), 0, "writer must not be invoked");

    harness.teardown().await;
}

#[tokio::test]
async fn batch_larger_than_total_means_one_batch() {
    let state = MockState::default().with_table("shop.orders", 500);
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&one_table_config(1000, "skip")).await;

    harness.run_to_idle(task_id).await;

    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Completed);
    assert_eq!(orders.processed_records, 500);
    assert_eq!(harness.write_calls("shop.orders"), 1);
    assert_eq!(orders.last_batch_index, 1);

    harness.teardown().await;
}

#[tokio::test]
async fn single_thread_runs_units_serially() {
    let state = MockState::default()
        .with_table("shop.orders", 2000)
        .with_table("shop.users", 2000);
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&two_table_config(500, 1, "skip")).await;

    harness.run_to_idle(task_id).await;

    // With one worker the write log must be two contiguous runs, one per
    // unit, in queue (unit-name) order.
    let log = harness.state.lock().unwrap().write_log.clone();
    assert_eq!(log.len(), 8);
    assert!(log[..4].iter().all(|e| e == "shop.orders"), "log: {log:?}");
    assert!(log[4..].iter().all(|e| e == "shop.users"), "log: {log:?}");

    harness.teardown().await;
}

// ===========================================================================
// Control-API preconditions
// ===========================================================================

#[tokio::test]
async fn start_with_no_units_is_no_work() {
    let harness = TestHarness::new(MockState::default()).await;

    // Configure the task without materializing any unit configs.
    let source = insert_data_source(
        &harness.pool,
        &NewDataSource {
            name: "src",
            kind: EngineKind::Sql,
            host: "localhost",
            port: 3306,
            username: "root",
            password_sealed: "00",
            default_schema: None,
        },
    )
    .await
    .expect("insert source");
    let target = insert_data_source(
        &harness.pool,
        &NewDataSource {
            name: "dst",
            kind: EngineKind::Sql,
            host: "localhost",
            port: 3307,
            username: "root",
            password_sealed: "00",
            default_schema: None,
        },
    )
    .await
    .expect("insert target");
    let config = one_table_config(1000, "skip");
    let task = task_db::insert_task(
        &harness.pool,
        &NewSyncTask {
            name: "no-units",
            source_id: source.id,
            target_id: target.id,
            source_kind: EngineKind::Sql,
            target_kind: EngineKind::Sql,
            config: &config,
            mode: SyncMode::Full,
        },
    )
    .await
    .expect("insert task");
    task_db::update_task_config(&harness.pool, task.id, &config)
        .await
        .expect("configure");

    let result = harness.engine.start(task.id).await;
    assert!(matches!(result, Err(ControlError::NoWork(_))));

    let (_, is_running) = harness.task_status(task.id).await;
    assert!(!is_running, "a failed start must not leave the flag set");

    harness.teardown().await;
}

#[tokio::test]
async fn start_while_running_is_invalid_state() {
    let state = MockState::default()
        .with_table("shop.orders", 2500)
        .with_write_delay(Duration::from_millis(100));
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&one_table_config(1000, "skip")).await;

    harness.engine.start(task_id).await.expect("first start");
    let second = harness.engine.start(task_id).await;
    assert!(matches!(second, Err(ControlError::InvalidState(_))));

    harness.engine.wait_until_idle(task_id).await;
    harness.teardown().await;
}

#[tokio::test]
async fn start_unknown_task_is_not_found() {
    let harness = TestHarness::new(MockState::default()).await;
    let result = harness.engine.start(Uuid::new_v4()).await;
    assert!(matches!(result, Err(ControlError::TaskNotFound(_))));
    harness.teardown().await;
}

#[tokio::test]
async fn malformed_config_is_rejected_before_any_state_change() {
    let harness = TestHarness::new(MockState::default().with_table("shop.orders", 10)).await;
    let task_id = harness.seed_task(&one_table_config(1000, "skip")).await;

    task_db::update_task_config(&harness.pool, task_id, "{not json")
        .await
        .expect("store bad config");

    let result = harness.engine.start(task_id).await;
    assert!(matches!(result, Err(ControlError::Validation(_))));

    let (_, is_running) = harness.task_status(task_id).await;
    assert!(!is_running);
    assert!(
        runtime_db::list_runtimes(&harness.pool, task_id)
            .await
            .expect("runtimes")
            .is_empty(),
        "validation failures must not materialize runtimes"
    );

    harness.teardown().await;
}

// ===========================================================================
// Admin operations
// ===========================================================================

#[tokio::test]
async fn reset_failed_revives_failed_units() {
    let state = MockState::default()
        .with_table("shop.orders", 1000)
        .failing_write("shop.orders", 1);
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&one_table_config(1000, "pause")).await;

    harness.run_to_idle(task_id).await;
    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Failed);

    let reset = harness.engine.reset_failed(task_id).await.expect("reset failed");
    assert_eq!(reset, 1);
    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Pending);
    assert_eq!(orders.processed_records, 0);

    // The injected failure only fires on the first write call; the retry
    // goes through.
    harness.run_to_idle(task_id).await;
    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Completed);

    harness.teardown().await;
}

#[tokio::test]
async fn reset_unit_rejected_while_worker_owns_it() {
    let state = MockState::default()
        .with_table("shop.orders", 2500)
        .with_write_delay(Duration::from_millis(100));
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&one_table_config(1000, "skip")).await;

    harness.engine.start(task_id).await.expect("start");
    harness.wait_for_processed(task_id, 1000).await;

    let orders = harness.unit(task_id, "shop.orders").await;
    assert_eq!(orders.status, UnitStatus::Running);
    let result = harness.engine.reset_unit(orders.id).await;
    assert!(matches!(result, Err(ControlError::InvalidState(_))));

    harness.engine.pause(task_id).await.expect("pause");
    harness
        .engine
        .reset_unit(orders.id)
        .await
        .expect("reset after pause should succeed");

    harness.teardown().await;
}

#[tokio::test]
async fn get_progress_matches_store() {
    let state = MockState::default().with_table("shop.orders", 500);
    let harness = TestHarness::new(state).await;
    let task_id = harness.seed_task(&one_table_config(1000, "skip")).await;

    harness.run_to_idle(task_id).await;

    let snapshot = harness.engine.get_progress(task_id).await.expect("progress");
    assert_eq!(snapshot.task_id, task_id);
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert!(!snapshot.is_running);
    assert_eq!(snapshot.total_units, 1);
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.processed_records, 500);
    assert_eq!(snapshot.units.len(), 1);
    assert_eq!(snapshot.units[0].unit_name, "shop.orders");

    let report = harness.engine.get_task_units(task_id).await.expect("units");
    assert!(report.active.is_empty());
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.statistics.processed_records, 500);

    harness.teardown().await;
}
