//! `datatrac serve`: the HTTP control surface plus the SSE event stream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use datatrac_core::events::{EventBus, SubscriberId, SyncEvent};
use datatrac_core::{ControlError, SyncEngine};
use datatrac_db::queries::data_sources as source_db;
use datatrac_db::queries::tasks as task_db;

// ---------------------------------------------------------------------------
// State and error type
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<ControlError> for AppError {
    fn from(err: ControlError) -> Self {
        let status = match &err {
            ControlError::TaskNotFound(_) | ControlError::UnitNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ControlError::InvalidState(_)
            | ControlError::NotRunning(_)
            | ControlError::NoWork(_) => StatusCode::CONFLICT,
            ControlError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(engine: Arc<SyncEngine>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/sources", get(list_sources))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}/start", post(start_task))
        .route("/api/tasks/{id}/pause", post(pause_task))
        .route("/api/tasks/{id}/stop", post(stop_task))
        .route("/api/tasks/{id}/progress", get(get_progress))
        .route("/api/tasks/{id}/units", get(get_units))
        .route("/api/tasks/{id}/errors", get(get_errors))
        .route("/api/tasks/{id}/logs", get(get_logs))
        .route("/api/tasks/{id}/reset-failed", post(reset_failed))
        .route("/api/tasks/{id}/history", delete(clear_history))
        .route("/api/tasks/{id}/events", get(sse_events))
        .route("/api/units/{id}/reset", post(reset_unit))
        .layer(CorsLayer::permissive())
        .with_state(AppState { engine })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(engine: Arc<SyncEngine>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(engine);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("datatrac serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("datatrac serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let tasks = task_db::list_tasks(state.engine.pool())
        .await
        .map_err(AppError::internal)?;

    let rows = if tasks.is_empty() {
        "<tr><td colspan=\"3\">No tasks found.</td></tr>".to_string()
    } else {
        tasks
            .iter()
            .map(|t| {
                format!(
                    "<tr><td><a href=\"/api/tasks/{id}/progress\">{name}</a></td><td>{status}</td><td>{id}</td></tr>",
                    id = t.id,
                    name = t.name,
                    status = t.status,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>datatrac</title></head><body>\
<h1>datatrac</h1>\
<p><a href=\"/api/tasks\">/api/tasks</a> | <a href=\"/api/sources\">/api/sources</a></p>\
<table><tr><th>Task</th><th>Status</th><th>ID</th></tr>{rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

async fn list_sources(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let sources = source_db::list_data_sources(state.engine.pool())
        .await
        .map_err(AppError::internal)?;
    Ok(Json(sources).into_response())
}

async fn list_tasks(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let tasks = task_db::list_tasks(state.engine.pool())
        .await
        .map_err(AppError::internal)?;
    Ok(Json(tasks).into_response())
}

async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    state.engine.start(id).await?;
    Ok(Json(serde_json::json!({ "started": id })).into_response())
}

async fn pause_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    state.engine.pause(id).await?;
    Ok(Json(serde_json::json!({ "paused": id })).into_response())
}

async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    state.engine.stop(id).await?;
    Ok(Json(serde_json::json!({ "stopped": id })).into_response())
}

async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let snapshot = state.engine.get_progress(id).await?;
    Ok(Json(snapshot).into_response())
}

async fn get_units(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let report = state.engine.get_task_units(id).await?;
    Ok(Json(report).into_response())
}

async fn get_errors(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let errors = state.engine.get_errors(id).await?;
    Ok(Json(errors).into_response())
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    100
}

async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<LogsParams>,
) -> Result<axum::response::Response, AppError> {
    let entries = state.engine.get_logs(id, params.limit).await?;
    Ok(Json(entries).into_response())
}

async fn reset_failed(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let reset = state.engine.reset_failed(id).await?;
    Ok(Json(serde_json::json!({ "reset": reset })).into_response())
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    pattern: String,
}

async fn clear_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<axum::response::Response, AppError> {
    let deleted = state.engine.clear_by_pattern(id, &params.pattern).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })).into_response())
}

async fn reset_unit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    state.engine.reset_unit(id).await?;
    Ok(Json(serde_json::json!({ "reset": id })).into_response())
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

/// Unsubscribes when the SSE stream is dropped (client disconnect).
struct Subscription {
    bus: Arc<EventBus>,
    task_id: Uuid,
    id: SubscriberId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.task_id, self.id);
    }
}

fn event_payload(event: &SyncEvent) -> String {
    let json = match event {
        SyncEvent::Progress(snapshot) => serde_json::to_string(snapshot),
        SyncEvent::Log(entries) => serde_json::to_string(entries),
        SyncEvent::Error(record) => serde_json::to_string(record),
    };
    json.unwrap_or_else(|_| "{}".to_owned())
}

async fn sse_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Send a snapshot up front so late subscribers see current state
    // immediately; this also 404s unknown tasks before the stream opens.
    let initial = state.engine.get_progress(id).await?;

    let bus = Arc::clone(state.engine.bus());
    let (sub_id, mut rx) = bus.subscribe(id);
    let guard = Subscription {
        bus,
        task_id: id,
        id: sub_id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok(Event::default()
            .event("progress")
            .data(serde_json::to_string(&initial).unwrap_or_else(|_| "{}".to_owned())));

        while let Some(event) = rx.recv().await {
            yield Ok(Event::default().event(event.kind()).data(event_payload(&event)));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::PgPool;
    use tower::ServiceExt;
    use uuid::Uuid;

    use datatrac_core::SyncEngine;
    use datatrac_core::adapter::ConnectFactory;
    use datatrac_core::credentials::SecretKey;
    use datatrac_db::models::{EngineKind, SyncMode};
    use datatrac_db::queries::data_sources::{NewDataSource, insert_data_source};
    use datatrac_db::queries::tasks::{NewSyncTask, insert_task, update_task_config};
    use datatrac_test_utils::{create_test_db, drop_test_db};

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn test_engine(pool: PgPool) -> Arc<SyncEngine> {
        let key = SecretKey::from_passphrase("serve-test");
        Arc::new(SyncEngine::new(pool, Arc::new(ConnectFactory::new(key))))
    }

    async fn send_request(engine: Arc<SyncEngine>, method: &str, uri: &str) -> axum::response::Response {
        let app = super::build_router(engine);
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed_task(pool: &PgPool, configured: bool) -> Uuid {
        let source = insert_data_source(
            pool,
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
            pool,
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

        let config = r#"{
            "selectedDatabases": [
                {"sourceSchema": "shop", "targetSchema": "shop",
                 "tables": [{"sourceName": "orders", "targetName": "orders"}]}
            ]
        }"#;
        let task = insert_task(
            pool,
            &NewSyncTask {
                name: "copy-shop",
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

        if configured {
            update_task_config(pool, task.id, config)
                .await
                .expect("configure task");
        }
        task.id
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_index_returns_html() {
        let (pool, db_name) = create_test_db().await;
        let engine = test_engine(pool.clone());

        let resp = send_request(engine, "GET", "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap();
        assert!(
            content_type.contains("text/html"),
            "content-type should contain text/html, got: {content_type}"
        );

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_list_sources_and_tasks() {
        let (pool, db_name) = create_test_db().await;
        let engine = test_engine(pool.clone());
        seed_task(&pool, true).await;

        let resp = send_request(Arc::clone(&engine), "GET", "/api/sources").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let sources = body_json(resp).await;
        assert_eq!(sources.as_array().unwrap().len(), 2);
        assert!(
            sources[0].get("password_sealed").is_none(),
            "sealed passwords must not be serialized"
        );

        let resp = send_request(engine, "GET", "/api/tasks").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let tasks = body_json(resp).await;
        assert_eq!(tasks.as_array().unwrap().len(), 1);
        assert_eq!(tasks[0]["name"], "copy-shop");
        assert_eq!(tasks[0]["status"], "configured");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_progress_not_found() {
        let (pool, db_name) = create_test_db().await;
        let engine = test_engine(pool.clone());

        let random = Uuid::new_v4();
        let resp = send_request(engine, "GET", &format!("/api/tasks/{random}/progress")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_progress_before_first_start() {
        let (pool, db_name) = create_test_db().await;
        let engine = test_engine(pool.clone());
        let task_id = seed_task(&pool, true).await;

        let resp = send_request(engine, "GET", &format!("/api/tasks/{task_id}/progress")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "configured");
        assert_eq!(json["is_running"], false);
        assert_eq!(json["total_units"], 0);
        assert_eq!(json["units"], serde_json::json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_units_report_shape() {
        let (pool, db_name) = create_test_db().await;
        let engine = test_engine(pool.clone());
        let task_id = seed_task(&pool, true).await;

        let resp = send_request(engine, "GET", &format!("/api/tasks/{task_id}/units")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json.get("active").is_some());
        assert!(json.get("completed").is_some());
        assert!(json.get("statistics").is_some());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_start_unconfigured_task_conflicts() {
        let (pool, db_name) = create_test_db().await;
        let engine = test_engine(pool.clone());
        let task_id = seed_task(&pool, false).await;

        let resp = send_request(engine, "POST", &format!("/api/tasks/{task_id}/start")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_pause_idle_task_conflicts() {
        let (pool, db_name) = create_test_db().await;
        let engine = test_engine(pool.clone());
        let task_id = seed_task(&pool, true).await;

        let resp = send_request(engine, "POST", &format!("/api/tasks/{task_id}/pause")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_start_missing_task_not_found() {
        let (pool, db_name) = create_test_db().await;
        let engine = test_engine(pool.clone());

        let random = Uuid::new_v4();
        let resp = send_request(engine, "POST", &format!("/api/tasks/{random}/start")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_reset_failed_returns_count() {
        let (pool, db_name) = create_test_db().await;
        let engine = test_engine(pool.clone());
        let task_id = seed_task(&pool, true).await;

        let resp =
            send_request(engine, "POST", &format!("/api/tasks/{task_id}/reset-failed")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["reset"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_logs_empty() {
        let (pool, db_name) = create_test_db().await;
        let engine = test_engine(pool.clone());
        let task_id = seed_task(&pool, true).await;

        let resp = send_request(engine, "GET", &format!("/api/tasks/{task_id}/logs?limit=10")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json, serde_json::json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
