//! WebSocket server + REST endpoints for the task system.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatcher::{ActionDispatcher, ApplyParams};
use super::model::{
    ActionReport, ErrorBody, NewTask, OperatorAction, TaskClientMessage, TaskWsMessage,
};
use super::query::{TaskFilter, count_by_status};
use super::store::TaskStore;
use crate::error::TaskError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<ActionDispatcher>,
}

impl AppState {
    fn store(&self) -> &TaskStore {
        self.dispatcher.store()
    }
}

/// Build the Axum router with task WebSocket and REST routes.
pub fn task_routes(dispatcher: Arc<ActionDispatcher>) -> Router {
    let state = AppState { dispatcher };

    Router::new()
        .route("/health", get(health))
        .route("/ws/tasks", get(ws_handler))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/actions/{action}", post(apply_action))
        .route("/api/tasks/{id}/reorder", post(reorder_task))
        .route("/api/bulk-actions", post(bulk_action))
        .route("/api/executor/tasks/{id}/start", post(executor_start))
        .route("/api/executor/tasks/{id}/complete", post(executor_complete))
        .route("/api/executor/tasks/{id}/fail", post(executor_fail))
        .route("/api/executor/tasks/{id}/progress", post(executor_progress))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

fn status_for(err: &TaskError) -> StatusCode {
    match err {
        TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
        TaskError::InvalidTransition { .. }
        | TaskError::ConcurrentModification { .. }
        | TaskError::NotRunning { .. } => StatusCode::CONFLICT,
        TaskError::RetryLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        TaskError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &TaskError) -> Response {
    (status_for(err), Json(ErrorBody::from(err))).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            code: "bad_request".to_string(),
            message: message.into(),
        }),
    )
        .into_response()
}

fn parse_task_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| bad_request("Invalid task ID"))
}

fn task_result(result: Result<super::model::Task, TaskError>) -> Response {
    match result {
        Ok(task) => (StatusCode::OK, Json(task)).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let counts = count_by_status(&state.store().snapshot().await);
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskflow",
        "tasks": counts,
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Task WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.dispatcher))
}

async fn send_json(socket: &mut WebSocket, msg: &TaskWsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize task WS message");
            true
        }
    }
}

async fn sync_message(store: &TaskStore) -> TaskWsMessage {
    TaskWsMessage::TasksSync {
        tasks: store.snapshot().await,
    }
}

async fn handle_socket(mut socket: WebSocket, dispatcher: Arc<ActionDispatcher>) {
    info!("Task WebSocket client connected");

    // Subscribe before the snapshot so nothing committed in between is lost.
    let mut rx = dispatcher.store().subscribe();

    if !send_json(&mut socket, &sync_message(dispatcher.store()).await).await {
        warn!("Failed to send initial task sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_json(&mut socket, &TaskWsMessage::from(event)).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "Task WS client lagged behind broadcast");
                        if !send_json(&mut socket, &sync_message(dispatcher.store()).await).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Task broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(&text, &dispatcher).await {
                            if !send_json(&mut socket, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Task WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Task WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Task WebSocket connection closed");
}

async fn handle_client_message(
    text: &str,
    dispatcher: &ActionDispatcher,
) -> Option<TaskWsMessage> {
    let msg = match serde_json::from_str::<TaskClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, text = text, "Unrecognized task WS message from client");
            return None;
        }
    };

    let single =
        |task_id, expected_version, action| (task_id, action, ApplyParams { expected_version });

    let (task_id, action, params) = match msg {
        TaskClientMessage::Pause { task_id, expected_version } => {
            single(task_id, expected_version, OperatorAction::Pause)
        }
        TaskClientMessage::Resume { task_id, expected_version } => {
            single(task_id, expected_version, OperatorAction::Resume)
        }
        TaskClientMessage::Cancel { task_id, expected_version } => {
            single(task_id, expected_version, OperatorAction::Cancel)
        }
        TaskClientMessage::Retry { task_id, expected_version } => {
            single(task_id, expected_version, OperatorAction::Retry)
        }
        TaskClientMessage::Bulk { task_ids, op } => {
            let outcomes = dispatcher.apply_bulk(&task_ids, op).await;
            return Some(TaskWsMessage::BulkResult {
                action: op,
                results: outcomes
                    .iter()
                    .map(|o| ActionReport::new(o.task_id, &o.result))
                    .collect(),
            });
        }
        TaskClientMessage::Reorder { task_id, target_index } => {
            let result = dispatcher.store().reorder(task_id, target_index).await;
            if let Err(e) = &result {
                warn!(task_id = %task_id, error = %e, "Reorder failed via WS");
            }
            return Some(TaskWsMessage::ReorderResult {
                task_id,
                ok: result.is_ok(),
                error: result.err().as_ref().map(ErrorBody::from),
            });
        }
        TaskClientMessage::Sync => return Some(sync_message(dispatcher.store()).await),
    };

    let result = dispatcher.apply_with(task_id, action, params).await;
    Some(TaskWsMessage::ActionResult {
        action,
        report: ActionReport::new(task_id, &result),
    })
}

// ── REST: queue ─────────────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<AppState>,
    Query(filter): Query<TaskFilter>,
) -> impl IntoResponse {
    Json(state.store().list(&filter).await)
}

async fn create_task(State(state): State<AppState>, Json(body): Json<NewTask>) -> Response {
    if body.name.trim().is_empty() {
        return bad_request("Task name must not be empty");
    }
    match state.store().enqueue(body).await {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    task_result(state.store().get(task_id).await)
}

async fn apply_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
    Query(params): Query<ApplyParams>,
) -> Response {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let action: OperatorAction = match action.parse() {
        Ok(action) => action,
        Err(e) => return bad_request(e),
    };
    task_result(state.dispatcher.apply_with(task_id, action, params).await)
}

#[derive(Debug, Serialize, Deserialize)]
struct BulkRequest {
    task_ids: Vec<Uuid>,
    action: OperatorAction,
}

async fn bulk_action(State(state): State<AppState>, Json(body): Json<BulkRequest>) -> Response {
    let outcomes = state.dispatcher.apply_bulk(&body.task_ids, body.action).await;
    let results: Vec<ActionReport> = outcomes
        .iter()
        .map(|o| ActionReport::new(o.task_id, &o.result))
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "action": body.action,
            "results": results,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct ReorderRequest {
    target_index: usize,
}

async fn reorder_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReorderRequest>,
) -> Response {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store().reorder(task_id, body.target_index).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

// ── REST: executor ticks ────────────────────────────────────────────────

async fn executor_start(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    task_result(state.store().start(task_id).await)
}

async fn executor_complete(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    task_result(state.store().complete(task_id).await)
}

#[derive(Debug, Deserialize)]
struct FailReport {
    error: String,
}

async fn executor_fail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FailReport>,
) -> Response {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    task_result(state.store().fail(task_id, body.error).await)
}

#[derive(Debug, Deserialize)]
struct ProgressReport {
    progress: u8,
}

async fn executor_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ProgressReport>,
) -> Response {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    task_result(state.store().report_progress(task_id, body.progress).await)
}
