//! The §6 execution surface: the eleven `/workspaces/{wid}/executions...`
//! routes plus `steps/{sid}/confirm|reject` and `.../cancel`.
//!
//! Every handler takes `workspace_id` as an opaque `Uuid` scoping value —
//! this engine has no `WorkspaceStore` (§1: "lifecycle is owned by an
//! external flow"), so a workspace is never constructed here, only
//! compared against `Task.workspace_id`.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::StreamExt;
use sa_domain::error::Error;
use sa_domain::model::{Actor, EventType, Task, TaskType, Workspace};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::cancel::CancelToken;
use crate::runtime::coordinator::{CoordinatorOutcome, ExecutionProposal};
use crate::state::AppState;

use super::error::{ApiError, ApiResult};

/// Confirms a `Task` belongs to the named workspace, the way every
/// handler below scopes its query.
fn task_in_workspace(task: Task, workspace_id: Uuid) -> ApiResult<Task> {
    if task.workspace_id != workspace_id {
        return Err(ApiError(Error::NotFound {
            kind: "execution",
            id: task.id.to_string(),
        }));
    }
    Ok(task)
}

fn get_execution(state: &AppState, workspace_id: Uuid, execution_id: Uuid) -> ApiResult<Task> {
    let task = state.task_store.get(&execution_id).ok_or_else(|| {
        ApiError(Error::NotFound { kind: "execution", id: execution_id.to_string() })
    })?;
    task_in_workspace(task, workspace_id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /workspaces/:wid/proposals (§4.1, §2 "Coordinator classifies
// candidate tasks → Runner starts")
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// There is no `WorkspaceStore` in this engine (see the module doc
/// above), so a proposal POST carries the full `Workspace` it should be
/// evaluated against rather than looking one up by id.
#[derive(Debug, Deserialize)]
pub struct ProposeExecutionRequest {
    pub workspace: Workspace,
    pub user_id: Uuid,
    pub pack_id: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    pub confidence: f64,
    #[serde(default)]
    pub auto_execute_hint: Option<bool>,
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub intent_id: Option<Uuid>,
    #[serde(default)]
    pub suggestion_id: Option<Uuid>,
}

/// Submits one candidate task to the Execution Coordinator. An `Execute`
/// decision starts the playbook immediately through the attached
/// Runner (§4.1 S1: "task created with status=running"); `Suggestion`
/// and `Skip` just record or discard it, same as `evaluate`.
pub async fn propose_execution(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Json(req): Json<ProposeExecutionRequest>,
) -> ApiResult<Json<CoordinatorOutcome>> {
    if req.workspace.id != workspace_id {
        return Err(ApiError(Error::Validation(
            "workspace body does not match the path workspace_id".to_string(),
        )));
    }
    let proposal = ExecutionProposal {
        pack_id: req.pack_id,
        params: req.params,
        confidence: req.confidence,
        auto_execute_hint: req.auto_execute_hint,
        task_type: req.task_type.unwrap_or(TaskType::PlaybookExecution),
        intent_id: req.intent_id,
        suggestion_id: req.suggestion_id,
    };
    let outcome = state.coordinator.dispatch(&req.workspace, req.user_id, &proposal).await;
    Ok(Json(outcome))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /workspaces/:wid/executions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_executions(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.task_store.list_for_workspace(&workspace_id)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /workspaces/:wid/executions/:eid
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_execution_handler(
    State(state): State<AppState>,
    Path((workspace_id, execution_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Task>> {
    Ok(Json(get_execution(&state, workspace_id, execution_id)?))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /workspaces/:wid/executions/:eid/steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_steps(
    State(state): State<AppState>,
    Path((workspace_id, execution_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<sa_domain::model::Event>>> {
    get_execution(&state, workspace_id, execution_id)?;
    let steps: Vec<_> = state
        .event_log
        .list_for_entity(&execution_id)
        .into_iter()
        .filter(|e| e.event_type == EventType::PlaybookStep)
        .collect();
    Ok(Json(steps))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /workspaces/:wid/executions/:eid/tool-calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_tool_calls(
    State(state): State<AppState>,
    Path((workspace_id, execution_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<sa_domain::model::ToolCallRecord>>> {
    get_execution(&state, workspace_id, execution_id)?;
    Ok(Json(state.tool_calls.list_since(&execution_id, None)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /workspaces/:wid/executions/:eid/stage-results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_stage_results(
    State(state): State<AppState>,
    Path((workspace_id, execution_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<sa_domain::model::StageResult>>> {
    get_execution(&state, workspace_id, execution_id)?;
    Ok(Json(state.stage_results.list_since(&execution_id, None)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /workspaces/:wid/executions/:eid/chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_chat(
    State(state): State<AppState>,
    Path((workspace_id, execution_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<sa_domain::model::Event>>> {
    get_execution(&state, workspace_id, execution_id)?;
    let messages: Vec<_> = state
        .event_log
        .list_for_entity(&execution_id)
        .into_iter()
        .filter(|e| e.event_type == EventType::ExecutionChat)
        .collect();
    Ok(Json(messages))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /workspaces/:wid/executions/:eid/chat (§4.8)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct PostChatRequest {
    pub message: String,
}

/// Is the task paused waiting for something, per the §4.8 continue-mode
/// test (`paused_at`, `waiting_confirmation` status label, or a pending
/// confirmation gate)?
fn is_paused(task: &Task) -> bool {
    let Some(ctx) = task.execution_context.as_ref() else { return false };
    ctx.paused_at.is_some()
        || ctx.confirmation_status.as_deref() == Some("waiting_confirmation")
        || (ctx.requires_confirmation == Some(true)
            && ctx.confirmation_status.as_deref() == Some("pending"))
}

pub async fn post_chat(
    State(state): State<AppState>,
    Path((workspace_id, execution_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<PostChatRequest>,
) -> ApiResult<Json<sa_domain::model::Event>> {
    let task = get_execution(&state, workspace_id, execution_id)?;

    append_chat_event(&state, workspace_id, execution_id, Actor::User, &req.message);

    let reply_text = if is_paused(&task) {
        state
            .runner
            .continue_playbook_execution(execution_id, &req.message)
            .await
            .map_err(ApiError)?
            .message
    } else {
        discussion_reply(&state, &task, &req.message).await.map_err(ApiError)?
    };

    let event = append_chat_event(&state, workspace_id, execution_id, Actor::Assistant, &reply_text);
    Ok(Json(event))
}

/// Every chat turn is recorded as its own `execution_chat` event, scoped to
/// the execution both as `entity_ids` (for the SSE projector, §4.7) and as
/// `thread_id` (an execution is its own thread here, the way the Runner's
/// own `PlaybookStep` events are emitted, §4.8).
fn append_chat_event(
    state: &AppState,
    workspace_id: Uuid,
    execution_id: Uuid,
    actor: Actor,
    text: &str,
) -> sa_domain::model::Event {
    let mut payload = HashMap::new();
    payload.insert("text".to_string(), serde_json::json!(text));
    payload.insert(
        "role".to_string(),
        serde_json::json!(if actor == Actor::User { "user" } else { "assistant" }),
    );
    let mut event = sa_domain::model::Event::new(workspace_id, actor, EventType::ExecutionChat, payload);
    event.thread_id = Some(execution_id);
    event.entity_ids = vec![execution_id];
    state.event_log.append(event.clone());
    event
}

/// Discussion mode (§4.8): answer a sidebar question about a
/// running/completed execution without driving the playbook forward.
/// The prompt includes the execution's recent step summaries and chat
/// history so the reply stays grounded in what actually happened.
async fn discussion_reply(
    state: &AppState,
    task: &Task,
    user_message: &str,
) -> sa_domain::error::Result<String> {
    let recent_steps: Vec<String> = state
        .event_log
        .list_for_entity(&task.id)
        .into_iter()
        .filter(|e| e.event_type == EventType::PlaybookStep)
        .map(|e| serde_json::to_string(&e.payload).unwrap_or_default())
        .collect();
    let recent_chat: Vec<String> = state
        .event_log
        .list_for_entity(&task.id)
        .into_iter()
        .filter(|e| e.event_type == EventType::ExecutionChat)
        .filter_map(|e| e.payload.get("text").and_then(|v| v.as_str()).map(str::to_string))
        .collect();

    let ctx = task.execution_context.as_ref();
    let system = format!(
        "You are discussing a playbook execution with the user. \
         Playbook: {}. Current step: {}. Recent steps: {}. Recent chat: {}.",
        task.pack_id,
        ctx.and_then(|c| c.current_step_index).unwrap_or(0),
        recent_steps.join(" | "),
        recent_chat.join(" | "),
    );

    let req = sa_domain::provider::ChatRequest {
        messages: vec![
            sa_domain::message::Message {
                role: sa_domain::message::Role::System,
                content: sa_domain::message::MessageContent::Text(system),
            },
            sa_domain::message::Message {
                role: sa_domain::message::Role::User,
                content: sa_domain::message::MessageContent::Text(user_message.to_string()),
            },
        ],
        ..Default::default()
    };
    let resp = state.llm.chat(req).await?;
    Ok(resp.content)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /workspaces/:wid/executions/:eid/steps/:sid/confirm|reject
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn confirm_step(
    State(state): State<AppState>,
    Path((workspace_id, execution_id, step_id)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<Json<serde_json::Value>> {
    get_execution(&state, workspace_id, execution_id)?;
    if !state.approvals.approve(&step_id) {
        return Err(ApiError(Error::NotFound { kind: "pending_approval", id: step_id.to_string() }));
    }
    Ok(Json(serde_json::json!({ "approved": true })))
}

#[derive(Debug, Deserialize, Default)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn reject_step(
    State(state): State<AppState>,
    Path((workspace_id, execution_id, step_id)): Path<(Uuid, Uuid, Uuid)>,
    body: Option<Json<RejectRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    get_execution(&state, workspace_id, execution_id)?;
    let reason = body.map(|Json(b)| b.reason).unwrap_or(None);
    if !state.approvals.deny(&step_id, reason) {
        return Err(ApiError(Error::NotFound { kind: "pending_approval", id: step_id.to_string() }));
    }
    Ok(Json(serde_json::json!({ "approved": false })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /workspaces/:wid/executions/:eid/cancel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn cancel_execution(
    State(state): State<AppState>,
    Path((workspace_id, execution_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<serde_json::Value>> {
    get_execution(&state, workspace_id, execution_id)?;
    state.cancellations.cancel(&execution_id.to_string());
    let cancelled = state.task_store.cancel(&execution_id);
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /workspaces/:wid/executions/:eid/stream (SSE, §4.7)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stream_execution(
    State(state): State<AppState>,
    Path((workspace_id, execution_id)): Path<(Uuid, Uuid)>,
) -> impl IntoResponse {
    if get_execution(&state, workspace_id, execution_id).is_err() {
        let stream = futures_util::stream::once(async {
            Ok::<_, Infallible>(SseEvent::default().event("error").data(r#"{"message":"execution not found"}"#))
        });
        return Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    }

    let token = state.cancellations.register(execution_id.to_string());
    let stream_token: CancelToken = token;
    let projector = state.stream.clone();
    let sse_stream = projector
        .subscribe(execution_id, stream_token)
        .map(|event| {
            let name = match &event {
                crate::runtime::stream::StreamEvent::ExecutionUpdate { .. } => "execution_update",
                crate::runtime::stream::StreamEvent::StepUpdate { .. } => "step_update",
                crate::runtime::stream::StreamEvent::ToolCallUpdate { .. } => "tool_call_update",
                crate::runtime::stream::StreamEvent::StageResult { .. } => "stage_result",
                crate::runtime::stream::StreamEvent::ExecutionChat { .. } => "execution_chat",
                crate::runtime::stream::StreamEvent::ExecutionCompleted { .. } => "execution_completed",
                crate::runtime::stream::StreamEvent::Error { .. } => "error",
                crate::runtime::stream::StreamEvent::StreamEnd {} => "stream_end",
            };
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok::<_, Infallible>(SseEvent::default().event(name).data(data))
        });

    Sse::new(sse_stream).keep_alive(KeepAlive::default()).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /workspaces/:wid/threads/:tid/bundle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize)]
pub struct ThreadBundle {
    pub thread_id: Uuid,
    pub events: Vec<sa_domain::model::Event>,
    pub executions: Vec<Task>,
}

pub async fn get_thread_bundle(
    State(state): State<AppState>,
    Path((workspace_id, thread_id)): Path<(Uuid, Uuid)>,
) -> Json<ThreadBundle> {
    // An execution is its own thread in this engine (§9 redesign note: no
    // separate thread registry), so `thread_id` doubles as `execution_id`.
    let (events, _watermark) = state.event_log.list_since(&thread_id, None, usize::MAX);
    let executions: Vec<Task> = state
        .task_store
        .get(&thread_id)
        .filter(|t| t.workspace_id == workspace_id)
        .into_iter()
        .collect();
    Json(ThreadBundle { thread_id, events, executions })
}
