//! The HTTP surface (§6): the Execution Chat/stream/confirmation routes
//! under `/workspaces/{wid}/executions/...`, plus a `/healthz` probe.
//!
//! One function building the whole `Router<AppState>`; no protected/public
//! split or bearer-token gate, since permissioning sits outside this
//! engine's scope.

pub mod error;
pub mod executions;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health))
        .route(
            "/workspaces/:workspace_id/proposals",
            axum::routing::post(executions::propose_execution),
        )
        .route("/workspaces/:workspace_id/executions", get(executions::list_executions))
        .route(
            "/workspaces/:workspace_id/executions/:execution_id",
            get(executions::get_execution_handler),
        )
        .route(
            "/workspaces/:workspace_id/executions/:execution_id/steps",
            get(executions::list_steps),
        )
        .route(
            "/workspaces/:workspace_id/executions/:execution_id/tool-calls",
            get(executions::list_tool_calls),
        )
        .route(
            "/workspaces/:workspace_id/executions/:execution_id/stage-results",
            get(executions::list_stage_results),
        )
        .route(
            "/workspaces/:workspace_id/executions/:execution_id/chat",
            get(executions::list_chat).post(executions::post_chat),
        )
        .route(
            "/workspaces/:workspace_id/executions/:execution_id/stream",
            get(executions::stream_execution),
        )
        .route(
            "/workspaces/:workspace_id/executions/:execution_id/steps/:step_id/confirm",
            axum::routing::post(executions::confirm_step),
        )
        .route(
            "/workspaces/:workspace_id/executions/:execution_id/steps/:step_id/reject",
            axum::routing::post(executions::reject_step),
        )
        .route(
            "/workspaces/:workspace_id/executions/:execution_id/cancel",
            axum::routing::post(executions::cancel_execution),
        )
        .route(
            "/workspaces/:workspace_id/threads/:thread_id/bundle",
            get(executions::get_thread_bundle),
        )
}

async fn health() -> &'static str {
    "ok"
}
