use std::sync::Arc;

use sa_domain::config::Config;
use sa_domain::playbook::PlaybookRegistry;
use sa_domain::provider::LlmProvider;
use sa_tools::executor::ToolRegistry;

use crate::runtime::approval::ApprovalStore;
use crate::runtime::cancel::CancelMap;
use crate::runtime::checkpoint::CheckpointManager;
use crate::runtime::coordinator::ExecutionCoordinator;
use crate::runtime::event_log::EventLog;
use crate::runtime::execution_lock::ExecutionLockMap;
use crate::runtime::records::{StageResultStore, ToolCallStore};
use crate::runtime::runner::PlaybookRunner;
use crate::runtime::stream::StreamProjector;
use crate::runtime::task_store::TaskStore;

/// Shared state handed to every HTTP handler via axum's `with_state`.
///
/// Fields are grouped by concern:
/// - **Execution core** — the durable stores and the services built directly
///   on top of them (Task Store, Event Log, Coordinator, Runner, Checkpoint
///   Manager).
/// - **Confirmation & cancellation** — the two cooperative control-flow
///   primitives the REST layer exposes (`steps/{id}/confirm|reject`,
///   `executions/{id}/cancel`).
/// - **Tool calls & stage results** — the append-only peer stores the
///   Runner writes to and the `GET .../tool-calls` / `GET
///   .../stage-results` handlers read from.
/// - **Streaming** — the tick-driven SSE projector (§4.7).
/// - **External collaborators** — the LLM provider and tool executor the
///   Runner is built with; kept here too since `GET .../chat`'s
///   discussion-mode reply (§4.8) calls the provider directly, outside the
///   Runner's own tool loop.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    /// This process's identity in the runner heartbeat table (§4.2).
    pub runner_id: String,

    // ── Execution core ──────────────────────────────────────────────
    pub task_store: Arc<TaskStore>,
    pub event_log: Arc<EventLog>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub runner: Arc<PlaybookRunner>,
    pub checkpoints: Arc<CheckpointManager>,
    pub playbooks: Arc<PlaybookRegistry>,

    // ── Confirmation & cancellation ──────────────────────────────────
    pub approvals: Arc<ApprovalStore>,
    pub cancellations: Arc<CancelMap>,
    pub execution_locks: Arc<ExecutionLockMap>,

    // ── Tool calls & stage results ───────────────────────────────────
    pub tool_calls: Arc<ToolCallStore>,
    pub stage_results: Arc<StageResultStore>,

    // ── Streaming ─────────────────────────────────────────────────────
    pub stream: Arc<StreamProjector>,

    // ── External collaborators ───────────────────────────────────────
    pub llm: Arc<dyn LlmProvider>,
    pub tools: Arc<ToolRegistry>,
}
