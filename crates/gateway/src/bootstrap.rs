//! `AppState` construction and background-task spawning extracted from
//! `main.rs` so `serve` and one-shot CLI commands can share the same boot
//! path.

use std::sync::Arc;

use anyhow::Context;
use sa_domain::config::{Config, ConfigSeverity};
use sa_domain::playbook::PlaybookRegistry;

use crate::runtime::approval::ApprovalStore;
use crate::runtime::cancel::CancelMap;
use crate::runtime::checkpoint::CheckpointManager;
use crate::runtime::coordinator::{ExecutionCoordinator, SuggestionPreferences};
use crate::runtime::event_log::EventLog;
use crate::runtime::execution_lock::ExecutionLockMap;
use crate::runtime::llm_provider::OpenAiCompatProvider;
use crate::runtime::records::{StageResultStore, ToolCallStore};
use crate::runtime::runner::PlaybookRunner;
use crate::runtime::stream::StreamProjector;
use crate::runtime::task_store::TaskStore;
use crate::state::AppState;

/// Validate config, initialize every subsystem, and return a fully-wired
/// [`AppState`]. This is the shared "boot" path `Serve` and `Doctor` use.
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    // ── State directory ───────────────────────────────────────────────
    std::fs::create_dir_all(&config.data.state_path).context("creating state directory")?;

    // ── Event Log ──────────────────────────────────────────────────────
    let event_log = Arc::new(EventLog::new(&config.data.state_path));
    tracing::info!(path = %config.data.state_path.display(), "event log ready");

    // ── Task Store ─────────────────────────────────────────────────────
    let task_store = Arc::new(TaskStore::new());
    tracing::info!("task store ready");

    // ── Playbook registry ───────────────────────────────────────────────
    // No playbook packs ship with the binary itself (§9: playbooks are
    // registered data, not compiled-in code); an empty registry still
    // recognizes the builtin special packs.
    let playbooks = Arc::new(PlaybookRegistry::new());
    tracing::info!("playbook registry ready (no packs registered yet)");

    // ── Execution Coordinator ───────────────────────────────────────────
    let preferences = Arc::new(SuggestionPreferences::new());
    let coordinator = Arc::new(ExecutionCoordinator::new(
        config.coordinator.clone(),
        task_store.clone(),
        playbooks.clone(),
        preferences,
    ));
    tracing::info!("execution coordinator ready");

    // ── Checkpoint Manager ───────────────────────────────────────────────
    let checkpoints = Arc::new(CheckpointManager::new());

    // ── Confirmation gate + cancellation + execution locks ──────────────
    let approvals = Arc::new(ApprovalStore::new(std::time::Duration::from_secs(300)));
    let cancellations = Arc::new(CancelMap::new());
    let execution_locks = Arc::new(ExecutionLockMap::new());
    tracing::info!("approval store, cancel map, execution locks ready");

    // ── Tool calls & stage results ───────────────────────────────────────
    let tool_calls = Arc::new(ToolCallStore::new());
    let stage_results = Arc::new(StageResultStore::new());

    // ── Tool executor ────────────────────────────────────────────────────
    let tools = Arc::new(sa_tools::executor::ToolRegistry::new());
    tracing::info!("tool registry ready (no backends registered yet)");

    // ── LLM provider ──────────────────────────────────────────────────────
    let llm: Arc<dyn sa_domain::provider::LlmProvider> =
        Arc::new(OpenAiCompatProvider::from_config(&config.llm).context("initializing LLM provider")?);
    tracing::info!(base_url = %config.llm.base_url, model = %config.llm.default_model, "LLM provider ready");

    // ── Playbook Runner ───────────────────────────────────────────────────
    let runner_id = format!("gateway-{}", uuid::Uuid::new_v4());
    let runner = Arc::new(PlaybookRunner::new(
        runner_id.clone(),
        config.runner.clone(),
        task_store.clone(),
        event_log.clone(),
        checkpoints.clone(),
        tools.clone(),
        tool_calls.clone(),
        stage_results.clone(),
        execution_locks.clone(),
        llm.clone(),
        playbooks.clone(),
        Vec::new(),
        approvals.clone(),
        cancellations.clone(),
    ));
    tracing::info!("playbook runner ready");

    // Coordinator is built before the runner exists, so it starts with no
    // attached runner (`dispatch` falls back to `handle_execution_failure`
    // until this is called); wire it up now that both exist.
    coordinator.attach_runner(runner.clone());

    // ── Streaming projector ───────────────────────────────────────────────
    let stream = Arc::new(StreamProjector::new(
        task_store.clone(),
        event_log.clone(),
        tool_calls.clone(),
        stage_results.clone(),
        config.stream.clone(),
    ));
    tracing::info!(tick_ms = config.stream.tick_interval_ms, "streaming projector ready");

    Ok(AppState {
        runner_id,
        config,
        task_store,
        event_log,
        coordinator,
        runner,
        checkpoints,
        playbooks,
        approvals,
        cancellations,
        execution_locks,
        tool_calls,
        stage_results,
        stream,
        llm,
        tools,
    })
}

/// Spawn the one long-running background task this engine needs: the
/// zombie-reaper sweep (§4.2, §5 "periodic sweep"). This engine has
/// exactly one durable store that needs periodic liveness maintenance.
pub fn spawn_background_tasks(state: &AppState) {
    let task_store = state.task_store.clone();
    let runner_id = state.runner_id.clone();
    let heartbeat_ttl = chrono::Duration::minutes(state.config.task_store.heartbeat_ttl_minutes);
    let no_heartbeat_ttl = chrono::Duration::minutes(state.config.task_store.no_heartbeat_ttl_minutes);
    let interval_secs = state.config.task_store.reap_sweep_interval_seconds;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            // Self-elect as the active runner (§4.2 "Runner heartbeat
            // table") once per sweep; a future multi-process deployment
            // reads this via `has_active_runner` to decide whether another
            // worker is already covering this workspace.
            task_store.upsert_runner_heartbeat(&runner_id);
            let reaped = task_store.reap_zombies(heartbeat_ttl, no_heartbeat_ttl);
            if !reaped.is_empty() {
                tracing::warn!(count = reaped.len(), "reaped zombie tasks");
            }
            task_store.evict_terminal(chrono::Duration::hours(1));
        }
    });
    tracing::info!("background tasks spawned");
}
