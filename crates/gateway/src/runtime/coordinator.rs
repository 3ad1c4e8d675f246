//! The Execution Coordinator (§4.1): decides, for each proposal in an
//! execution plan, whether to execute now, create a suggestion, or skip.
//!
//! Grounded on the confidence-threshold and tier-classification logic in
//! `original_source/backend/app/services/execution_coordinator.py`
//! (the literal fallback threshold constants are carried over verbatim
//! as the decided Open Question, see `DESIGN.md`), reworked around the
//! explicit `TaskStore`/`PlaybookRegistry` dependencies instead of
//! constructor-time singletons (§9 redesign note).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use parking_lot::RwLock;
use sa_domain::config::CoordinatorConfig;
use sa_domain::model::{Task, TaskType, Workspace};
use sa_domain::playbook::{PlaybookRegistry, SideEffectTier};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::runner::{PlaybookRunner, PlaybookVariant};
use super::task_store::TaskStore;

/// One candidate task proposal from an upstream plan (e.g. intent
/// extraction output).
#[derive(Debug, Clone)]
pub struct ExecutionProposal {
    pub pack_id: String,
    pub params: HashMap<String, Value>,
    pub confidence: f64,
    pub auto_execute_hint: Option<bool>,
    pub task_type: TaskType,
    pub intent_id: Option<Uuid>,
    pub suggestion_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CoordinatorOutcome {
    Execute(Uuid),
    Suggestion(Uuid),
    Skip { reason: &'static str },
}

/// The pure tier/threshold/preference decision (§4.1), without touching the
/// Task Store or the Runner. `evaluate`/`dispatch` both sit on top of this.
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Execute,
    Suggestion,
    Skip(&'static str),
}

/// Tracks (workspace, user, pack, task_type) tuples for which
/// auto-suggestion has been explicitly disabled (§4.1 "User preferences").
#[derive(Default)]
pub struct SuggestionPreferences {
    disabled: RwLock<HashSet<(Uuid, Uuid, String, TaskType)>>,
}

impl SuggestionPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable(&self, workspace_id: Uuid, user_id: Uuid, pack_id: impl Into<String>, task_type: TaskType) {
        self.disabled.write().insert((workspace_id, user_id, pack_id.into(), task_type));
    }

    fn is_disabled(&self, workspace_id: Uuid, user_id: Uuid, pack_id: &str, task_type: TaskType) -> bool {
        self.disabled
            .read()
            .contains(&(workspace_id, user_id, pack_id.to_string(), task_type))
    }
}

pub struct ExecutionCoordinator {
    config: CoordinatorConfig,
    task_store: Arc<TaskStore>,
    registry: Arc<PlaybookRegistry>,
    preferences: Arc<SuggestionPreferences>,
    /// Present once the Playbook Runner exists (`bootstrap.rs` wires it in
    /// after construction); `dispatch` needs it to actually start an
    /// `Execute` decision instead of leaving a `pending` task nothing picks
    /// up. `evaluate` never touches it, so unit tests that only care about
    /// the policy decision don't need a runner at all.
    runner: RwLock<Option<Arc<PlaybookRunner>>>,
}

impl ExecutionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        task_store: Arc<TaskStore>,
        registry: Arc<PlaybookRegistry>,
        preferences: Arc<SuggestionPreferences>,
    ) -> Self {
        Self {
            config,
            task_store,
            registry,
            preferences,
            runner: RwLock::new(None),
        }
    }

    /// Wire in the Playbook Runner once it exists. Split from `new` because
    /// `bootstrap.rs` builds the Runner after the Coordinator (the Runner
    /// has no use for the Coordinator, so there's no cycle to break, just a
    /// construction order to bridge).
    pub fn attach_runner(&self, runner: Arc<PlaybookRunner>) {
        *self.runner.write() = Some(runner);
    }

    fn decide(&self, workspace: &Workspace, user_id: Uuid, proposal: &ExecutionProposal) -> Decision {
        if !self.registry.is_valid_pack(&proposal.pack_id) {
            return Decision::Skip("invalid_playbook_code");
        }

        if self
            .preferences
            .is_disabled(workspace.id, user_id, &proposal.pack_id, proposal.task_type)
        {
            return Decision::Skip("auto_suggest_disabled");
        }

        let tier = self.registry.tier_of(&proposal.pack_id).unwrap_or(SideEffectTier::ExternalWrite);
        let auto_execute = self.should_auto_execute(workspace, proposal, tier);

        match (tier, auto_execute) {
            (SideEffectTier::ExternalWrite, _) => Decision::Suggestion,
            (_, true) => Decision::Execute,
            (_, false) => Decision::Suggestion,
        }
    }

    /// Evaluate one proposal against the workspace and decide its fate.
    /// The `Execute` branch only enqueues a `pending` task — this is the
    /// pure policy decision, used directly by the policy unit tests below.
    /// Production callers should use `dispatch`, which actually starts the
    /// execution instead of leaving it for a worker to find.
    pub fn evaluate(&self, workspace: &Workspace, user_id: Uuid, proposal: &ExecutionProposal) -> CoordinatorOutcome {
        match self.decide(workspace, user_id, proposal) {
            Decision::Skip(reason) => CoordinatorOutcome::Skip { reason },
            Decision::Execute => CoordinatorOutcome::Execute(self.execute_now(workspace, proposal)),
            Decision::Suggestion => self.create_suggestion(workspace, proposal),
        }
    }

    /// The live entry point (§2 "Coordinator classifies candidate tasks →
    /// Runner starts"): same policy decision as `evaluate`, but an
    /// `Execute` decision hands straight off to
    /// `PlaybookRunner::start_playbook_execution` in this same call rather
    /// than inserting a `pending` row for a worker that doesn't exist yet.
    /// Falls back to a suggestion (§4.1 "Failure semantics") if the runner
    /// isn't attached yet or the execution fails to start.
    pub async fn dispatch(&self, workspace: &Workspace, user_id: Uuid, proposal: &ExecutionProposal) -> CoordinatorOutcome {
        match self.decide(workspace, user_id, proposal) {
            Decision::Skip(reason) => CoordinatorOutcome::Skip { reason },
            Decision::Suggestion => self.create_suggestion(workspace, proposal),
            Decision::Execute => {
                let Some(runner) = self.runner.read().clone() else {
                    return self.handle_execution_failure(workspace, proposal);
                };
                let result = runner
                    .start_playbook_execution(
                        &proposal.pack_id,
                        workspace,
                        proposal.params.clone(),
                        &workspace.locale,
                        PlaybookVariant::default(),
                        Some("coordinator".to_string()),
                        proposal.intent_id,
                        proposal.suggestion_id,
                    )
                    .await;
                match result {
                    Ok(outcome) => CoordinatorOutcome::Execute(outcome.execution_id),
                    Err(_) => self.handle_execution_failure(workspace, proposal),
                }
            }
        }
    }

    /// §4.1 "Auto-execute threshold".
    fn should_auto_execute(&self, workspace: &Workspace, proposal: &ExecutionProposal, tier: SideEffectTier) -> bool {
        use sa_domain::model::ExecutionMode::*;

        if tier == SideEffectTier::Readonly
            && matches!(workspace.execution_mode, Execution | Hybrid)
        {
            let threshold = self.config.readonly_threshold(workspace.priority);
            return proposal.confidence >= threshold;
        }

        if let Some(over) = workspace.auto_execution_config.get(&proposal.pack_id) {
            return over.auto_execute && proposal.confidence >= over.confidence_threshold;
        }

        if tier == SideEffectTier::SoftWrite {
            let threshold = self.config.default_soft_write_threshold;
            return proposal.auto_execute_hint.unwrap_or(false) && proposal.confidence >= threshold;
        }

        false
    }

    fn execute_now(&self, workspace: &Workspace, proposal: &ExecutionProposal) -> Uuid {
        let mut task = Task::new(workspace.id, proposal.pack_id.clone(), proposal.task_type);
        task.params = proposal.params.clone();
        task.status = sa_domain::model::TaskStatus::Pending;
        self.task_store.insert(task)
    }

    /// §4.1 "Duplicate suppression" + "Creating a suggestion".
    fn create_suggestion(&self, workspace: &Workspace, proposal: &ExecutionProposal) -> CoordinatorOutcome {
        let window = Duration::minutes(self.config.duplicate_window_minutes);
        if let Some(existing) = self
            .task_store
            .find_duplicate_suggestion(&workspace.id, &proposal.pack_id, &proposal.params, window)
        {
            return CoordinatorOutcome::Suggestion(existing.id);
        }

        let mut task = Task::new(workspace.id, proposal.pack_id.clone(), TaskType::Suggestion);
        let mut params = proposal.params.clone();
        params.insert("confidence".to_string(), Value::from(proposal.confidence));
        params
            .entry("reason".to_string())
            .or_insert_with(|| Value::String(String::new()));
        params
            .entry("content_tags".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        params
            .entry("analysis_summary".to_string())
            .or_insert_with(|| Value::String(String::new()));
        params.insert(
            "is_background".to_string(),
            Value::Bool(self.registry.is_background(&proposal.pack_id)),
        );
        task.params = params;
        let id = self.task_store.insert(task);
        CoordinatorOutcome::Suggestion(id)
    }

    /// §4.1 "Failure semantics": fall back to suggestion creation only if
    /// no pending task already exists for the same pack.
    pub fn handle_execution_failure(&self, workspace: &Workspace, proposal: &ExecutionProposal) -> CoordinatorOutcome {
        let already_pending = self
            .task_store
            .list_runnable()
            .iter()
            .any(|t| t.workspace_id == workspace.id && t.pack_id == proposal.pack_id);

        if already_pending {
            return CoordinatorOutcome::Skip {
                reason: "pending_task_exists",
            };
        }
        self.create_suggestion(workspace, proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::model::{AutoExecuteOverride, ExecutionMode, ExecutionPriority};

    fn workspace(mode: ExecutionMode, priority: ExecutionPriority) -> Workspace {
        Workspace {
            id: Uuid::new_v4(),
            owner_principal_id: Uuid::new_v4(),
            locale: "en-US".into(),
            storage_root: "/tmp".into(),
            execution_mode: mode,
            priority,
            auto_execution_config: HashMap::new(),
        }
    }

    fn proposal(pack_id: &str, confidence: f64) -> ExecutionProposal {
        ExecutionProposal {
            pack_id: pack_id.to_string(),
            params: HashMap::new(),
            confidence,
            auto_execute_hint: None,
            task_type: TaskType::PlaybookExecution,
            intent_id: None,
            suggestion_id: None,
        }
    }

    fn make_coordinator(registry: PlaybookRegistry) -> (ExecutionCoordinator, Arc<TaskStore>) {
        let store = Arc::new(TaskStore::new());
        let coordinator = ExecutionCoordinator::new(
            CoordinatorConfig::default(),
            store.clone(),
            Arc::new(registry),
            Arc::new(SuggestionPreferences::new()),
        );
        (coordinator, store)
    }

    #[test]
    fn readonly_executes_above_threshold_in_execution_mode() {
        let mut registry = PlaybookRegistry::new();
        registry.register(sa_domain::playbook::Playbook {
            metadata: sa_domain::playbook::PlaybookMetadata { name: "p".into(), code: "p".into() },
            sop_content: String::new(),
            tier: SideEffectTier::Readonly,
            steps: Vec::new(),
            is_background: false,
        });
        let (coordinator, _store) = make_coordinator(registry);
        let ws = workspace(ExecutionMode::Execution, ExecutionPriority::Medium);
        let outcome = coordinator.evaluate(&ws, Uuid::new_v4(), &proposal("p", 0.9));
        assert!(matches!(outcome, CoordinatorOutcome::Execute(_)));
    }

    #[test]
    fn readonly_below_threshold_creates_suggestion() {
        let mut registry = PlaybookRegistry::new();
        registry.register(sa_domain::playbook::Playbook {
            metadata: sa_domain::playbook::PlaybookMetadata { name: "p".into(), code: "p".into() },
            sop_content: String::new(),
            tier: SideEffectTier::Readonly,
            steps: Vec::new(),
            is_background: false,
        });
        let (coordinator, _store) = make_coordinator(registry);
        let ws = workspace(ExecutionMode::Execution, ExecutionPriority::Medium);
        let outcome = coordinator.evaluate(&ws, Uuid::new_v4(), &proposal("p", 0.5));
        assert!(matches!(outcome, CoordinatorOutcome::Suggestion(_)));
    }

    #[test]
    fn external_write_always_creates_suggestion() {
        let mut registry = PlaybookRegistry::new();
        registry.register(sa_domain::playbook::Playbook {
            metadata: sa_domain::playbook::PlaybookMetadata { name: "p".into(), code: "p".into() },
            sop_content: String::new(),
            tier: SideEffectTier::ExternalWrite,
            steps: Vec::new(),
            is_background: false,
        });
        let (coordinator, _store) = make_coordinator(registry);
        let ws = workspace(ExecutionMode::Execution, ExecutionPriority::High);
        let outcome = coordinator.evaluate(&ws, Uuid::new_v4(), &proposal("p", 0.99));
        assert!(matches!(outcome, CoordinatorOutcome::Suggestion(_)));
    }

    #[test]
    fn invalid_pack_is_skipped() {
        let (coordinator, _store) = make_coordinator(PlaybookRegistry::new());
        let ws = workspace(ExecutionMode::Execution, ExecutionPriority::Medium);
        let outcome = coordinator.evaluate(&ws, Uuid::new_v4(), &proposal("nonexistent", 0.99));
        assert_eq!(outcome, CoordinatorOutcome::Skip { reason: "invalid_playbook_code" });
    }

    #[test]
    fn builtin_special_packs_are_always_valid() {
        let (coordinator, _store) = make_coordinator(PlaybookRegistry::new());
        let ws = workspace(ExecutionMode::Qa, ExecutionPriority::Medium);
        let outcome = coordinator.evaluate(&ws, Uuid::new_v4(), &proposal("intent_extraction", 0.1));
        assert!(matches!(outcome, CoordinatorOutcome::Suggestion(_)));
    }

    #[test]
    fn per_pack_override_controls_auto_execute() {
        let mut registry = PlaybookRegistry::new();
        registry.register(sa_domain::playbook::Playbook {
            metadata: sa_domain::playbook::PlaybookMetadata { name: "p".into(), code: "p".into() },
            sop_content: String::new(),
            tier: SideEffectTier::SoftWrite,
            steps: Vec::new(),
            is_background: false,
        });
        let (coordinator, _store) = make_coordinator(registry);
        let mut ws = workspace(ExecutionMode::Qa, ExecutionPriority::Medium);
        ws.auto_execution_config.insert(
            "p".to_string(),
            AutoExecuteOverride { confidence_threshold: 0.4, auto_execute: true },
        );
        let outcome = coordinator.evaluate(&ws, Uuid::new_v4(), &proposal("p", 0.5));
        assert!(matches!(outcome, CoordinatorOutcome::Execute(_)));
    }

    #[test]
    fn disabled_preference_skips_with_reason() {
        let mut registry = PlaybookRegistry::new();
        registry.register(sa_domain::playbook::Playbook {
            metadata: sa_domain::playbook::PlaybookMetadata { name: "p".into(), code: "p".into() },
            sop_content: String::new(),
            tier: SideEffectTier::ExternalWrite,
            steps: Vec::new(),
            is_background: false,
        });
        let store = Arc::new(TaskStore::new());
        let preferences = Arc::new(SuggestionPreferences::new());
        let ws = workspace(ExecutionMode::Execution, ExecutionPriority::Medium);
        let user_id = Uuid::new_v4();
        preferences.disable(ws.id, user_id, "p", TaskType::PlaybookExecution);
        let coordinator = ExecutionCoordinator::new(
            CoordinatorConfig::default(),
            store,
            Arc::new(registry),
            preferences,
        );
        let outcome = coordinator.evaluate(&ws, user_id, &proposal("p", 0.99));
        assert_eq!(outcome, CoordinatorOutcome::Skip { reason: "auto_suggest_disabled" });
    }

    struct OneShotProvider;

    #[async_trait::async_trait]
    impl sa_domain::provider::LlmProvider for OneShotProvider {
        async fn chat(&self, _req: sa_domain::provider::ChatRequest) -> sa_domain::error::Result<sa_domain::provider::ChatResponse> {
            Ok(sa_domain::provider::ChatResponse {
                content: "done".to_string(),
                model: "test-model".to_string(),
            })
        }

        fn provider_id(&self) -> &str {
            "one-shot"
        }
    }

    fn make_runner_backed_coordinator(registry: PlaybookRegistry, state_dir: &std::path::Path) -> (ExecutionCoordinator, Arc<TaskStore>) {
        use crate::runtime::approval::ApprovalStore;
        use crate::runtime::cancel::CancelMap;
        use crate::runtime::checkpoint::CheckpointManager;
        use crate::runtime::event_log::EventLog;
        use crate::runtime::execution_lock::ExecutionLockMap;
        use crate::runtime::records::{StageResultStore, ToolCallStore};
        use sa_domain::config::RunnerConfig;
        use sa_tools::executor::ToolRegistry;

        let store = Arc::new(TaskStore::new());
        let registry = Arc::new(registry);
        let coordinator = ExecutionCoordinator::new(
            CoordinatorConfig::default(),
            store.clone(),
            registry.clone(),
            Arc::new(SuggestionPreferences::new()),
        );
        let runner = Arc::new(PlaybookRunner::new(
            "test-runner".to_string(),
            RunnerConfig::default(),
            store.clone(),
            Arc::new(EventLog::new(state_dir)),
            Arc::new(CheckpointManager::new()),
            Arc::new(ToolRegistry::new()),
            Arc::new(ToolCallStore::new()),
            Arc::new(StageResultStore::new()),
            Arc::new(ExecutionLockMap::new()),
            Arc::new(OneShotProvider),
            registry,
            Vec::new(),
            Arc::new(ApprovalStore::new(std::time::Duration::from_secs(300))),
            Arc::new(CancelMap::new()),
        ));
        coordinator.attach_runner(runner);
        (coordinator, store)
    }

    #[tokio::test]
    async fn dispatch_starts_execution_immediately() {
        let mut registry = PlaybookRegistry::new();
        registry.register(sa_domain::playbook::Playbook {
            metadata: sa_domain::playbook::PlaybookMetadata { name: "p".into(), code: "p".into() },
            sop_content: "do the thing".into(),
            tier: SideEffectTier::Readonly,
            steps: Vec::new(),
            is_background: false,
        });
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, store) = make_runner_backed_coordinator(registry, dir.path());
        let ws = workspace(ExecutionMode::Execution, ExecutionPriority::Medium);

        let outcome = coordinator.dispatch(&ws, Uuid::new_v4(), &proposal("p", 0.9)).await;
        let CoordinatorOutcome::Execute(task_id) = outcome else {
            panic!("expected Execute, got {outcome:?}");
        };
        let task = store.get(&task_id).unwrap();
        assert_eq!(task.status, sa_domain::model::TaskStatus::Running);
    }

    #[tokio::test]
    async fn dispatch_without_attached_runner_falls_back_to_suggestion() {
        let mut registry = PlaybookRegistry::new();
        registry.register(sa_domain::playbook::Playbook {
            metadata: sa_domain::playbook::PlaybookMetadata { name: "p".into(), code: "p".into() },
            sop_content: String::new(),
            tier: SideEffectTier::Readonly,
            steps: Vec::new(),
            is_background: false,
        });
        let (coordinator, _store) = make_coordinator(registry);
        let ws = workspace(ExecutionMode::Execution, ExecutionPriority::Medium);

        let outcome = coordinator.dispatch(&ws, Uuid::new_v4(), &proposal("p", 0.9)).await;
        assert!(matches!(outcome, CoordinatorOutcome::Suggestion(_)));
    }

    #[test]
    fn duplicate_suggestion_reuses_existing_task() {
        let mut registry = PlaybookRegistry::new();
        registry.register(sa_domain::playbook::Playbook {
            metadata: sa_domain::playbook::PlaybookMetadata { name: "p".into(), code: "p".into() },
            sop_content: String::new(),
            tier: SideEffectTier::ExternalWrite,
            steps: Vec::new(),
            is_background: false,
        });
        let (coordinator, _store) = make_coordinator(registry);
        let ws = workspace(ExecutionMode::Execution, ExecutionPriority::Medium);
        let first = coordinator.evaluate(&ws, Uuid::new_v4(), &proposal("p", 0.9));
        let second = coordinator.evaluate(&ws, Uuid::new_v4(), &proposal("p", 0.9));
        assert_eq!(first, second);
    }
}
