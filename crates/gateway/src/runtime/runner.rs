//! The Playbook Runner: `start_playbook_execution` (§4.3) and
//! `continue_playbook_execution` (§4.4), the step driver at the heart of
//! the execution core.
//!
//! Grounded on the original `playbook_runner.py`'s two entry points, with
//! the tool-call inner loop and structured-output extraction delegated
//! to `parsing` (§9 "fold the structured-output extractor and tool-call
//! parser into one pure function").

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sa_domain::config::RunnerConfig;
use sa_domain::error::{Error, Result};
use sa_domain::message::{Message, ToolDefinition};
use sa_domain::model::{
    Actor, Event, EventType, ExecutionContext, StageResultType, Task, TaskStatus, TaskType,
    Workspace,
};
use sa_domain::playbook::{PlaybookRegistry, SideEffectTier};
use sa_domain::provider::{ChatRequest, LlmProvider};
use sa_tools::executor::ToolRegistry;
use serde_json::Value;
use uuid::Uuid;

use super::approval::{ApprovalDecision, ApprovalStore, PendingApproval};
use super::cancel::CancelMap;
use super::checkpoint::CheckpointManager;
use super::conversation::ConversationManager;
use super::event_log::EventLog;
use super::execution_lock::ExecutionLockMap;
use super::parsing;
use super::records::{StageResultStore, ToolCallStore};
use super::task_store::TaskStore;
use super::truncate_str;

/// Variant overrides for a start call. `variant_id` names a variant in the
/// contract but there is no variant catalog to resolve it against, so
/// callers resolve the variant themselves and pass its effect here rather
/// than the runner reaching into a store that doesn't exist yet.
#[derive(Debug, Clone, Default)]
pub struct PlaybookVariant {
    pub skip_steps: Vec<i64>,
    pub custom_checklist: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub execution_id: Uuid,
    pub message: String,
    pub is_complete: bool,
    pub conversation_history: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct ContinueOutcome {
    pub message: String,
    pub is_complete: bool,
    pub structured_output: Option<Value>,
    pub conversation_history: Vec<Message>,
}

struct ToolCallOutcome {
    tool_name: String,
    success: bool,
    summary: String,
}

pub struct PlaybookRunner {
    runner_id: String,
    config: RunnerConfig,
    task_store: Arc<TaskStore>,
    event_log: Arc<EventLog>,
    checkpoints: Arc<CheckpointManager>,
    tool_registry: Arc<ToolRegistry>,
    tool_calls: Arc<ToolCallStore>,
    stage_results: Arc<StageResultStore>,
    execution_locks: Arc<ExecutionLockMap>,
    provider: Arc<dyn LlmProvider>,
    playbooks: Arc<PlaybookRegistry>,
    tool_catalog: Vec<ToolDefinition>,
    approvals: Arc<ApprovalStore>,
    cancellations: Arc<CancelMap>,
    conversations: RwLock<HashMap<Uuid, ConversationManager>>,
}

impl PlaybookRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner_id: String,
        config: RunnerConfig,
        task_store: Arc<TaskStore>,
        event_log: Arc<EventLog>,
        checkpoints: Arc<CheckpointManager>,
        tool_registry: Arc<ToolRegistry>,
        tool_calls: Arc<ToolCallStore>,
        stage_results: Arc<StageResultStore>,
        execution_locks: Arc<ExecutionLockMap>,
        provider: Arc<dyn LlmProvider>,
        playbooks: Arc<PlaybookRegistry>,
        tool_catalog: Vec<ToolDefinition>,
        approvals: Arc<ApprovalStore>,
        cancellations: Arc<CancelMap>,
    ) -> Self {
        Self {
            runner_id,
            config,
            task_store,
            event_log,
            checkpoints,
            tool_registry,
            tool_calls,
            stage_results,
            execution_locks,
            provider,
            playbooks,
            tool_catalog,
            approvals,
            cancellations,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    fn tool_catalog_str(&self) -> String {
        self.tool_catalog
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn emit(&self, workspace_id: Uuid, thread_id: Uuid, entity_ids: Vec<Uuid>, actor: Actor, event_type: EventType, payload: HashMap<String, Value>) {
        let mut event = Event::new(workspace_id, actor, event_type, payload);
        event.thread_id = Some(thread_id);
        event.entity_ids = entity_ids;
        self.event_log.append(event);
    }

    /// Confirmation gate for `external_write`-tier playbooks (§4.1). Inserts
    /// a `PendingApproval`, marks the task paused, emits a step event so
    /// clients can see the pending gate, and waits for a human decision via
    /// `POST .../steps/{sid}/confirm|reject` (the approval id doubles as
    /// that route's `step_id`). Times out to a denial after the store's
    /// configured timeout so an abandoned execution never blocks forever.
    async fn gate_tool_call(
        &self,
        task: &Task,
        execution_id: Uuid,
        tool_name: &str,
        params: &HashMap<String, Value>,
    ) -> Result<bool> {
        if self.playbooks.tier_of(&task.pack_id) != Some(SideEffectTier::ExternalWrite) {
            return Ok(true);
        }

        let approval_id = Uuid::new_v4();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let summary = format!(
            "{tool_name}({})",
            truncate_str(
                &serde_json::to_string(params).unwrap_or_default(),
                self.config.tool_summary_excerpt_chars
            )
        );
        self.approvals.insert(PendingApproval {
            id: approval_id,
            tool_call_summary: summary,
            execution_id: execution_id.to_string(),
            created_at: chrono::Utc::now(),
            respond: tx,
        });

        self.task_store.update(&task.id, |t| {
            let ctx = t.execution_context.get_or_insert_with(ExecutionContext::default);
            ctx.requires_confirmation = Some(true);
            ctx.confirmation_status = Some("pending".to_string());
            ctx.paused_at = Some(chrono::Utc::now());
        });

        let mut payload = HashMap::new();
        payload.insert("approval_id".to_string(), Value::String(approval_id.to_string()));
        payload.insert("tool_name".to_string(), Value::String(tool_name.to_string()));
        payload.insert("status".to_string(), Value::String("awaiting_confirmation".to_string()));
        self.emit(
            task.workspace_id,
            execution_id,
            vec![execution_id],
            Actor::System,
            EventType::PlaybookStep,
            payload,
        );

        let approved = match tokio::time::timeout(self.approvals.timeout(), rx).await {
            Ok(Ok(ApprovalDecision::Approved)) => true,
            Ok(Ok(ApprovalDecision::Denied { .. })) | Ok(Err(_)) => false,
            Err(_) => {
                self.approvals.remove_expired(&approval_id);
                false
            }
        };

        self.task_store.update(&task.id, |t| {
            let ctx = t.execution_context.get_or_insert_with(ExecutionContext::default);
            ctx.requires_confirmation = Some(false);
            ctx.confirmation_status = Some(if approved { "approved" } else { "denied" }.to_string());
            ctx.paused_at = None;
        });

        Ok(approved)
    }

    fn step_events_count(&self, execution_id: Uuid) -> i64 {
        self.event_log
            .list_for_entity(&execution_id)
            .iter()
            .filter(|e| e.event_type == EventType::PlaybookStep)
            .count() as i64
    }

    /// §4.3.
    pub async fn start_playbook_execution(
        &self,
        pack_code: &str,
        workspace: &Workspace,
        inputs: HashMap<String, Value>,
        locale: &str,
        variant: PlaybookVariant,
        trigger_source: Option<String>,
        intent_id: Option<Uuid>,
        suggestion_id: Option<Uuid>,
    ) -> Result<StartOutcome> {
        let playbook = self
            .playbooks
            .get(pack_code)
            .ok_or_else(|| Error::Validation(format!("unknown playbook '{pack_code}'")))?
            .clone();

        let total_steps = if !playbook.steps.is_empty() {
            playbook.steps.len() as i64
        } else {
            let phases = playbook.phase_marker_count() as i64;
            if phases > 0 {
                phases
            } else {
                1
            }
        };

        let execution_id = Uuid::new_v4();
        let mut task = Task::new(workspace.id, pack_code, TaskType::PlaybookExecution);
        // The Task Store indexes by `task.id`; pinning it to `execution_id`
        // lets every later lookup go straight from an execution_id to its
        // task without a separate index.
        task.id = execution_id;
        task.execution_id = Some(execution_id);
        task.status = TaskStatus::Pending;
        task.params = inputs;
        task.execution_context = Some(ExecutionContext {
            trigger_source,
            total_steps: Some(total_steps),
            intent_id,
            suggestion_id,
            ..Default::default()
        });
        self.task_store.insert(task.clone());

        // Every execution goes through the claim protocol (§4.2), even one
        // started synchronously from this same call — it's what makes
        // "number of successful claims is exactly 0 or 1 per task" (§8)
        // true uniformly rather than only for tasks a poll loop picks up.
        let task = self
            .task_store
            .try_claim_id(&execution_id, &self.runner_id)
            .ok_or_else(|| Error::Stale(format!("execution {execution_id} could not be claimed")))?;

        let mut conversation = ConversationManager::new(pack_code, &playbook.sop_content, workspace.id, locale)
            .with_variant(variant.skip_steps, variant.custom_checklist)
            .with_tool_catalog(self.tool_catalog_str());

        conversation.add_user_message("Begin.");

        let assistant_text = match self.call_llm(&conversation).await {
            Ok(text) => text,
            Err(e) => {
                self.fail_task(&task.id, &e);
                return Err(e);
            }
        };
        conversation.add_assistant_message(assistant_text.clone());

        let preview = truncate_str(&assistant_text, self.config.tool_summary_excerpt_chars);
        let mut payload = HashMap::new();
        payload.insert("step_index".to_string(), Value::from(1));
        payload.insert("status".to_string(), Value::String("completed".to_string()));
        payload.insert("description".to_string(), Value::String(assistant_text.clone()));
        payload.insert("log_summary".to_string(), Value::String(preview));
        payload.insert("total_steps".to_string(), Value::from(total_steps));
        self.emit(
            workspace.id,
            execution_id,
            vec![execution_id],
            Actor::Assistant,
            EventType::PlaybookStep,
            payload,
        );
        conversation.current_step = 1;

        self.task_store.update(&task.id, |t| {
            let ctx = t.execution_context.get_or_insert_with(ExecutionContext::default);
            ctx.current_step_index = Some(0);
            ctx.total_steps = Some(total_steps);
            ctx.conversation_state = Some(conversation.to_state());
        });

        let persisted = self.task_store.get(&task.id).expect("just inserted");
        self.checkpoints.checkpoint(&persisted, &conversation);
        self.conversations.write().insert(execution_id, conversation.clone());

        Ok(StartOutcome {
            execution_id,
            message: assistant_text,
            is_complete: false,
            conversation_history: conversation.messages_for_llm(),
        })
    }

    /// §4.4.
    pub async fn continue_playbook_execution(
        &self,
        execution_id: Uuid,
        user_message: &str,
    ) -> Result<ContinueOutcome> {
        let lock_key = execution_id.to_string();
        let _permit = self.execution_locks.acquire(&lock_key).await;

        let mut conversation = self.restore_conversation(execution_id)?;
        let task = self.task_store.get(&execution_id).ok_or_else(|| Error::NotFound {
            kind: "task",
            id: execution_id.to_string(),
        })?;

        conversation.add_user_message(user_message);
        self.emit(
            task.workspace_id,
            execution_id,
            vec![execution_id],
            Actor::User,
            EventType::Message,
            HashMap::from([("text".to_string(), Value::String(user_message.to_string()))]),
        );

        let mut final_text = String::new();
        let mut used_tools: Vec<String> = Vec::new();
        let cancel_key = execution_id.to_string();
        let cancel_token = self.cancellations.register(&cancel_key);

        for _ in 0..self.config.tool_loop_iteration_cap {
            if cancel_token.is_cancelled() {
                self.cancellations.remove(&cancel_key);
                self.task_store.cancel(&task.id);
                return Err(Error::Cancelled(format!("execution {execution_id} was cancelled")));
            }

            // Refresh liveness and honor the abort signal before the LLM
            // call, so an external cancellation/failure lands within one
            // iteration instead of waiting for the loop to exhaust (§4.4).
            if self.task_store.heartbeat(&task.id, &self.runner_id).unwrap_or(true) {
                self.cancellations.remove(&cancel_key);
                return Err(Error::Cancelled(format!(
                    "execution {execution_id} was aborted by an external status change"
                )));
            }

            let response = self.call_llm(&conversation).await?;
            conversation.add_assistant_message(response.clone());
            final_text = response.clone();

            let calls = parsing::parse_tool_calls_from_response(&response);
            if calls.is_empty() {
                break;
            }

            let mut outcomes = Vec::with_capacity(calls.len());
            for (i, call) in calls.into_iter().enumerate() {
                let cluster = sa_tools::executor::resolve_cluster(&call.tool_name);
                let params: HashMap<String, Value> = call.parameters.clone().into_iter().collect();

                if !self.gate_tool_call(&task, execution_id, &call.tool_name, &params).await? {
                    outcomes.push(ToolCallOutcome {
                        tool_name: call.tool_name.clone(),
                        success: false,
                        summary: "rejected by user".to_string(),
                    });
                    continue;
                }

                let row_id = self.tool_calls.start(execution_id, None, call.tool_name.clone(), params.clone(), cluster);

                let dispatch = sa_tools::executor::dispatch_tool(&self.tool_registry, &call.tool_name, params).await;
                if dispatch.is_error {
                    let err_text = truncate_str(
                        &dispatch.response.as_str().unwrap_or_default().to_string(),
                        self.config.tool_error_truncate_chars,
                    );
                    self.tool_calls.fail(&row_id, err_text.clone(), dispatch.duration.as_millis() as i64);
                    outcomes.push(ToolCallOutcome {
                        tool_name: call.tool_name.clone(),
                        success: false,
                        summary: err_text,
                    });
                } else {
                    self.tool_calls
                        .complete(&row_id, dispatch.response.clone(), dispatch.duration.as_millis() as i64);
                    let excerpt = truncate_str(&dispatch.response.to_string(), self.config.tool_summary_excerpt_chars);
                    outcomes.push(ToolCallOutcome {
                        tool_name: call.tool_name.clone(),
                        success: true,
                        summary: excerpt,
                    });
                }

                self.emit(
                    task.workspace_id,
                    execution_id,
                    vec![execution_id],
                    Actor::System,
                    EventType::ToolCall,
                    HashMap::from([
                        ("tool_name".to_string(), Value::String(call.tool_name.clone())),
                        ("call_index".to_string(), Value::from(i)),
                    ]),
                );
                used_tools.push(call.tool_name);
            }

            let any_succeeded = outcomes.iter().any(|o| o.success);
            conversation.add_system_message(summarize_tool_outcomes(&outcomes));

            if !any_succeeded {
                break;
            }
        }

        self.cancellations.remove(&cancel_key);

        let structured_output = parsing::extract_structured_output(&final_text);
        let is_complete = structured_output.is_some();

        let new_index = conversation.current_step + 1;
        let existing_count = self.step_events_count(execution_id);
        let total_steps = new_index.max(existing_count + 1);

        // Mark the previous step event completed if it isn't already, and
        // back-fill this turn's `total_steps` onto every earlier step event
        // of this execution (§4.4 step 6, Testable invariant 4).
        self.event_log.backfill_step_events(&execution_id, total_steps);

        let preview = truncate_str(&final_text, self.config.tool_summary_excerpt_chars);
        let mut payload = HashMap::new();
        payload.insert("step_index".to_string(), Value::from(new_index));
        payload.insert("status".to_string(), Value::String("completed".to_string()));
        payload.insert("description".to_string(), Value::String(final_text.clone()));
        payload.insert("log_summary".to_string(), Value::String(preview));
        payload.insert("total_steps".to_string(), Value::from(total_steps));
        if !used_tools.is_empty() {
            payload.insert(
                "used_tools".to_string(),
                Value::Array(used_tools.into_iter().map(Value::String).collect()),
            );
        }
        self.emit(
            task.workspace_id,
            execution_id,
            vec![execution_id],
            Actor::Assistant,
            EventType::PlaybookStep,
            payload,
        );
        conversation.current_step = new_index;

        if is_complete {
            let output = structured_output.clone().expect("checked is_some above");
            let result_map: HashMap<String, Value> =
                serde_json::from_value(output.clone()).unwrap_or_default();
            self.task_store.complete(&task.id, result_map.clone());

            let preview = truncate_str(&output.to_string(), self.config.tool_summary_excerpt_chars);
            self.stage_results.insert(
                execution_id,
                None,
                "final",
                StageResultType::Draft,
                result_map,
                preview,
                false,
            );
            self.conversations.write().remove(&execution_id);
        }

        self.task_store.update(&task.id, |t| {
            let ctx = t.execution_context.get_or_insert_with(ExecutionContext::default);
            ctx.current_step_index = Some((new_index - 1).max(0));
            ctx.total_steps = Some(total_steps);
            ctx.conversation_state = Some(conversation.to_state());
        });

        let persisted = self.task_store.get(&task.id).expect("task exists");
        self.checkpoints.checkpoint(&persisted, &conversation);

        if !is_complete {
            self.conversations.write().insert(execution_id, conversation.clone());
        }

        Ok(ContinueOutcome {
            message: final_text,
            is_complete,
            structured_output,
            conversation_history: conversation.messages_for_llm(),
        })
    }

    /// §4.4 step 1 / §4.6 "Restore". Prefers the in-memory map; falls back
    /// to the task's own `conversation_state`.
    fn restore_conversation(&self, execution_id: Uuid) -> Result<ConversationManager> {
        if let Some(conv) = self.conversations.read().get(&execution_id).cloned() {
            return Ok(conv);
        }

        let task = self.task_store.get(&execution_id).ok_or_else(|| Error::NotFound {
            kind: "task",
            id: execution_id.to_string(),
        })?;

        if !matches!(task.status, TaskStatus::Running | TaskStatus::Succeeded) {
            return Err(Error::Forbidden(format!(
                "execution {execution_id} is not resumable from status {:?}",
                task.status
            )));
        }

        let state = task
            .execution_context
            .as_ref()
            .and_then(|c| c.conversation_state.as_ref())
            .ok_or_else(|| Error::Validation(format!("execution {execution_id} has no saved conversation state")))?;

        ConversationManager::from_state(state)
            .map_err(|e| Error::Validation(format!("corrupt conversation state for {execution_id}: {e}")))
    }

    async fn call_llm(&self, conversation: &ConversationManager) -> Result<String> {
        let response = self
            .provider
            .chat(ChatRequest {
                messages: conversation.messages_for_llm(),
                ..Default::default()
            })
            .await?;
        Ok(response.content)
    }

    fn fail_task(&self, task_id: &Uuid, error: &Error) {
        let message = truncate_str(&error.to_string(), self.config.execution_error_truncate_chars);
        self.task_store.fail(task_id, message);
    }
}

fn summarize_tool_outcomes(outcomes: &[ToolCallOutcome]) -> String {
    let mut lines = vec!["Tool results:".to_string()];
    for o in outcomes {
        if o.success {
            lines.push(format!("- {} succeeded: {}", o.tool_name, o.summary));
        } else {
            lines.push(format!("- {} failed: {}", o.tool_name, o.summary));
        }
    }
    lines.join("\n")
}
