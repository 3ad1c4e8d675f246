//! Core data model: Workspace, Task, Event, Tool Call, Stage Result, Artifact.
//!
//! These are the contract-level entities the execution core reads and
//! writes. Identifiers are opaque UUIDv4s; timestamps are UTC instants with
//! at least millisecond precision.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A per-pack auto-execution override: `{confidence_threshold, auto_execute}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoExecuteOverride {
    pub confidence_threshold: f64,
    pub auto_execute: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Qa,
    Execution,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPriority {
    Low,
    Medium,
    High,
}

/// A container owned by one principal. The core only reads workspace
/// records; lifecycle is owned by an external flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub owner_principal_id: Uuid,
    pub locale: String,
    pub storage_root: String,
    pub execution_mode: ExecutionMode,
    pub priority: ExecutionPriority,
    /// pack_id -> override
    #[serde(default)]
    pub auto_execution_config: HashMap<String, AutoExecuteOverride>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    CancelledByUser,
    Expired,
}

impl TaskStatus {
    /// Terminal statuses never transition further (§3.2 invariant), with the
    /// documented restart-resurrection exception handled separately by the
    /// Task Store's heartbeat call, not by this predicate.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::Failed
                | TaskStatus::CancelledByUser
                | TaskStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PlaybookExecution,
    Suggestion,
    AgentDispatch,
    Execution,
    Extraction,
}

/// Records which zombie-reaper rule fired, or that a timeout swept the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutDiagnostic {
    pub last_step_index: i64,
    pub last_step_status: String,
    pub age_seconds: i64,
}

/// Durable mid-run state carried on a Task. Everything here round-trips
/// through the Task Store untouched except the fields the Task Store and
/// Playbook Runner are documented to write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_confirmation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_diagnostic: Option<TimeoutDiagnostic>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// The restart marker that gates revival (§4.2 "Revival").
pub const RESTART_ERROR_MARKER: &str = "Execution interrupted by server restart";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub execution_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub pack_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    pub result: Option<HashMap<String, Value>>,
    pub execution_context: Option<ExecutionContext>,
    #[serde(default)]
    pub storyline_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(workspace_id: Uuid, pack_id: impl Into<String>, task_type: TaskType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            execution_id: None,
            project_id: None,
            pack_id: pack_id.into(),
            task_type,
            status: TaskStatus::Pending,
            params: HashMap::new(),
            result: None,
            execution_context: None,
            storyline_tags: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event (§3.3)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    User,
    Assistant,
    System,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    PlaybookStep,
    ExecutionChat,
    ToolCall,
    AgentExecution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub profile_id: Option<Uuid>,
    pub thread_id: Option<Uuid>,
    /// Cross-reference ids, e.g. the execution_id a step belongs to.
    #[serde(default)]
    pub entity_ids: Vec<Uuid>,
    pub actor: Actor,
    pub event_type: EventType,
    pub payload: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        workspace_id: Uuid,
        actor: Actor,
        event_type: EventType,
        payload: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            profile_id: None,
            thread_id: None,
            entity_ids: Vec::new(),
            actor,
            event_type,
            payload,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Events are ordered strictly by timestamp, tie-broken by id (§3.3).
pub fn event_order_key(e: &Event) -> (DateTime<Utc>, Uuid) {
    (e.timestamp, e.id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool Call (§3.5)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: Option<Uuid>,
    pub tool_name: String,
    pub parameters: HashMap<String, Value>,
    pub response: Option<Value>,
    pub status: ToolCallStatus,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub factory_cluster: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage Result (§3.6)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageResultType {
    Draft,
    Analysis,
    Design,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: Option<Uuid>,
    pub stage_name: String,
    pub result_type: StageResultType,
    pub content: HashMap<String, Value>,
    pub preview: String,
    pub requires_review: bool,
    pub review_status: ReviewStatus,
    pub artifact_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifact (§3.7)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Docx,
    Draft,
    Checklist,
    Config,
    Audio,
    Canva,
    Post,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryActionType {
    Copy,
    Download,
    OpenExternal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub version: u32,
    pub is_latest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub intent_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub execution_id: Uuid,
    pub playbook_code: String,
    pub artifact_type: ArtifactType,
    pub title: String,
    pub summary: String,
    pub content: HashMap<String, Value>,
    pub storage_ref: String,
    pub sync_state: Option<SyncState>,
    pub primary_action_type: PrimaryActionType,
    pub metadata: ArtifactMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::CancelledByUser.is_terminal());
        assert!(TaskStatus::Expired.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn event_order_key_ties_break_on_id() {
        let ws = Uuid::new_v4();
        let ts = Utc::now();
        let mut a = Event::new(ws, Actor::User, EventType::Message, HashMap::new());
        let mut b = Event::new(ws, Actor::User, EventType::Message, HashMap::new());
        a.timestamp = ts;
        b.timestamp = ts;
        let (ka, kb) = (event_order_key(&a), event_order_key(&b));
        assert_eq!(ka.0, kb.0);
        assert_ne!(ka.1, kb.1);
    }

    #[test]
    fn task_new_starts_pending() {
        let t = Task::new(Uuid::new_v4(), "daily_planning", TaskType::PlaybookExecution);
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.started_at.is_none());
        assert!(t.completed_at.is_none());
    }
}
