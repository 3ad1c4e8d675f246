//! The Checkpoint Manager (§4.6 "Explicit checkpoint objects"): a peer
//! store of execution snapshot documents, separate from the Task Store's
//! own `execution_context.conversation_state` field, used for offline
//! recovery and UI-facing execution history.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sa_domain::model::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::conversation::ConversationManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub workspace_id: Uuid,
    pub status: TaskStatus,
    pub conversation_state: Option<Value>,
    pub current_step_index: Option<i64>,
    pub total_steps: Option<i64>,
    pub phase_summary: Vec<String>,
    pub intent_id: Option<Uuid>,
    pub suggestion_id: Option<Uuid>,
    pub failure_type: Option<String>,
    pub error: Option<String>,
    pub supports_resume: bool,
    pub snapshotted_at: DateTime<Utc>,
}

/// A Task + its latest snapshot, reconstructed by `resume_from_checkpoint`.
pub struct ExecutionSession {
    pub task: Task,
    pub snapshot: ExecutionSnapshot,
}

pub struct CheckpointManager {
    snapshots: RwLock<HashMap<Uuid, ExecutionSnapshot>>,
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Write a snapshot from the current Task + Conversation Manager
    /// state. Called at the end of every `start` and `continue` turn
    /// (§4.6 "Checkpoint").
    pub fn checkpoint(&self, task: &Task, conversation: &ConversationManager) -> ExecutionSnapshot {
        let execution_id = task.execution_id.unwrap_or(task.id);
        let ctx = task.execution_context.as_ref();

        let phase_summary = conversation
            .history
            .iter()
            .filter(|t| matches!(t.role, super::conversation::TurnRole::Assistant))
            .map(|t| t.content.clone())
            .collect();

        let supports_resume = matches!(task.status, TaskStatus::Running | TaskStatus::Succeeded)
            && ctx.and_then(|c| c.conversation_state.as_ref()).is_some();

        let snapshot = ExecutionSnapshot {
            execution_id,
            workspace_id: task.workspace_id,
            status: task.status,
            conversation_state: ctx.and_then(|c| c.conversation_state.clone()),
            current_step_index: ctx.and_then(|c| c.current_step_index),
            total_steps: ctx.and_then(|c| c.total_steps),
            phase_summary,
            intent_id: ctx.and_then(|c| c.intent_id),
            suggestion_id: ctx.and_then(|c| c.suggestion_id),
            failure_type: ctx.and_then(|c| c.failure_type.clone()),
            error: task.error.clone(),
            supports_resume,
            snapshotted_at: Utc::now(),
        };

        self.snapshots.write().insert(execution_id, snapshot.clone());
        snapshot
    }

    pub fn get(&self, execution_id: &Uuid) -> Option<ExecutionSnapshot> {
        self.snapshots.read().get(execution_id).cloned()
    }

    /// Reconstruct a Task+ExecutionSession view from the latest snapshot,
    /// for offline recovery workflows (§4.6 "Explicit checkpoint objects").
    /// Returns `None` if there is no snapshot, or the snapshot's own flag
    /// says resumption isn't supported.
    pub fn resume_from_checkpoint(&self, execution_id: &Uuid, task: Task) -> Option<ExecutionSession> {
        let snapshot = self.get(execution_id)?;
        if !snapshot.supports_resume {
            return None;
        }
        Some(ExecutionSession { task, snapshot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::model::{ExecutionContext, TaskType};

    fn running_task_with_state(execution_id: Uuid, state: Value) -> Task {
        let mut task = Task::new(Uuid::new_v4(), "daily_planning", TaskType::PlaybookExecution);
        task.execution_id = Some(execution_id);
        task.status = TaskStatus::Running;
        task.execution_context = Some(ExecutionContext {
            conversation_state: Some(state),
            current_step_index: Some(2),
            total_steps: Some(5),
            ..Default::default()
        });
        task
    }

    #[test]
    fn checkpoint_captures_step_counters_and_supports_resume() {
        let manager = CheckpointManager::new();
        let execution_id = Uuid::new_v4();
        let task = running_task_with_state(execution_id, serde_json::json!({"k": 1}));
        let conv = ConversationManager::new("daily_planning", "sop", task.workspace_id, "en-US");

        let snapshot = manager.checkpoint(&task, &conv);
        assert_eq!(snapshot.current_step_index, Some(2));
        assert_eq!(snapshot.total_steps, Some(5));
        assert!(snapshot.supports_resume);
    }

    #[test]
    fn resume_from_checkpoint_reconstructs_session() {
        let manager = CheckpointManager::new();
        let execution_id = Uuid::new_v4();
        let task = running_task_with_state(execution_id, serde_json::json!({"k": 1}));
        let conv = ConversationManager::new("daily_planning", "sop", task.workspace_id, "en-US");
        manager.checkpoint(&task, &conv);

        let session = manager.resume_from_checkpoint(&execution_id, task.clone()).unwrap();
        assert_eq!(session.task.id, task.id);
        assert_eq!(session.snapshot.execution_id, execution_id);
    }

    #[test]
    fn no_snapshot_means_no_resume() {
        let manager = CheckpointManager::new();
        let task = Task::new(Uuid::new_v4(), "p", TaskType::PlaybookExecution);
        assert!(manager.resume_from_checkpoint(&Uuid::new_v4(), task).is_none());
    }

    #[test]
    fn failed_task_without_conversation_state_does_not_support_resume() {
        let manager = CheckpointManager::new();
        let execution_id = Uuid::new_v4();
        let mut task = Task::new(Uuid::new_v4(), "p", TaskType::PlaybookExecution);
        task.execution_id = Some(execution_id);
        task.status = TaskStatus::Failed;
        let conv = ConversationManager::new("p", "sop", task.workspace_id, "en-US");

        let snapshot = manager.checkpoint(&task, &conv);
        assert!(!snapshot.supports_resume);
        assert!(manager.resume_from_checkpoint(&execution_id, task).is_none());
    }
}
