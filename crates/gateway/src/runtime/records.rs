//! Durable rows for the Unified Tool Executor's tool_calls table (§4.5)
//! and the Stage Result ledger (§3.6), kept as peer in-memory stores next
//! to the Task Store for the same reason: the Runner needs to look them
//! up by execution_id independently of the conversation state blob.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use sa_domain::model::{ReviewStatus, StageResult, StageResultType, ToolCallRecord, ToolCallStatus};
use serde_json::Value;
use uuid::Uuid;

#[derive(Default)]
pub struct ToolCallStore {
    rows: RwLock<HashMap<Uuid, ToolCallRecord>>,
}

impl ToolCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a `pending` row before dispatch (§4.5 "a tool_calls row is
    /// inserted with status pending").
    pub fn start(
        &self,
        execution_id: Uuid,
        step_id: Option<Uuid>,
        tool_name: impl Into<String>,
        parameters: HashMap<String, Value>,
        factory_cluster: impl Into<String>,
    ) -> Uuid {
        let now = Utc::now();
        let row = ToolCallRecord {
            id: Uuid::new_v4(),
            execution_id,
            step_id,
            tool_name: tool_name.into(),
            parameters,
            response: None,
            status: ToolCallStatus::Pending,
            error: None,
            duration_ms: None,
            factory_cluster: factory_cluster.into(),
            started_at: now,
            completed_at: None,
            created_at: now,
        };
        let id = row.id;
        self.rows.write().insert(id, row);
        id
    }

    pub fn complete(&self, id: &Uuid, response: Value, duration_ms: i64) {
        let mut rows = self.rows.write();
        if let Some(row) = rows.get_mut(id) {
            row.status = ToolCallStatus::Completed;
            row.response = Some(response);
            row.duration_ms = Some(duration_ms);
            row.completed_at = Some(Utc::now());
        }
    }

    pub fn fail(&self, id: &Uuid, error: String, duration_ms: i64) {
        let mut rows = self.rows.write();
        if let Some(row) = rows.get_mut(id) {
            row.status = ToolCallStatus::Failed;
            row.error = Some(error);
            row.duration_ms = Some(duration_ms);
            row.completed_at = Some(Utc::now());
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<ToolCallRecord> {
        self.rows.read().get(id).cloned()
    }

    /// Rows for `execution_id` created after `watermark`, oldest first
    /// (§4.7 "query tool_calls created after the tool-call watermark").
    pub fn list_since(
        &self,
        execution_id: &Uuid,
        watermark: Option<chrono::DateTime<Utc>>,
    ) -> Vec<ToolCallRecord> {
        let mut v: Vec<ToolCallRecord> = self
            .rows
            .read()
            .values()
            .filter(|r| r.execution_id == *execution_id)
            .filter(|r| watermark.map_or(true, |wm| r.created_at > wm))
            .cloned()
            .collect();
        v.sort_by_key(|r| r.created_at);
        v
    }
}

#[derive(Default)]
pub struct StageResultStore {
    rows: RwLock<HashMap<Uuid, StageResult>>,
}

impl StageResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        execution_id: Uuid,
        step_id: Option<Uuid>,
        stage_name: impl Into<String>,
        result_type: StageResultType,
        content: HashMap<String, Value>,
        preview: impl Into<String>,
        requires_review: bool,
    ) -> Uuid {
        let row = StageResult {
            id: Uuid::new_v4(),
            execution_id,
            step_id,
            stage_name: stage_name.into(),
            result_type,
            content,
            preview: preview.into(),
            requires_review,
            review_status: ReviewStatus::Pending,
            artifact_id: None,
            created_at: Utc::now(),
        };
        let id = row.id;
        self.rows.write().insert(id, row);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<StageResult> {
        self.rows.read().get(id).cloned()
    }

    pub fn list_since(
        &self,
        execution_id: &Uuid,
        watermark: Option<chrono::DateTime<Utc>>,
    ) -> Vec<StageResult> {
        let mut v: Vec<StageResult> = self
            .rows
            .read()
            .values()
            .filter(|r| r.execution_id == *execution_id)
            .filter(|r| watermark.map_or(true, |wm| r.created_at > wm))
            .cloned()
            .collect();
        v.sort_by_key(|r| r.created_at);
        v
    }
}
