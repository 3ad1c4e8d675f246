//! The streaming projector (§4.7): a tick-driven poller that turns a Task
//! Store + Event Log + tool-call/stage-result rows into an ordered sequence
//! of wire events for one execution_id.
//!
//! Built around an `async_stream::stream!` block, the same way a
//! broadcast-channel SSE handler would be, but there is no broadcast
//! channel backing execution state here — the loop polls the stores
//! directly on a fixed tick instead of awaiting `rx.recv()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use parking_lot::RwLock;
use sa_domain::config::StreamConfig;
use sa_domain::model::{EventType, StageResult, Task, TaskStatus, ToolCallRecord};
use serde::Serialize;
use uuid::Uuid;

use super::cancel::CancelToken;
use super::event_log::EventLog;
use super::records::{StageResultStore, ToolCallStore};
use super::task_store::TaskStore;

/// The closed set of `type` discriminants in the stream wire format (§6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ExecutionUpdate { execution: ExecutionView },
    StepUpdate { step: serde_json::Value, current_step_index: i64 },
    ToolCallUpdate { tool_call: ToolCallRecord },
    StageResult { stage_result: StageResult },
    ExecutionChat { message: serde_json::Value },
    ExecutionCompleted { execution_id: Uuid, final_status: &'static str },
    Error { message: String },
    StreamEnd {},
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    pub id: Uuid,
    pub status: TaskStatus,
    pub current_step_index: Option<i64>,
    pub total_steps: Option<i64>,
    pub paused_at: Option<DateTime<Utc>>,
}

/// The emitted-triple dedup key (§4.7 "last-emitted (status,
/// current_step_index, paused_at) triple").
type EmittedTriple = (TaskStatus, Option<i64>, Option<DateTime<Utc>>);

#[derive(Default, Clone)]
struct Watermarks {
    step_ts: Option<DateTime<Utc>>,
    chat_ts: Option<DateTime<Utc>>,
    tool_call_ts: Option<DateTime<Utc>>,
    stage_result_ts: Option<DateTime<Utc>>,
    last_triple: Option<EmittedTriple>,
}

pub struct StreamProjector {
    task_store: Arc<TaskStore>,
    event_log: Arc<EventLog>,
    tool_calls: Arc<ToolCallStore>,
    stage_results: Arc<StageResultStore>,
    config: StreamConfig,
    watermarks: RwLock<HashMap<Uuid, Watermarks>>,
}

impl StreamProjector {
    pub fn new(
        task_store: Arc<TaskStore>,
        event_log: Arc<EventLog>,
        tool_calls: Arc<ToolCallStore>,
        stage_results: Arc<StageResultStore>,
        config: StreamConfig,
    ) -> Self {
        Self {
            task_store,
            event_log,
            tool_calls,
            stage_results,
            config,
            watermarks: RwLock::new(HashMap::new()),
        }
    }

    /// One tick of the loop in §4.7. Returns the events due this tick, plus
    /// whether the stream should stop (task missing, or execution reached a
    /// terminal status).
    fn poll_once(&self, execution_id: Uuid) -> (Vec<StreamEvent>, bool) {
        let Some(task) = self.task_store.get(&execution_id) else {
            return (
                vec![StreamEvent::Error { message: "execution not found".to_string() }],
                true,
            );
        };

        let mut events = Vec::new();
        let mut wms = self.watermarks.write();
        let wm = wms.entry(execution_id).or_default();

        let ctx = task.execution_context.as_ref();
        let triple: EmittedTriple = (
            task.status,
            ctx.and_then(|c| c.current_step_index),
            ctx.and_then(|c| c.paused_at),
        );
        if wm.last_triple != Some(triple) {
            wm.last_triple = Some(triple);
            events.push(StreamEvent::ExecutionUpdate {
                execution: ExecutionView {
                    id: execution_id,
                    status: task.status,
                    current_step_index: triple.1,
                    total_steps: ctx.and_then(|c| c.total_steps),
                    paused_at: triple.2,
                },
            });
        }

        if task.status.is_terminal() {
            let final_status = match task.status {
                TaskStatus::Succeeded => "completed",
                TaskStatus::CancelledByUser => "cancelled",
                _ => "failed",
            };
            events.push(StreamEvent::ExecutionCompleted { execution_id, final_status });
            events.push(StreamEvent::StreamEnd {});
            return (events, true);
        }

        for event in self.event_log.list_for_entity(&execution_id) {
            match event.event_type {
                EventType::PlaybookStep => {
                    if wm.step_ts.map_or(true, |ts| event.timestamp > ts) {
                        wm.step_ts = Some(event.timestamp);
                        let current_step_index =
                            event.payload.get("step_index").and_then(|v| v.as_i64()).unwrap_or(0);
                        events.push(StreamEvent::StepUpdate {
                            step: serde_json::json!(event.payload),
                            current_step_index,
                        });
                    }
                }
                EventType::ExecutionChat => {
                    if wm.chat_ts.map_or(true, |ts| event.timestamp > ts) {
                        wm.chat_ts = Some(event.timestamp);
                        events.push(StreamEvent::ExecutionChat { message: serde_json::json!(event.payload) });
                    }
                }
                _ => {}
            }
        }

        for row in self.tool_calls.list_since(&execution_id, wm.tool_call_ts) {
            wm.tool_call_ts = Some(row.created_at);
            events.push(StreamEvent::ToolCallUpdate { tool_call: row });
        }

        for row in self.stage_results.list_since(&execution_id, wm.stage_result_ts) {
            wm.stage_result_ts = Some(row.created_at);
            events.push(StreamEvent::StageResult { stage_result: row });
        }

        (events, false)
    }

    /// Wraps `poll_once` into a pollable stream for the API layer's SSE
    /// handler, ticking at `config.tick_interval_ms` until the execution
    /// reaches a terminal status or `cancel` fires (§4.7 step 7).
    pub fn subscribe(
        self: Arc<Self>,
        execution_id: Uuid,
        cancel: CancelToken,
    ) -> impl Stream<Item = StreamEvent> {
        let tick = Duration::from_millis(self.config.tick_interval_ms);
        async_stream::stream! {
            loop {
                if cancel.is_cancelled() {
                    yield StreamEvent::StreamEnd {};
                    break;
                }

                let (events, done) = self.poll_once(execution_id);
                for event in events {
                    yield event;
                }
                if done {
                    break;
                }

                tokio::time::sleep(tick).await;
            }
        }
    }

    pub fn forget(&self, execution_id: &Uuid) {
        self.watermarks.write().remove(execution_id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;

    use sa_domain::model::{Actor, Event, ExecutionContext, Task, TaskType};

    use super::*;

    fn make_projector() -> (Arc<StreamProjector>, Arc<TaskStore>, Arc<EventLog>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let task_store = Arc::new(TaskStore::new());
        let event_log = Arc::new(EventLog::new(dir.path()));
        let tool_calls = Arc::new(ToolCallStore::new());
        let stage_results = Arc::new(StageResultStore::new());
        let projector = Arc::new(StreamProjector::new(
            task_store.clone(),
            event_log.clone(),
            tool_calls.clone(),
            stage_results.clone(),
            StreamConfig::default(),
        ));
        (projector, task_store, event_log, dir)
    }

    fn running_task(execution_id: Uuid, workspace_id: Uuid) -> Task {
        let mut task = Task::new(workspace_id, "daily_planning", TaskType::PlaybookExecution);
        task.id = execution_id;
        task.execution_id = Some(execution_id);
        task.status = TaskStatus::Running;
        task.execution_context = Some(ExecutionContext {
            current_step_index: Some(0),
            total_steps: Some(3),
            ..Default::default()
        });
        task
    }

    #[test]
    fn missing_execution_emits_error_and_stops() {
        let (projector, _store, _log, _dir) = make_projector();
        let (events, done) = projector.poll_once(Uuid::new_v4());
        assert!(done);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
    }

    #[test]
    fn first_poll_emits_execution_update_once() {
        let (projector, store, _log, _dir) = make_projector();
        let execution_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        store.insert(running_task(execution_id, workspace_id));

        let (events, done) = projector.poll_once(execution_id);
        assert!(!done);
        assert!(matches!(events[0], StreamEvent::ExecutionUpdate { .. }));

        let (events, _) = projector.poll_once(execution_id);
        assert!(events.is_empty(), "unchanged triple should not re-emit");
    }

    #[test]
    fn terminal_status_emits_completed_then_stream_end() {
        let (projector, store, _log, _dir) = make_projector();
        let execution_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        let task = running_task(execution_id, workspace_id);
        store.insert(task);
        store.update(&execution_id, |t| t.status = TaskStatus::Succeeded);

        let (events, done) = projector.poll_once(execution_id);
        assert!(done);
        assert!(matches!(
            events[events.len() - 2],
            StreamEvent::ExecutionCompleted { final_status: "completed", .. }
        ));
        assert!(matches!(events[events.len() - 1], StreamEvent::StreamEnd {}));
    }

    #[test]
    fn step_and_chat_events_surface_once_each() {
        let (projector, store, log, _dir) = make_projector();
        let execution_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        store.insert(running_task(execution_id, workspace_id));
        projector.poll_once(execution_id);

        let mut payload = Map::new();
        payload.insert("step_index".to_string(), serde_json::json!(1));
        let mut event = Event::new(workspace_id, Actor::Assistant, EventType::PlaybookStep, payload);
        event.entity_ids = vec![execution_id];
        log.append(event);

        let (events, _) = projector.poll_once(execution_id);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::StepUpdate { current_step_index: 1, .. }));

        let (events, _) = projector.poll_once(execution_id);
        assert!(events.is_empty());
    }

    #[test]
    fn tool_call_and_stage_result_rows_surface_once_each() {
        let (projector, store, _log, _dir) = make_projector();
        let execution_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        store.insert(running_task(execution_id, workspace_id));
        projector.poll_once(execution_id);

        projector.tool_calls.start(execution_id, None, "filesystem_read_file", Map::new(), "local_mcp");
        projector.stage_results.insert(
            execution_id,
            None,
            "draft",
            sa_domain::model::StageResultType::Draft,
            Map::new(),
            "preview",
            false,
        );

        let (events, _) = projector.poll_once(execution_id);
        assert!(events.iter().any(|e| matches!(e, StreamEvent::ToolCallUpdate { .. })));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::StageResult { .. })));

        let (events, _) = projector.poll_once(execution_id);
        assert!(events.is_empty());
    }
}
