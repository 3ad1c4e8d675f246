//! The durable Task Store: atomic claim, heartbeat liveness, and zombie
//! reaping for playbook-execution tasks (queue semantics only — the
//! execution's own state lives in the Conversation Manager / Checkpoint
//! Manager).
//!
//! In-memory and `RwLock`-guarded, with a claim/heartbeat/reap protocol
//! that gives it a durable-queue contract: a crashed worker's tasks get
//! reclaimed once their heartbeat goes stale, rather than vanishing with
//! the worker.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use sa_domain::error::{Error, Result};
use sa_domain::model::{ExecutionContext, Task, TaskStatus, TimeoutDiagnostic, RESTART_ERROR_MARKER};
use serde_json::Value;
use uuid::Uuid;

pub struct TaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    /// The runner heartbeat table (§4.2), separate from task rows: lets a
    /// scheduler self-elect as worker via `has_active_runner` rather than
    /// every process blindly polling.
    runner_heartbeats: RwLock<HashMap<String, chrono::DateTime<Utc>>>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::Failed => "failed",
        TaskStatus::CancelledByUser => "cancelled_by_user",
        TaskStatus::Expired => "expired",
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            runner_heartbeats: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, task: Task) -> Uuid {
        let id = task.id;
        self.tasks.write().insert(id, task);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }

    pub fn update<F>(&self, id: &Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write();
        if let Some(task) = tasks.get_mut(id) {
            f(task);
            true
        } else {
            false
        }
    }

    /// Atomically claim the oldest pending task for a runner, if any.
    /// A single write-lock critical section stands in for the
    /// compare-and-swap single-row UPDATE the contract describes.
    pub fn try_claim(&self, runner_id: &str) -> Option<Task> {
        let mut tasks = self.tasks.write();
        let candidate_id = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by_key(|t| t.created_at)
            .map(|t| t.id)?;

        let task = tasks.get_mut(&candidate_id)?;
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        let ctx = task.execution_context.get_or_insert_with(ExecutionContext::default);
        ctx.runner_id = Some(runner_id.to_string());
        ctx.heartbeat_at = Some(now);
        Some(task.clone())
    }

    /// Atomically claim one specific pending task by id, for a runner that
    /// already knows which task it wants (the synchronous "execute now"
    /// path, §4.1) rather than pulling whatever is oldest. Same claim
    /// bookkeeping as `try_claim`, so it counts toward the same "exactly 0
    /// or 1 successful claims per task" invariant (§8).
    pub fn try_claim_id(&self, id: &Uuid, runner_id: &str) -> Option<Task> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(id)?;
        if task.status != TaskStatus::Pending {
            return None;
        }
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        let ctx = task.execution_context.get_or_insert_with(ExecutionContext::default);
        ctx.runner_id = Some(runner_id.to_string());
        ctx.heartbeat_at = Some(now);
        Some(task.clone())
    }

    /// Refresh the liveness heartbeat for a task claimed by `runner_id` and
    /// report whether the runner should stop (§4.2 "abort check"): the
    /// task has since been cancelled, expired, or failed by something other
    /// than this runner.
    ///
    /// Also implements Revival: a task this runner is heartbeating that was
    /// marked `failed` with `RESTART_ERROR_MARKER` resurrects to `running`
    /// (clearing the error) instead of rejecting the call for a runner-id
    /// mismatch, since the resuming runner is by definition not the one
    /// that held the original claim.
    pub fn heartbeat(&self, id: &Uuid, runner_id: &str) -> Result<bool> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: "task",
            id: id.to_string(),
        })?;

        if task.status == TaskStatus::Failed && task.error.as_deref() == Some(RESTART_ERROR_MARKER) {
            task.status = TaskStatus::Running;
            task.error = None;
            task.completed_at = None;
            let ctx = task.execution_context.get_or_insert_with(ExecutionContext::default);
            ctx.runner_id = Some(runner_id.to_string());
            ctx.heartbeat_at = Some(Utc::now());
            return Ok(false);
        }

        let claimed_by = task
            .execution_context
            .as_ref()
            .and_then(|c| c.runner_id.as_deref());
        if claimed_by != Some(runner_id) {
            return Err(Error::Stale(format!(
                "task {id} is not claimed by runner {runner_id}"
            )));
        }
        task.execution_context
            .get_or_insert_with(ExecutionContext::default)
            .heartbeat_at = Some(Utc::now());

        let should_abort = matches!(task.status, TaskStatus::CancelledByUser | TaskStatus::Expired)
            || (task.status == TaskStatus::Failed && task.error.as_deref() != Some(RESTART_ERROR_MARKER));
        Ok(should_abort)
    }

    /// Record that `runner_id` is alive (called once per poll cycle).
    pub fn upsert_runner_heartbeat(&self, runner_id: &str) {
        self.runner_heartbeats.write().insert(runner_id.to_string(), Utc::now());
    }

    /// Whether any runner has heartbeated within `max_age`.
    pub fn has_active_runner(&self, max_age: chrono::Duration) -> bool {
        let now = Utc::now();
        self.runner_heartbeats
            .read()
            .values()
            .any(|hb| now - *hb <= max_age)
    }

    pub fn complete(&self, id: &Uuid, result: HashMap<String, Value>) -> bool {
        self.update(id, |t| {
            t.status = TaskStatus::Succeeded;
            t.completed_at = Some(Utc::now());
            t.result = Some(result);
        })
    }

    pub fn fail(&self, id: &Uuid, error: String) -> bool {
        self.update(id, |t| {
            t.status = TaskStatus::Failed;
            t.completed_at = Some(Utc::now());
            t.error = Some(error);
        })
    }

    pub fn cancel(&self, id: &Uuid) -> bool {
        let mut tasks = self.tasks.write();
        if let Some(task) = tasks.get_mut(id) {
            if task.status.is_terminal() {
                return false;
            }
            task.status = TaskStatus::CancelledByUser;
            task.completed_at = Some(Utc::now());
            return true;
        }
        false
    }

    /// Evaluate both zombie-liveness TTL rules in a single pass (§4.2, §8
    /// S4): a running task with a heartbeat older than `heartbeat_ttl` is
    /// reaped, as is one that never heartbeat and started more than
    /// `no_heartbeat_ttl` ago. Comparison is strict `>` — a task exactly at
    /// the boundary is still alive. Reaped tasks become `failed`, with the
    /// error recording which rule fired and how long ago, matching the
    /// original's `reason` string.
    pub fn reap_zombies(
        &self,
        heartbeat_ttl: chrono::Duration,
        no_heartbeat_ttl: chrono::Duration,
    ) -> Vec<Uuid> {
        let now = Utc::now();
        let mut reaped = Vec::new();
        let mut tasks = self.tasks.write();
        for task in tasks.values_mut() {
            if task.status != TaskStatus::Running {
                continue;
            }
            let heartbeat_at = task.execution_context.as_ref().and_then(|c| c.heartbeat_at);
            let reason = match heartbeat_at {
                Some(hb) => {
                    let age = now - hb;
                    (age > heartbeat_ttl).then(|| {
                        format!(
                            "Zombie: heartbeat stale for {}s (threshold {}m)",
                            age.num_seconds(),
                            heartbeat_ttl.num_minutes()
                        )
                    })
                }
                None => task.started_at.and_then(|s| {
                    let age = now - s;
                    (age > no_heartbeat_ttl).then(|| {
                        format!(
                            "Zombie: no heartbeat, running for {}s (threshold {}m)",
                            age.num_seconds(),
                            no_heartbeat_ttl.num_minutes()
                        )
                    })
                }),
            };
            let Some(reason) = reason else { continue };

            let age_seconds = task
                .started_at
                .map(|s| (now - s).num_seconds())
                .unwrap_or(0);
            let current_step_index = task
                .execution_context
                .as_ref()
                .and_then(|c| c.current_step_index)
                .unwrap_or(-1);
            let status_before = status_label(task.status).to_string();
            let ctx = task.execution_context.get_or_insert_with(ExecutionContext::default);
            ctx.timeout_diagnostic = Some(TimeoutDiagnostic {
                last_step_index: current_step_index,
                last_step_status: status_before,
                age_seconds,
            });
            ctx.runner_id = None;
            ctx.heartbeat_at = None;
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            task.error = Some(reason);
            reaped.push(task.id);
        }
        reaped
    }

    /// All tasks eligible for claiming, oldest first (for diagnostics).
    pub fn list_runnable(&self) -> Vec<Task> {
        let mut v: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        v.sort_by_key(|t| t.created_at);
        v
    }

    /// All tasks in a workspace regardless of status, newest first (§6
    /// `GET /workspaces/{wid}/executions`).
    pub fn list_for_workspace(&self, workspace_id: &Uuid) -> Vec<Task> {
        let mut v: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.workspace_id == *workspace_id)
            .cloned()
            .collect();
        v.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        v
    }

    /// Completed or failed tasks finished within the last `window`,
    /// newest first (§11, `list_recently_completed_tasks`).
    pub fn list_recently_completed(&self, workspace_id: &Uuid, window: chrono::Duration) -> Vec<Task> {
        let cutoff = Utc::now() - window;
        let mut v: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| {
                t.workspace_id == *workspace_id
                    && t.status.is_terminal()
                    && t.completed_at.map_or(false, |c| c > cutoff)
            })
            .cloned()
            .collect();
        v.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        v
    }

    /// Pending or running tasks for `pack_id` in the same workspace whose
    /// params match `source`/`files` as sets, created within `window`
    /// (§11, `find_existing_suggestion_tasks` — duplicate suppression).
    pub fn find_duplicate_suggestion(
        &self,
        workspace_id: &Uuid,
        pack_id: &str,
        params: &HashMap<String, Value>,
        window: chrono::Duration,
    ) -> Option<Task> {
        let cutoff = Utc::now() - window;
        let source = params.get("source");
        let files = params
            .get("files")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().collect::<HashSet<_>>());

        self.tasks
            .read()
            .values()
            .filter(|t| {
                t.workspace_id == *workspace_id
                    && t.pack_id == pack_id
                    && !t.status.is_terminal()
                    && t.created_at > cutoff
            })
            .find(|t| {
                let same_source = source == t.params.get("source");
                let same_files = match (
                    &files,
                    t.params
                        .get("files")
                        .and_then(|v| v.as_array())
                        .map(|a| a.iter().collect::<HashSet<_>>()),
                ) {
                    (Some(a), Some(b)) => *a == b,
                    (None, None) => true,
                    _ => false,
                };
                same_source && same_files
            })
            .cloned()
    }

    /// Remove terminal tasks older than `older_than` (memory hygiene).
    pub fn evict_terminal(&self, older_than: chrono::Duration) {
        let cutoff = Utc::now() - older_than;
        let mut tasks = self.tasks.write();
        tasks.retain(|_, t| {
            !t.status.is_terminal() || t.completed_at.map_or(true, |c| c > cutoff)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::model::TaskType;

    fn new_task(workspace_id: Uuid) -> Task {
        Task::new(workspace_id, "pack.demo", TaskType::PlaybookExecution)
    }

    fn params_of(json: Value) -> HashMap<String, Value> {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn claim_picks_oldest_pending() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        let mut older = new_task(wid);
        older.created_at = Utc::now() - chrono::Duration::seconds(10);
        let older_id = older.id;
        store.insert(older);
        store.insert(new_task(wid));

        let claimed = store.try_claim("runner-1").unwrap();
        assert_eq!(claimed.id, older_id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(
            claimed
                .execution_context
                .as_ref()
                .and_then(|c| c.runner_id.as_deref()),
            Some("runner-1")
        );
    }

    #[test]
    fn claim_with_no_pending_returns_none() {
        let store = TaskStore::new();
        assert!(store.try_claim("runner-1").is_none());
    }

    #[test]
    fn heartbeat_rejects_wrong_runner() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        store.insert(new_task(wid));
        let claimed = store.try_claim("runner-1").unwrap();

        let err = store.heartbeat(&claimed.id, "runner-2").unwrap_err();
        assert!(matches!(err, Error::Stale(_)));
    }

    #[test]
    fn heartbeat_updates_claimed_task() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        store.insert(new_task(wid));
        let claimed = store.try_claim("runner-1").unwrap();
        assert_eq!(store.heartbeat(&claimed.id, "runner-1").unwrap(), false);
    }

    #[test]
    fn heartbeat_signals_abort_when_cancelled() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        store.insert(new_task(wid));
        let claimed = store.try_claim("runner-1").unwrap();
        store.cancel(&claimed.id);
        assert_eq!(store.heartbeat(&claimed.id, "runner-1").unwrap(), true);
    }

    #[test]
    fn heartbeat_signals_abort_when_externally_failed() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        store.insert(new_task(wid));
        let claimed = store.try_claim("runner-1").unwrap();
        store.fail(&claimed.id, "boom".to_string());
        assert_eq!(store.heartbeat(&claimed.id, "runner-1").unwrap(), true);
    }

    #[test]
    fn heartbeat_revives_restart_interrupted_task() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        store.insert(new_task(wid));
        let claimed = store.try_claim("runner-1").unwrap();
        store.fail(&claimed.id, RESTART_ERROR_MARKER.to_string());

        let should_abort = store.heartbeat(&claimed.id, "runner-2").unwrap();
        assert_eq!(should_abort, false);
        let after = store.get(&claimed.id).unwrap();
        assert_eq!(after.status, TaskStatus::Running);
        assert!(after.error.is_none());
        assert_eq!(
            after.execution_context.as_ref().and_then(|c| c.runner_id.as_deref()),
            Some("runner-2")
        );
    }

    #[test]
    fn reap_exact_ttl_boundary_is_not_reaped() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        store.insert(new_task(wid));
        let claimed = store.try_claim("runner-1").unwrap();
        store.update(&claimed.id, |t| {
            t.execution_context.get_or_insert_with(ExecutionContext::default).heartbeat_at =
                Some(Utc::now() - chrono::Duration::minutes(10));
        });

        let reaped = store.reap_zombies(chrono::Duration::minutes(10), chrono::Duration::minutes(30));
        assert!(reaped.is_empty());
    }

    #[test]
    fn reap_past_heartbeat_ttl_marks_task_failed() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        store.insert(new_task(wid));
        let claimed = store.try_claim("runner-1").unwrap();
        store.update(&claimed.id, |t| {
            t.execution_context.get_or_insert_with(ExecutionContext::default).heartbeat_at =
                Some(Utc::now() - chrono::Duration::minutes(11));
        });

        let reaped = store.reap_zombies(chrono::Duration::minutes(10), chrono::Duration::minutes(30));
        assert_eq!(reaped, vec![claimed.id]);
        let after = store.get(&claimed.id).unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert!(after.completed_at.is_some());
        assert!(after.error.as_deref().unwrap().contains("heartbeat stale for"));
        assert!(after
            .execution_context
            .as_ref()
            .and_then(|c| c.runner_id.as_ref())
            .is_none());
        assert!(after
            .execution_context
            .as_ref()
            .and_then(|c| c.timeout_diagnostic.as_ref())
            .is_some());
    }

    #[test]
    fn reap_without_heartbeat_uses_start_time_ttl() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        let mut task = new_task(wid);
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now() - chrono::Duration::minutes(31));
        let id = task.id;
        store.insert(task);

        let reaped = store.reap_zombies(chrono::Duration::minutes(10), chrono::Duration::minutes(30));
        assert_eq!(reaped, vec![id]);
        let after = store.get(&id).unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert!(after.error.as_deref().unwrap().contains("no heartbeat, running for"));
    }

    #[test]
    fn duplicate_suggestion_matches_source_and_files() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        let mut task = new_task(wid);
        task.params = params_of(serde_json::json!({"source": "gmail", "files": ["a.txt", "b.txt"]}));
        store.insert(task);

        let query = params_of(serde_json::json!({"source": "gmail", "files": ["b.txt", "a.txt"]}));
        assert!(store
            .find_duplicate_suggestion(&wid, "pack.demo", &query, chrono::Duration::hours(1))
            .is_some());

        let different = params_of(serde_json::json!({"source": "slack", "files": ["b.txt", "a.txt"]}));
        assert!(store
            .find_duplicate_suggestion(&wid, "pack.demo", &different, chrono::Duration::hours(1))
            .is_none());
    }

    #[test]
    fn list_for_workspace_returns_all_statuses_newest_first() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        let other_wid = Uuid::new_v4();
        let mut first = new_task(wid);
        first.created_at = Utc::now() - chrono::Duration::seconds(5);
        store.insert(first.clone());
        let second = new_task(wid);
        store.insert(second.clone());
        store.insert(new_task(other_wid));

        let listed = store.list_for_workspace(&wid);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[test]
    fn evict_terminal_removes_old_tasks_only() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        let mut old = new_task(wid);
        old.status = TaskStatus::Succeeded;
        old.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
        let old_id = old.id;
        store.insert(old);

        let mut recent = new_task(wid);
        recent.status = TaskStatus::Succeeded;
        recent.completed_at = Some(Utc::now());
        let recent_id = recent.id;
        store.insert(recent);

        store.evict_terminal(chrono::Duration::hours(1));
        assert!(store.get(&old_id).is_none());
        assert!(store.get(&recent_id).is_some());
    }

    #[test]
    fn try_claim_id_claims_specific_pending_task() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        let decoy = new_task(wid);
        let decoy_id = decoy.id;
        store.insert(decoy);
        let target = new_task(wid);
        let target_id = target.id;
        store.insert(target);

        let claimed = store.try_claim_id(&target_id, "runner-1").unwrap();
        assert_eq!(claimed.id, target_id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(store.get(&decoy_id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn try_claim_id_rejects_non_pending_task() {
        let store = TaskStore::new();
        let wid = Uuid::new_v4();
        let task = new_task(wid);
        let id = task.id;
        store.insert(task);
        store.try_claim_id(&id, "runner-1").unwrap();

        assert!(store.try_claim_id(&id, "runner-2").is_none());
    }

    #[test]
    fn runner_heartbeat_table_tracks_liveness() {
        let store = TaskStore::new();
        assert!(!store.has_active_runner(chrono::Duration::seconds(60)));
        store.upsert_runner_heartbeat("runner-1");
        assert!(store.has_active_runner(chrono::Duration::seconds(60)));
        assert!(!store.has_active_runner(chrono::Duration::seconds(0)));
    }
}
