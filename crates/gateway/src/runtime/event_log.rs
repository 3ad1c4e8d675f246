//! The Event Log (§3.3): an append-only, strictly-ordered record of
//! everything that happens in a thread — messages, playbook steps,
//! execution chat turns, tool calls, agent executions.
//!
//! A bounded in-memory ring backed by a `HashMap` index over a logical
//! sequence number, persisted to a JSONL file, with a `base_seq` offset so
//! popping the front of the ring never needs to renumber anything still
//! held in the index.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use sa_domain::model::{event_order_key, Event, EventType};
use serde_json::Value;
use uuid::Uuid;

const MAX_EVENTS_IN_MEMORY: usize = 20_000;

pub struct EventLog {
    inner: RwLock<EventLogInner>,
    log_path: PathBuf,
}

struct EventLogInner {
    events: VecDeque<Event>,
    index: HashMap<Uuid, usize>,
    base_seq: usize,
}

impl EventLogInner {
    fn new(events: VecDeque<Event>) -> Self {
        let mut index = HashMap::with_capacity(events.len());
        for (i, e) in events.iter().enumerate() {
            index.insert(e.id, i);
        }
        Self {
            events,
            index,
            base_seq: 0,
        }
    }

    fn deque_idx(&self, seq: usize) -> usize {
        seq - self.base_seq
    }

    fn push_back(&mut self, event: Event) {
        let seq = self.base_seq + self.events.len();
        self.index.insert(event.id, seq);
        self.events.push_back(event);
    }

    fn pop_front(&mut self) -> Option<Event> {
        let e = self.events.pop_front()?;
        self.index.remove(&e.id);
        self.base_seq += 1;
        Some(e)
    }
}

impl EventLog {
    pub fn new(state_path: &Path) -> Self {
        let dir = state_path.join("events");
        std::fs::create_dir_all(&dir).ok();
        let log_path = dir.join("events.jsonl");
        let (events, total_on_disk) = Self::load_recent(&log_path);

        if total_on_disk > events.len() {
            tracing::info!(
                kept = events.len(),
                pruned = total_on_disk - events.len(),
                "pruning events JSONL on disk"
            );
            Self::rewrite_jsonl(&log_path, &events);
        }

        Self {
            inner: RwLock::new(EventLogInner::new(events)),
            log_path,
        }
    }

    fn load_recent(path: &Path) -> (VecDeque<Event>, usize) {
        let mut events = VecDeque::new();
        let mut total = 0;
        if let Ok(content) = std::fs::read_to_string(path) {
            let lines: Vec<&str> = content.lines().collect();
            total = lines.len();
            for line in lines.iter().rev().take(MAX_EVENTS_IN_MEMORY) {
                if let Ok(e) = serde_json::from_str::<Event>(line) {
                    events.push_front(e);
                }
            }
        }
        let mut v: Vec<Event> = events.into_iter().collect();
        v.sort_by_key(event_order_key);
        (v.into_iter().collect(), total)
    }

    fn rewrite_jsonl(path: &Path, events: &VecDeque<Event>) {
        let tmp = path.with_extension("jsonl.tmp");
        let mut ok = false;
        if let Ok(mut f) = std::fs::File::create(&tmp) {
            ok = true;
            for e in events {
                if let Ok(json) = serde_json::to_string(e) {
                    if writeln!(f, "{json}").is_err() {
                        ok = false;
                        break;
                    }
                }
            }
        }
        if ok {
            let _ = std::fs::rename(&tmp, path);
        } else {
            let _ = std::fs::remove_file(&tmp);
        }
    }

    /// Append an event, persist it, and return its id.
    pub fn append(&self, event: Event) -> Uuid {
        let id = event.id;
        if let Ok(json) = serde_json::to_string(&event) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
            {
                let _ = writeln!(file, "{json}");
            }
        }
        let mut inner = self.inner.write();
        inner.push_back(event);
        if inner.events.len() > MAX_EVENTS_IN_MEMORY {
            inner.pop_front();
        }
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Event> {
        let inner = self.inner.read();
        let seq = *inner.index.get(id)?;
        let idx = inner.deque_idx(seq);
        inner.events.get(idx).cloned()
    }

    /// Events for `thread_id` strictly after the given watermark
    /// (exclusive, per `event_order_key` ordering), oldest first, capped at
    /// `limit`. Returns the events plus the new watermark to pass on the
    /// next poll (§4.7 "per-stream watermarks for ordered event delivery").
    pub fn list_since(
        &self,
        thread_id: &Uuid,
        watermark: Option<(chrono::DateTime<chrono::Utc>, Uuid)>,
        limit: usize,
    ) -> (Vec<Event>, Option<(chrono::DateTime<chrono::Utc>, Uuid)>) {
        let inner = self.inner.read();
        let mut matching: Vec<&Event> = inner
            .events
            .iter()
            .filter(|e| e.thread_id.as_ref() == Some(thread_id))
            .filter(|e| match watermark {
                Some(wm) => event_order_key(e) > wm,
                None => true,
            })
            .collect();
        matching.sort_by_key(|e| event_order_key(e));
        matching.truncate(limit);

        let new_watermark = matching.last().map(|e| event_order_key(e));
        (matching.into_iter().cloned().collect(), new_watermark)
    }

    /// Back-fill `total_steps` onto every `PlaybookStep` event that
    /// cross-references `execution_id`, and mark each `completed` if it
    /// isn't already (§4.4 step 6). `total_steps` grows across turns as a
    /// conversational playbook runs longer than first estimated, so
    /// earlier step events need patching once the final count is known —
    /// Testable invariant 4 requires every step event of a terminal
    /// execution to agree on `total_steps`, which an append-only log can't
    /// satisfy on its own. Rewrites the on-disk JSONL when anything
    /// actually changed.
    pub fn backfill_step_events(&self, execution_id: &Uuid, total_steps: i64) {
        let mut inner = self.inner.write();
        let mut changed = false;
        for event in inner.events.iter_mut() {
            if event.event_type != EventType::PlaybookStep || !event.entity_ids.contains(execution_id) {
                continue;
            }
            if event.payload.get("total_steps").and_then(Value::as_i64) != Some(total_steps) {
                event.payload.insert("total_steps".to_string(), Value::from(total_steps));
                changed = true;
            }
            if event.payload.get("status").and_then(Value::as_str) != Some("completed") {
                event.payload.insert("status".to_string(), Value::String("completed".to_string()));
                changed = true;
            }
        }
        if changed {
            Self::rewrite_jsonl(&self.log_path, &inner.events);
        }
    }

    /// All events cross-referencing `entity_id` (e.g. all events for one
    /// execution), ordered.
    pub fn list_for_entity(&self, entity_id: &Uuid) -> Vec<Event> {
        let inner = self.inner.read();
        let mut v: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.entity_ids.contains(entity_id))
            .cloned()
            .collect();
        v.sort_by_key(|e| event_order_key(e));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::model::{Actor, EventType};
    use std::collections::HashMap as Map;

    fn make_event(thread_id: Uuid) -> Event {
        let mut e = Event::new(Uuid::new_v4(), Actor::User, EventType::Message, Map::new());
        e.thread_id = Some(thread_id);
        e
    }

    #[test]
    fn append_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        let e = make_event(Uuid::new_v4());
        let id = e.id;
        log.append(e);
        assert!(log.get(&id).is_some());
    }

    #[test]
    fn list_since_respects_watermark_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        let thread_id = Uuid::new_v4();

        let mut e1 = make_event(thread_id);
        e1.timestamp = chrono::Utc::now();
        log.append(e1.clone());

        let mut e2 = make_event(thread_id);
        e2.timestamp = e1.timestamp + chrono::Duration::seconds(1);
        log.append(e2.clone());

        let (events, wm) = log.list_since(&thread_id, None, 10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, e1.id);
        assert_eq!(events[1].id, e2.id);
        assert_eq!(wm, Some(event_order_key(&e2)));

        let (after, _) = log.list_since(&thread_id, Some(event_order_key(&e1)), 10);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, e2.id);
    }

    #[test]
    fn list_since_ignores_other_threads() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        let thread_a = Uuid::new_v4();
        let thread_b = Uuid::new_v4();

        log.append(make_event(thread_a));
        log.append(make_event(thread_b));

        let (events, _) = log.list_since(&thread_a, None, 10);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        let e = make_event(Uuid::new_v4());
        let id = e.id;
        log.append(e);

        let log2 = EventLog::new(dir.path());
        assert!(log2.get(&id).is_some());
    }

    #[test]
    fn backfill_step_events_patches_prior_total_steps() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        let execution_id = Uuid::new_v4();

        let mut payload = Map::new();
        payload.insert("total_steps".to_string(), serde_json::json!(1));
        payload.insert("status".to_string(), serde_json::json!("completed"));
        let mut e1 = Event::new(Uuid::new_v4(), Actor::Assistant, EventType::PlaybookStep, payload);
        e1.entity_ids.push(execution_id);
        let id1 = e1.id;
        log.append(e1);

        log.backfill_step_events(&execution_id, 3);

        let after = log.get(&id1).unwrap();
        assert_eq!(after.payload.get("total_steps"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn list_for_entity_filters_by_cross_reference() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        let execution_id = Uuid::new_v4();

        let mut e1 = make_event(Uuid::new_v4());
        e1.entity_ids.push(execution_id);
        log.append(e1.clone());

        log.append(make_event(Uuid::new_v4()));

        let hits = log.list_for_entity(&execution_id);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, e1.id);
    }
}
