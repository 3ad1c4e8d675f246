//! Per-execution concurrency control (§4.4 "Concurrency").
//!
//! Ensures only one `continue_playbook_execution` call runs per
//! execution at a time; two concurrent calls on the same execution_id
//! serialize, two on different executions run in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Each execution_id maps to a `Semaphore(1)`. Acquiring the permit
/// ensures exclusive access for one turn at a time.
pub struct ExecutionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for ExecutionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the run lock for an execution. Waits if another turn on
    /// the same execution is already in flight; releases on drop.
    pub async fn acquire(&self, execution_id: &str) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(execution_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        sem.acquire_owned()
            .await
            .expect("semaphore is never closed")
    }

    /// Number of tracked executions (for monitoring).
    pub fn execution_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Remove locks for executions that aren't actively held (cleanup).
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_access() {
        let map = ExecutionLockMap::new();

        let permit1 = map.acquire("e1").await;
        drop(permit1);

        let permit2 = map.acquire("e1").await;
        drop(permit2);
    }

    #[tokio::test]
    async fn different_executions_concurrent() {
        let map = Arc::new(ExecutionLockMap::new());

        let p1 = map.acquire("e1").await;
        let p2 = map.acquire("e2").await;

        assert_eq!(map.execution_count(), 2);

        drop(p1);
        drop(p2);
    }

    #[tokio::test]
    async fn same_execution_waits() {
        let map = Arc::new(ExecutionLockMap::new());
        let map2 = map.clone();

        let p1 = map.acquire("e1").await;

        let handle = tokio::spawn(async move {
            let _p2 = map2.acquire("e1").await;
            42
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        drop(p1);

        let result = handle.await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn prune_idle_drops_unheld_locks() {
        let map = ExecutionLockMap::new();
        let permit = map.acquire("e1").await;
        map.prune_idle();
        assert_eq!(map.execution_count(), 1);
        drop(permit);
        map.prune_idle();
        assert_eq!(map.execution_count(), 0);
    }
}
