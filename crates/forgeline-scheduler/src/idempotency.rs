//! Idempotency store (§4.1): maps an [`ExecutionKey`] to its terminal
//! [`StepResult`] so a retried dispatch of the same key returns the
//! cached outcome instead of re-running the step.

use std::collections::HashMap;
use std::sync::Arc;

use forgeline_core::execution::ExecutionKey;
use forgeline_core::step::StepResult;
use tokio::sync::RwLock;

/// In-process idempotency cache, keyed by the execution key's string
/// form (`pipeline_run_id:step_index:attempt`). A durable-backed
/// implementation (persisting across process restarts) would implement
/// the same shape against `forgeline-db`; this in-memory version is
/// sufficient within one orchestrator process's lifetime, matching the
/// single-process scheduling model of §5.
#[derive(Default)]
pub struct IdempotencyStore {
    results: Arc<RwLock<HashMap<String, StepResult>>>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &ExecutionKey) -> Option<StepResult> {
        self.results.read().await.get(&key.to_string()).cloned()
    }

    pub async fn record(&self, key: &ExecutionKey, result: StepResult) {
        self.results.write().await.insert(key.to_string(), result);
    }

    pub async fn is_completed(&self, key: &ExecutionKey) -> bool {
        self.get(key).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool) -> StepResult {
        StepResult {
            success,
            exit_code: if success { 0 } else { 1 },
            logs: String::new(),
            error: None,
            duration_ms: 0,
            container_id: None,
        }
    }

    #[tokio::test]
    async fn records_and_returns_cached_result() {
        let store = IdempotencyStore::new();
        let key = ExecutionKey::first(forgeline_core::ResourceId::new(), 0);
        assert!(!store.is_completed(&key).await);

        store.record(&key, result(true)).await;
        assert!(store.is_completed(&key).await);
        assert_eq!(store.get(&key).await.unwrap().success, true);
    }

    #[tokio::test]
    async fn distinct_attempts_are_distinct_keys() {
        let store = IdempotencyStore::new();
        let first = ExecutionKey::first(forgeline_core::ResourceId::new(), 0);
        let retry = first.next_attempt();

        store.record(&first, result(false)).await;
        assert!(store.is_completed(&first).await);
        assert!(!store.is_completed(&retry).await);
    }
}
