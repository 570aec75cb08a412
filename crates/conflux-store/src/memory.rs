use std::collections::HashMap;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use conflux_core::error::{ConfluxError, Result};
use conflux_core::state::{ExecutionState, StateField};
use conflux_core::traits::ExecutionStore;
use conflux_core::types::ExecutionId;

/// Process-local execution store. Same contract as the SQLite store,
/// including version checks, without durability.
#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: Mutex<HashMap<String, ExecutionState>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.executions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.lock().await.is_empty()
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn insert(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>> {
        let state = state.clone();
        Box::pin(async move {
            let mut executions = self.executions.lock().await;
            if executions.contains_key(&state.id.0) {
                return Err(ConfluxError::Database(format!(
                    "execution {} already exists",
                    state.id
                )));
            }
            executions.insert(state.id.0.clone(), state);
            Ok(())
        })
    }

    fn load(&self, id: &ExecutionId) -> BoxFuture<'_, Result<ExecutionState>> {
        let id = id.clone();
        Box::pin(async move {
            self.executions
                .lock()
                .await
                .get(&id.0)
                .cloned()
                .ok_or(ConfluxError::ExecutionNotFound(id.0))
        })
    }

    fn save(&self, state: &ExecutionState, fields: &[StateField]) -> BoxFuture<'_, Result<u64>> {
        let state = state.clone();
        let fields = fields.to_vec();
        Box::pin(async move {
            let mut executions = self.executions.lock().await;
            let stored = executions
                .get_mut(&state.id.0)
                .ok_or_else(|| ConfluxError::ExecutionNotFound(state.id.0.clone()))?;

            if stored.version != state.version {
                return Err(ConfluxError::StoreConflict {
                    execution: state.id.0.clone(),
                    expected: state.version,
                    found: stored.version,
                });
            }

            for field in fields {
                match field {
                    StateField::Status => stored.status = state.status,
                    StateField::ConversationHistory => {
                        stored.conversation_history = state.conversation_history.clone()
                    }
                    StateField::ExecutedNodes => stored.executed_nodes = state.executed_nodes.clone(),
                    StateField::Messages => {
                        let tail = stored.last_sequence();
                        for msg in state.messages.iter().filter(|m| m.sequence > tail) {
                            stored.messages.push(msg.clone());
                        }
                    }
                    StateField::HumanInputContext => {
                        stored.human_input_context = state.human_input_context.clone()
                    }
                    StateField::Error => stored.error = state.error.clone(),
                }
            }

            stored.version += 1;
            stored.updated_at = Utc::now();
            Ok(stored.version)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::graph::{Graph, Node};
    use conflux_core::types::ExecutionStatus;

    #[tokio::test]
    async fn test_version_guard() {
        let store = MemoryExecutionStore::new();
        let mut state = ExecutionState::new(Graph::new(vec![Node::start("s")], vec![]), "hi");
        store.insert(&state).await.unwrap();
        assert_eq!(store.len().await, 1);

        state.status = ExecutionStatus::Completed;
        state.version = store.save(&state, &[StateField::Status]).await.unwrap();
        assert_eq!(state.version, 1);

        let mut stale = state.clone();
        stale.version = 0;
        assert!(matches!(
            store.save(&stale, &[StateField::Status]).await,
            Err(ConfluxError::StoreConflict { .. })
        ));

        let loaded = store.load(&state.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let store = MemoryExecutionStore::new();
        let state = ExecutionState::new(Graph::default(), "");
        store.insert(&state).await.unwrap();
        assert!(store.insert(&state).await.is_err());
    }
}
