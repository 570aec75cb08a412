use std::sync::Arc;

use tracing::warn;

use conflux_core::error::{ConfluxError, Result};
use conflux_core::state::{ExecutionState, StateField};
use conflux_core::traits::ExecutionStore;
use conflux_core::types::ExecutionId;

/// Optimistic read-modify-write over the execution store.
///
/// Every mutation reloads the latest state, applies the change and saves
/// it with a version check. A version conflict (for example an external
/// stop landing in between) or a sequence collision reloads and re-applies,
/// which also renumbers any pending messages after the new tail.
#[derive(Clone)]
pub struct StateRecorder {
    store: Arc<dyn ExecutionStore>,
    retries: u32,
}

impl StateRecorder {
    pub fn new(store: Arc<dyn ExecutionStore>, retries: u32) -> Self {
        Self { store, retries }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub async fn load(&self, id: &ExecutionId) -> Result<ExecutionState> {
        self.store.load(id).await
    }

    /// Apply `change` to the latest state and persist `fields`.
    ///
    /// `change` may run more than once and may reject the update by
    /// returning an error, in which case nothing is written.
    pub async fn commit<F>(
        &self,
        id: &ExecutionId,
        fields: &[StateField],
        mut change: F,
    ) -> Result<ExecutionState>
    where
        F: FnMut(&mut ExecutionState) -> Result<()> + Send,
    {
        let mut attempt = 0;
        loop {
            let mut state = self.store.load(id).await?;
            change(&mut state)?;
            match self.store.save(&state, fields).await {
                Ok(version) => {
                    state.version = version;
                    return Ok(state);
                }
                Err(e @ (ConfluxError::StoreConflict { .. } | ConfluxError::SequenceConflict(_)))
                    if attempt < self.retries =>
                {
                    attempt += 1;
                    warn!(execution_id = %id, attempt, error = %e, "Commit conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
