//! Message audit log.
//!
//! Sequence numbers are assigned only when messages are applied to a
//! freshly loaded state, continuing after the highest persisted sequence.
//! A batch is numbered in the order it is given, so a concurrent
//! generation applied in execution-order position is numbered the same way
//! on every replay.

use conflux_core::state::ExecutionState;
use conflux_core::types::MessageDraft;

/// Append `drafts` to the audit log. Returns the assigned sequences.
pub fn append(state: &mut ExecutionState, drafts: Vec<MessageDraft>) -> Vec<u64> {
    let mut next = state.last_sequence();
    let mut assigned = Vec::with_capacity(drafts.len());
    for draft in drafts {
        next += 1;
        state.messages.push(draft.into_message(next));
        assigned.push(next);
    }
    assigned
}

/// Whether the log holds unique, strictly increasing sequences.
pub fn is_well_ordered(state: &ExecutionState) -> bool {
    state
        .messages
        .windows(2)
        .all(|w| w[0].sequence < w[1].sequence)
}
