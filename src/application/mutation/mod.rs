//! Writes: optimistic application, delayed commit and rollback.

mod change;
mod ledger;
mod pipeline;
mod types;
mod undo;

pub use change::CacheChange;
pub use ledger::OptimisticLedger;
pub use pipeline::MutationPipeline;
pub use types::{MutationId, MutationMode, MutationOptions, MutationOutcome, MutationRequest};
pub use undo::{
    PendingUndo, StagedMutation, UndoHandle, UndoQueue, UndoScope, UndoSlot, UnknownUndoScope,
};

pub(crate) use ledger::METRIC_MUTATION_ROLLBACK;
pub(crate) use undo::METRIC_UNDO_CANCELLED;
