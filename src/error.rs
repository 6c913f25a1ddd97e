use thiserror::Error;

use crate::marked_block::BlockState;

/// Misuse of the block, handle or heap APIs. None of these are recoverable
/// by the collector itself; they are reported to the embedder instead of
/// being left undefined.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("`{operation}` is not allowed on a block in state {state:?}")]
    InvalidBlockState {
        operation: &'static str,
        state: BlockState,
    },
    #[error("super region address space is exhausted")]
    SuperRegionExhausted,
    #[error("failed to map memory: {0}")]
    MapFailed(#[from] std::io::Error),
    #[error("handle or weak slot was already deallocated")]
    StaleHandle,
    #[error("handles must not be written while finalizers run")]
    HandleWriteDuringFinalization,
    #[error("heap re-entered from a finalizer")]
    FinalizerReentrancy,
    #[error("cannot start {requested:?} while {current:?} is in progress")]
    OperationInProgress {
        requested: crate::heap::HeapOperation,
        current: crate::heap::HeapOperation,
    },
}

pub type HeapResult<T> = Result<T, HeapError>;
