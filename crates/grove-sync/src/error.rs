//! Error types for grove-sync

use crate::types::BlockStatus;
use grove_runtime::{Field, GroveError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Grove error: {0}")]
    Grove(#[from] GroveError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Block decode error: {0}")]
    Decode(String),

    #[error("proposal {got} arrived out of order, expected {expected}")]
    OutOfOrderBlock { expected: u64, got: u64 },

    #[error("block {block} finalized while its parent {parent} is {parent_status:?}")]
    FinalizedAfterInvalidParent {
        block: Field,
        parent: Field,
        parent_status: BlockStatus,
    },

    #[error("verified block {block} no longer reproduces its header roots on commit")]
    DivergedFromHeader { block: Field },

    #[error("unknown block {0}")]
    UnknownBlock(Field),

    #[error("block {block} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        block: Field,
        from: BlockStatus,
        to: BlockStatus,
    },

    #[error("event channel closed")]
    ChannelClosed,

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl SyncError {
    /// Errors after which the engine must stop instead of skipping the event
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Grove(err) => err.is_fatal() || matches!(err, GroveError::RootMismatch { .. }),
            SyncError::Storage(_)
            | SyncError::OutOfOrderBlock { .. }
            | SyncError::FinalizedAfterInvalidParent { .. }
            | SyncError::DivergedFromHeader { .. } => true,
            _ => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
