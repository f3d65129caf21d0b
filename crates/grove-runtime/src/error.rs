//! Error types for the Merkle forest

use crate::field::Field;
use crate::types::TreeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroveError {
    #[error("grove used before init() completed")]
    NotInitialized,

    #[error("tree {tree} cannot take {requested} more leaves at index {next_index} (capacity {capacity})")]
    CapacityExceeded {
        tree: TreeId,
        next_index: u64,
        requested: u64,
        capacity: u64,
    },

    #[error("leaf {leaf} not found")]
    LeafNotFound { leaf: Field },

    #[error("root mismatch on tree {tree} at leaf index {leaf_index}: expected {expected}, computed {actual}")]
    RootMismatch {
        tree: TreeId,
        leaf_index: Field,
        expected: Field,
        actual: Field,
    },

    #[error("nullifier {nullifier} already spent (by block {spent_by:?}), rejected for block {block_hash}")]
    DoubleNullification {
        nullifier: Field,
        spent_by: Option<Field>,
        block_hash: Field,
    },

    #[error("writes to tree {tree} are halted after a consistency failure")]
    WritesHalted { tree: TreeId },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GroveError {
    /// Errors that indicate a driver bug or storage corruption rather than a
    /// bad block. `RootMismatch` is classified by the caller: it is
    /// recoverable during block validation and fatal on committed data.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GroveError::NotInitialized | GroveError::WritesHalted { .. } | GroveError::Storage(_)
        )
    }

    pub(crate) fn storage<E: std::fmt::Debug>(err: E) -> Self {
        GroveError::Storage(format!("{:?}", err))
    }
}

impl From<serde_json::Error> for GroveError {
    fn from(err: serde_json::Error) -> Self {
        GroveError::Serialization(err.to_string())
    }
}

pub type GroveResult<T> = Result<T, GroveError>;
