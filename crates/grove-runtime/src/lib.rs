//! Merkle forest for a zk-rollup node
//!
//! Output (UTXO) and withdrawal leaves go into append-only incremental trees
//! that roll over into new generations when full; spent notes go into a
//! sparse nullifier tree. All of it is persisted through any
//! [`KeyValueStoreLike`] backend.

// Core modules
pub mod append_tree;
pub mod config;
pub mod error;
pub mod field;
pub mod grove;
pub mod hasher;
pub mod key_utils;
pub mod nullifier_tree;
pub mod proof;
pub mod proof_cache;
pub mod repo;
pub mod traits;
pub mod transaction;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export core types and traits
pub use append_tree::AppendOnlyTree;
pub use config::{GroveConfig, GroveHashers, HashKind};
pub use error::{GroveError, GroveResult};
pub use field::Field;
pub use grove::{Grove, GroveSession};
pub use hasher::{HashFunction, Hasher, Keccak256Hash, Sha256Hash};
pub use nullifier_tree::NullifierTree;
pub use proof::MerkleProof;
pub use traits::{BatchLike, KeyValueStoreLike};
pub use transaction::{get_list, Staged, StoreTransaction};
pub use types::{
    AppendResult, GrovePatch, GroveSnapshot, HaltRecord, Item, LeafRecord, Note, NullifierRecord, TreeData,
    TreeGeneration, TreeId, TreeKind, TreeMetadata,
};
