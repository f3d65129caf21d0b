//! Key construction for every record the forest persists
//!
//! Keys are plain byte strings with `:` separated components. Field values and
//! node indices are written as fixed-width lowercase hex so that prefix scans
//! return them in numeric order.

use crate::field::Field;
use crate::types::{TreeId, TreeKind};
use ruint::aliases::U256;

pub const TREE_PREFIX: &str = "grove:tree:";
pub const GENERATIONS_PREFIX: &str = "grove:generations:";
pub const NODE_PREFIX: &str = "grove:node:";
pub const LEAF_PREFIX: &str = "grove:leaf:";
pub const NULLIFIER_ROOT_KEY: &str = "grove:nullifier:root";
pub const NULLIFIER_RECORD_PREFIX: &str = "grove:nullifier:rec:";
pub const NULLIFIED_BY_PREFIX: &str = "grove:nullified-by:";
pub const HALTED_PREFIX: &str = "grove:halted:";

/// Suffix of the counter key of an append-only list
pub const LENGTH_SUFFIX: &[u8] = b"/length";

#[inline]
fn uint_hex(value: &U256) -> String {
    hex::encode(value.to_be_bytes::<32>())
}

pub fn tree_metadata_key(id: &TreeId) -> Vec<u8> {
    format!("{}{}:{}:meta", TREE_PREFIX, id.kind, id.generation).into_bytes()
}

pub fn tree_data_key(id: &TreeId) -> Vec<u8> {
    format!("{}{}:{}:data", TREE_PREFIX, id.kind, id.generation).into_bytes()
}

/// Base key of the list of generation indices of one tree kind
pub fn generations_list_key(kind: TreeKind) -> Vec<u8> {
    format!("{}{}", GENERATIONS_PREFIX, kind).into_bytes()
}

pub fn node_prefix(id: &TreeId) -> Vec<u8> {
    format!("{}{}:{}:", NODE_PREFIX, id.kind, id.generation).into_bytes()
}

pub fn node_key(id: &TreeId, node_index: &U256) -> Vec<u8> {
    let mut key = node_prefix(id);
    key.extend_from_slice(uint_hex(node_index).as_bytes());
    key
}

pub fn leaf_key(kind: TreeKind, leaf_hash: &Field) -> Vec<u8> {
    format!("{}{}:{}", LEAF_PREFIX, kind, hex::encode(leaf_hash.to_be_bytes())).into_bytes()
}

pub fn nullifier_record_key(index: &U256) -> Vec<u8> {
    format!("{}{}", NULLIFIER_RECORD_PREFIX, uint_hex(index)).into_bytes()
}

pub fn halted_key(id: &TreeId) -> Vec<u8> {
    format!("{}{}:{}", HALTED_PREFIX, id.kind, id.generation).into_bytes()
}

pub fn nullified_by_key(block_hash: &Field) -> Vec<u8> {
    format!("{}{}", NULLIFIED_BY_PREFIX, hex::encode(block_hash.to_be_bytes())).into_bytes()
}

/// `base/length`
pub fn list_length_key(base: &[u8]) -> Vec<u8> {
    [base, LENGTH_SUFFIX].concat()
}

/// `base/{i}`
pub fn list_item_key(base: &[u8], index: u64) -> Vec<u8> {
    [base, b"/".as_slice(), index.to_string().as_bytes()].concat()
}

/// Index of the node at `level` (0 = leaves) and horizontal `position`
/// in a tree of `depth` levels, using the 1-prefixed path numbering
#[inline]
pub fn node_index(depth: usize, level: usize, position: U256) -> U256 {
    (U256::from(1u64) << (depth - level)) + position
}
