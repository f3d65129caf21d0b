//! Merkle inclusion proofs
//!
//! The proof shape is shared by the proving pipeline and by layer-1 withdrawal
//! verification. `siblings[level]` is the sibling of the path node at
//! `level`; bit `level` of `index` tells on which side the path node sits
//! (0 = left child, 1 = right child).

use crate::field::Field;
use crate::hasher::Hasher;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub root: Field,
    pub leaf: Field,
    pub index: Field,
    pub siblings: Vec<Field>,
}

impl MerkleProof {
    /// Folds the leaf with its siblings up to a root
    pub fn compute_root(&self, hasher: &Hasher) -> Field {
        let mut node = self.leaf;
        for (level, sibling) in self.siblings.iter().enumerate() {
            node = if self.index.bit(level) {
                hasher.parent_of(sibling, &node)
            } else {
                hasher.parent_of(&node, sibling)
            };
        }
        node
    }

    /// True when the proof has one sibling per level and recombines to `root`
    pub fn verify(&self, hasher: &Hasher) -> bool {
        self.siblings.len() == hasher.depth() && self.compute_root(hasher) == self.root
    }
}
