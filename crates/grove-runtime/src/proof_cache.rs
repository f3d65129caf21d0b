//! Persisted internal nodes of one tree generation
//!
//! Nodes are addressed by their 1-prefixed path index (root = 1, children of
//! `i` are `2i` and `2i + 1`). A node that was never written is the root of
//! an untouched subtree and resolves to the hasher's `pre_hash[level]`. The
//! cache is append-only: nothing prunes it, so proofs for old leaves stay
//! answerable forever.

use crate::error::GroveResult;
use crate::field::Field;
use crate::hasher::Hasher;
use crate::key_utils::node_index;
use crate::repo::CachedNodeRepo;
use crate::traits::KeyValueStoreLike;
use crate::transaction::{Staged, StoreTransaction};
use crate::types::TreeId;
use ruint::aliases::U256;

#[derive(Debug, Clone, Copy)]
pub struct ProofCache {
    tree: TreeId,
    depth: usize,
}

impl ProofCache {
    pub fn new(tree: TreeId, depth: usize) -> Self {
        Self { tree, depth }
    }

    pub fn tree(&self) -> TreeId {
        self.tree
    }

    /// Node index of the sibling at every level of the path of `leaf_index`,
    /// leaf level first
    pub fn sibling_indices(&self, leaf_index: U256) -> Vec<U256> {
        let one = U256::from(1u64);
        let mut path_index = node_index(self.depth, 0, leaf_index);
        let mut siblings = Vec::with_capacity(self.depth);
        for _ in 0..self.depth {
            siblings.push(path_index ^ one);
            path_index >>= 1usize;
        }
        siblings
    }

    /// Sibling values for the path of `leaf_index`
    pub fn get_siblings<T: KeyValueStoreLike>(
        &self,
        reader: &Staged<'_, T>,
        hasher: &Hasher,
        leaf_index: U256,
    ) -> GroveResult<Vec<Field>> {
        self.sibling_indices(leaf_index)
            .iter()
            .enumerate()
            .map(|(level, index)| {
                Ok(CachedNodeRepo::get(reader, &self.tree, index)?
                    .unwrap_or_else(|| hasher.pre_hash(level)))
            })
            .collect()
    }

    /// Value of the node at `level` and `position`
    pub fn get_node<T: KeyValueStoreLike>(
        &self,
        reader: &Staged<'_, T>,
        hasher: &Hasher,
        level: usize,
        position: U256,
    ) -> GroveResult<Field> {
        let index = node_index(self.depth, level, position);
        Ok(CachedNodeRepo::get(reader, &self.tree, &index)?.unwrap_or_else(|| hasher.pre_hash(level)))
    }

    /// Stages `(level, position, value)` nodes
    pub fn put_nodes<I>(&self, tx: &mut StoreTransaction, nodes: I)
    where
        I: IntoIterator<Item = (usize, U256, Field)>,
    {
        for (level, position, value) in nodes {
            CachedNodeRepo::put(tx, &self.tree, &node_index(self.depth, level, position), &value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TreeKind;

    #[test]
    fn test_sibling_indices_flip_lowest_bit() {
        let cache = ProofCache::new(TreeId::new(TreeKind::Utxo, 0), 3);
        // leaf 2 has path index 8 + 2 = 10 -> 5 -> 2 -> 1
        let siblings: Vec<u64> = cache
            .sibling_indices(U256::from(2u64))
            .into_iter()
            .map(|i| u64::try_from(i).unwrap())
            .collect();
        assert_eq!(siblings, vec![11, 4, 3]);
    }
}
