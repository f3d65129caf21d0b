//! Sparse Merkle tree of spent nullifiers
//!
//! The tree has one leaf per possible index (`2^depth` of them). A nullifier
//! lands at the index given by its low `depth` bits; the leaf is zero while
//! unspent and [`Field::one`] once spent. Only nodes along touched paths are
//! ever stored, everything else resolves to the zero table.
//!
//! Every nullification is tagged with the block that caused it, and the block
//! keeps a list of the indices it spent, so [`NullifierTree::recover`] can
//! undo exactly one block.

use crate::error::{GroveError, GroveResult};
use crate::field::Field;
use crate::hasher::Hasher;
use crate::proof::MerkleProof;
use crate::proof_cache::ProofCache;
use crate::repo::NullifierRepo;
use crate::traits::KeyValueStoreLike;
use crate::transaction::{Staged, StoreTransaction};
use crate::types::{NullifierRecord, TreeId, TreeKind};
use log::{debug, info, warn};
use ruint::aliases::U256;

/// The nullifier tree has a single generation
pub const NULLIFIER_TREE: TreeId = TreeId {
    kind: TreeKind::Nullifier,
    generation: 0,
};

pub struct NullifierTree<'h> {
    hasher: &'h Hasher,
    cache: ProofCache,
}

impl<'h> NullifierTree<'h> {
    pub fn new(hasher: &'h Hasher) -> Self {
        Self {
            hasher,
            cache: ProofCache::new(NULLIFIER_TREE, hasher.depth()),
        }
    }

    pub fn depth(&self) -> usize {
        self.hasher.depth()
    }

    pub fn spent_marker() -> Field {
        Field::one()
    }

    pub fn index_of(&self, nullifier: &Field) -> U256 {
        nullifier.low_bits(self.depth())
    }

    /// Recomputes the path of `index` with `leaf` in place, staging every
    /// node on it, and returns the new root
    fn update_leaf<T: KeyValueStoreLike>(
        &self,
        store: &T,
        tx: &mut StoreTransaction,
        index: U256,
        leaf: Field,
    ) -> GroveResult<Field> {
        let siblings = self
            .cache
            .get_siblings(&Staged::with(store, tx), self.hasher, index)?;

        let mut nodes = Vec::with_capacity(self.depth());
        let mut position = index;
        let mut node = leaf;
        for (level, sibling) in siblings.iter().enumerate() {
            nodes.push((level, position, node));
            node = if position.bit(0) {
                self.hasher.parent_of(sibling, &node)
            } else {
                self.hasher.parent_of(&node, sibling)
            };
            position >>= 1usize;
        }
        self.cache.put_nodes(tx, nodes);
        Ok(node)
    }

    /// Marks `nullifier` spent by `block_hash`, updating `root`
    pub fn nullify<T: KeyValueStoreLike>(
        &self,
        store: &T,
        tx: &mut StoreTransaction,
        root: &mut Field,
        nullifier: &Field,
        block_hash: &Field,
    ) -> GroveResult<()> {
        let index = self.index_of(nullifier);
        if let Some(record) = NullifierRepo::get(&Staged::with(store, tx), &index)? {
            if record.nullified {
                return Err(GroveError::DoubleNullification {
                    nullifier: *nullifier,
                    spent_by: record.causing_block_hash,
                    block_hash: *block_hash,
                });
            }
        }

        *root = self.update_leaf(store, tx, index, Self::spent_marker())?;
        NullifierRepo::save(
            tx,
            &index,
            &NullifierRecord {
                index: Field::new(index),
                nullified: true,
                causing_block_hash: Some(*block_hash),
            },
        )?;
        NullifierRepo::push_block_index(store, tx, block_hash, &index)?;
        NullifierRepo::save_root(tx, root);
        debug!("Nullified {} at index 0x{:x} for block {}", nullifier, index, block_hash);
        Ok(())
    }

    pub fn is_nullified<T: KeyValueStoreLike>(
        &self,
        reader: &Staged<'_, T>,
        nullifier: &Field,
    ) -> GroveResult<bool> {
        Ok(NullifierRepo::get(reader, &self.index_of(nullifier))?
            .map(|record| record.nullified)
            .unwrap_or(false))
    }

    /// Un-spends every nullifier spent by `block_hash` and returns how many
    /// were reset
    pub fn recover<T: KeyValueStoreLike>(
        &self,
        store: &T,
        tx: &mut StoreTransaction,
        root: &mut Field,
        block_hash: &Field,
    ) -> GroveResult<usize> {
        let indices = NullifierRepo::indices_by_block(&Staged::with(store, tx), block_hash)?;
        let mut reset = 0;
        for index in indices.iter().rev() {
            let record = NullifierRepo::get(&Staged::with(store, tx), index)?;
            match record {
                Some(record) if record.nullified && record.causing_block_hash == Some(*block_hash) => {}
                _ => {
                    warn!(
                        "Index 0x{:x} listed for block {} is not spent by it, skipping",
                        index, block_hash
                    );
                    continue;
                }
            }
            *root = self.update_leaf(store, tx, *index, Field::zero())?;
            NullifierRepo::save(
                tx,
                index,
                &NullifierRecord {
                    index: Field::new(*index),
                    nullified: false,
                    causing_block_hash: None,
                },
            )?;
            reset += 1;
        }
        NullifierRepo::clear_block(store, tx, block_hash)?;
        NullifierRepo::save_root(tx, root);
        if reset > 0 {
            info!("Recovered {} nullifiers of block {}", reset, block_hash);
        }
        Ok(reset)
    }

    /// Membership proof of `nullifier`'s slot: the leaf is the spent marker
    /// when spent and zero otherwise
    pub fn merkle_proof<T: KeyValueStoreLike>(
        &self,
        reader: &Staged<'_, T>,
        root: Field,
        nullifier: &Field,
    ) -> GroveResult<MerkleProof> {
        let index = self.index_of(nullifier);
        let leaf = if self.is_nullified(reader, nullifier)? {
            Self::spent_marker()
        } else {
            Field::zero()
        };
        let proof = MerkleProof {
            root,
            leaf,
            index: Field::new(index),
            siblings: self.cache.get_siblings(reader, self.hasher, index)?,
        };
        let actual = proof.compute_root(self.hasher);
        if actual != root {
            return Err(GroveError::RootMismatch {
                tree: NULLIFIER_TREE,
                leaf_index: proof.index,
                expected: root,
                actual,
            });
        }
        Ok(proof)
    }
}
