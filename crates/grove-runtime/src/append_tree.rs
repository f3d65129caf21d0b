//! Append-only incremental Merkle tree
//!
//! One [`AppendOnlyTree`] handles every generation of a tree kind; the
//! generation's state ([`TreeGeneration`]) is passed in and updated in place.
//!
//! # Algorithm
//!
//! Leaves are appended as aligned subtrees of `subtree_size = 2^s` leaves.
//! The last partial subtree of an append is padded on the right with the
//! zero leaf, so `next_index` is always a multiple of the subtree size and
//! every node is well defined. For each subtree:
//!
//! 1. the bottom `s` levels are hashed from the batch alone;
//! 2. above that only the single path of the subtree root is recomputed,
//!    taking the left sibling from `rightmost_siblings` (the frontier) and
//!    the right sibling from the zero table.
//!
//! This is O(depth) hashing per subtree regardless of the tree size.
//!
//! # Proof cache coverage
//!
//! A node is written to the proof cache iff its parent's leaf range contains
//! a tracked leaf. Those are exactly the siblings future proofs of tracked
//! leaves need. In full-sync mode every leaf is tracked and every touched
//! node is cached.

use crate::error::{GroveError, GroveResult};
use crate::field::Field;
use crate::hasher::Hasher;
use crate::proof::MerkleProof;
use crate::proof_cache::ProofCache;
use crate::repo::{LeafRepo, TreeGenerationRepo};
use crate::traits::KeyValueStoreLike;
use crate::transaction::{Staged, StoreTransaction};
use crate::types::{AppendResult, Item, LeafRecord, TreeData, TreeGeneration};
use log::{debug, error};
use ruint::aliases::U256;

pub struct AppendOnlyTree<'h> {
    hasher: &'h Hasher,
    subtree_size: u64,
}

/// Whether the leaf range of the node at (`level`, `position`) contains a
/// tracked leaf, given the last tracked leaf before the current batch and
/// the tracked leaves of the batch
fn range_has_tracked(level: usize, position: u64, prior: Option<u64>, batch: &[u64]) -> bool {
    let lo = position << level;
    let hi = lo + (1u64 << level);
    let inside = |t: &u64| *t >= lo && *t < hi;
    prior.as_ref().is_some_and(inside) || batch.iter().any(inside)
}

impl<'h> AppendOnlyTree<'h> {
    /// `subtree_size` must be a power of two no larger than the tree
    pub fn new(hasher: &'h Hasher, subtree_size: u64) -> Self {
        debug_assert!(subtree_size.is_power_of_two());
        Self {
            hasher,
            subtree_size,
        }
    }

    pub fn depth(&self) -> usize {
        self.hasher.depth()
    }

    pub fn capacity(&self) -> u64 {
        1u64 << self.depth()
    }

    pub fn subtree_size(&self) -> u64 {
        self.subtree_size
    }

    pub fn hasher(&self) -> &Hasher {
        self.hasher
    }

    /// Leaves consumed by appending `count` items, padding included
    pub fn padded_len(&self, count: usize) -> u64 {
        (count as u64).div_ceil(self.subtree_size) * self.subtree_size
    }

    pub fn can_append(&self, generation: &TreeGeneration, count: usize) -> bool {
        generation.data.next_index + self.padded_len(count) <= self.capacity()
    }

    /// Computes the result of appending `items` without persisting anything
    pub fn dry_append(
        &self,
        generation: &TreeGeneration,
        items: &[Item],
        tracked: &[bool],
    ) -> GroveResult<AppendResult> {
        let mut scratch = generation.clone();
        let mut tx = StoreTransaction::new();
        self.append(&mut tx, &mut scratch, items, tracked)
    }

    /// Appends `items`, staging the new tree data, cached nodes and leaf
    /// records of tracked items into `tx`. `tracked[i]` tells whether
    /// `items[i]` belongs to an observed owner.
    pub fn append(
        &self,
        tx: &mut StoreTransaction,
        generation: &mut TreeGeneration,
        items: &[Item],
        tracked: &[bool],
    ) -> GroveResult<AppendResult> {
        let id = generation.id();
        if items.is_empty() {
            return Ok(AppendResult {
                tree: id,
                root: generation.data.root,
                index: generation.data.next_index,
                siblings: generation.data.rightmost_siblings.clone(),
            });
        }
        if tracked.len() != items.len() {
            return Err(GroveError::Config(format!(
                "{} items but {} tracking flags",
                items.len(),
                tracked.len()
            )));
        }

        let start = generation.data.next_index;
        let padded = self.padded_len(items.len());
        if start + padded > self.capacity() {
            return Err(GroveError::CapacityExceeded {
                tree: id,
                next_index: start,
                requested: padded,
                capacity: self.capacity(),
            });
        }

        let depth = self.depth();
        let batch_levels = self.subtree_size.trailing_zeros() as usize;
        let mut frontier = generation.data.rightmost_siblings.clone();
        let mut last_tracked = generation.data.last_tracked_index;
        let mut root = generation.data.root;
        let mut nodes: Vec<(usize, U256, Field)> = Vec::new();

        for (chunk_no, chunk) in items.chunks(self.subtree_size as usize).enumerate() {
            let offset = chunk_no * self.subtree_size as usize;
            let base = start + offset as u64;
            let batch_tracked: Vec<u64> = tracked[offset..offset + chunk.len()]
                .iter()
                .enumerate()
                .filter(|(_, t)| **t)
                .map(|(i, _)| base + i as u64)
                .collect();

            let mut level_nodes: Vec<Field> = chunk.iter().map(|item| item.leaf_hash).collect();
            level_nodes.resize(self.subtree_size as usize, self.hasher.pre_hash(0));

            // bottom levels, built from the batch alone
            let mut position = base;
            for level in 0..batch_levels {
                let mut parents = Vec::with_capacity(level_nodes.len() / 2);
                for (pair_no, pair) in level_nodes.chunks(2).enumerate() {
                    let parent_position = (position >> 1) + pair_no as u64;
                    if range_has_tracked(level + 1, parent_position, last_tracked, &batch_tracked) {
                        nodes.push((level, U256::from(parent_position * 2), pair[0]));
                        nodes.push((level, U256::from(parent_position * 2 + 1), pair[1]));
                    }
                    parents.push(self.hasher.parent_of(&pair[0], &pair[1]));
                }
                level_nodes = parents;
                position >>= 1;
            }

            // single path from the subtree root to the tree root
            let mut node = level_nodes[0];
            for level in batch_levels..depth {
                let parent_position = position >> 1;
                let cache_children =
                    range_has_tracked(level + 1, parent_position, last_tracked, &batch_tracked);
                node = if position & 1 == 0 {
                    frontier[level] = node;
                    if cache_children {
                        nodes.push((level, U256::from(position), node));
                    }
                    self.hasher.parent_of(&node, &self.hasher.pre_hash(level))
                } else {
                    if cache_children {
                        nodes.push((level, U256::from(position - 1), frontier[level]));
                        nodes.push((level, U256::from(position), node));
                    }
                    self.hasher.parent_of(&frontier[level], &node)
                };
                position = parent_position;
            }
            root = node;

            if let Some(last) = batch_tracked.last() {
                last_tracked = Some(*last);
            }
        }

        let next_index = start + padded;
        for (level, sibling) in frontier.iter_mut().enumerate() {
            if (next_index >> level) & 1 == 0 {
                *sibling = self.hasher.pre_hash(level);
            }
        }

        debug!(
            "Appended {} items ({} padded) to tree {}: next index {}, {} cached nodes",
            items.len(),
            padded,
            id,
            next_index,
            nodes.len()
        );

        generation.data = TreeData {
            root,
            next_index,
            rightmost_siblings: frontier,
            last_tracked_index: last_tracked,
        };
        generation.metadata.end = generation.metadata.start + next_index;

        ProofCache::new(id, depth).put_nodes(tx, nodes);
        for (i, item) in items.iter().enumerate() {
            if tracked[i] {
                LeafRepo::save(
                    tx,
                    &LeafRecord {
                        hash: item.leaf_hash,
                        tree: id,
                        index: start + i as u64,
                        note: item.note.clone(),
                    },
                )?;
            }
        }
        TreeGenerationRepo::save(tx, generation)?;

        Ok(AppendResult {
            tree: id,
            root,
            index: next_index,
            siblings: generation.data.rightmost_siblings.clone(),
        })
    }

    /// Proof for the tracked leaf `leaf_hash` of `generation`
    pub fn merkle_proof<T: KeyValueStoreLike>(
        &self,
        reader: &Staged<'_, T>,
        generation: &TreeGeneration,
        leaf_hash: Field,
    ) -> GroveResult<MerkleProof> {
        let record = LeafRepo::get(reader, generation.id().kind, &leaf_hash)?
            .filter(|record| record.tree == generation.id())
            .ok_or(GroveError::LeafNotFound { leaf: leaf_hash })?;
        self.merkle_proof_at(reader, generation, record.index, leaf_hash)
    }

    /// Proof for `leaf` at local `index`, checked against the stored root
    pub fn merkle_proof_at<T: KeyValueStoreLike>(
        &self,
        reader: &Staged<'_, T>,
        generation: &TreeGeneration,
        index: u64,
        leaf: Field,
    ) -> GroveResult<MerkleProof> {
        let id = generation.id();
        if index >= generation.data.next_index {
            return Err(GroveError::LeafNotFound { leaf });
        }
        let siblings = ProofCache::new(id, self.depth()).get_siblings(reader, self.hasher, U256::from(index))?;
        let proof = MerkleProof {
            root: generation.data.root,
            leaf,
            index: Field::from_u64(index),
            siblings,
        };
        let actual = proof.compute_root(self.hasher);
        if actual != proof.root {
            error!(
                "Proof for leaf {} at index {} of tree {} recombines to {} instead of {}",
                leaf, index, id, actual, proof.root
            );
            return Err(GroveError::RootMismatch {
                tree: id,
                leaf_index: proof.index,
                expected: proof.root,
                actual,
            });
        }
        Ok(proof)
    }
}
