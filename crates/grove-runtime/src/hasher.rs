//! Two-to-one hashers and their precomputed zero subtrees
//!
//! A [`Hasher`] pairs a [`HashFunction`] with a tree depth. On construction it
//! derives `pre_hash[level]`, the root of an all-zero subtree of height
//! `level`, for every level up to and including the tree root. Trees rely on
//! these values wherever a node has never been written.
//!
//! Domain separation is the function's own: the layer-1 verifier recomputes
//! `hash_pair(left, right)` over the 32-byte big-endian encodings of the two
//! children and reduces the digest into the field, exactly as done here.

use crate::field::Field;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tiny_keccak::{Hasher as _, Keccak};

/// Compression function over two field elements
pub trait HashFunction: Send + Sync {
    fn hash_pair(&self, left: &Field, right: &Field) -> Field;

    fn name(&self) -> &'static str;
}

/// SHA-256 over `left || right`, reduced into the field
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hash;

impl HashFunction for Sha256Hash {
    fn hash_pair(&self, left: &Field, right: &Field) -> Field {
        let mut hasher = Sha256::new();
        hasher.update(left.to_be_bytes());
        hasher.update(right.to_be_bytes());
        let mut output = [0u8; 32];
        output.copy_from_slice(&hasher.finalize());
        Field::from_be_bytes_reduced(output)
    }

    fn name(&self) -> &'static str {
        "sha256"
    }
}

/// Keccak-256 over `left || right`, reduced into the field
#[derive(Debug, Clone, Copy, Default)]
pub struct Keccak256Hash;

impl HashFunction for Keccak256Hash {
    fn hash_pair(&self, left: &Field, right: &Field) -> Field {
        let mut hasher = Keccak::v256();
        hasher.update(&left.to_be_bytes());
        hasher.update(&right.to_be_bytes());
        let mut output = [0u8; 32];
        hasher.finalize(&mut output);
        Field::from_be_bytes_reduced(output)
    }

    fn name(&self) -> &'static str {
        "keccak256"
    }
}

/// A hash function bound to a tree depth with its zero-subtree table
#[derive(Clone)]
pub struct Hasher {
    function: Arc<dyn HashFunction>,
    depth: usize,
    pre_hash: Vec<Field>,
}

impl Hasher {
    pub fn new(function: Arc<dyn HashFunction>, depth: usize) -> Self {
        let mut pre_hash = Vec::with_capacity(depth + 1);
        let mut node = Field::zero();
        pre_hash.push(node);
        for _ in 0..depth {
            node = function.hash_pair(&node, &node);
            pre_hash.push(node);
        }
        Self {
            function,
            depth,
            pre_hash,
        }
    }

    pub fn sha256(depth: usize) -> Self {
        Self::new(Arc::new(Sha256Hash), depth)
    }

    pub fn keccak256(depth: usize) -> Self {
        Self::new(Arc::new(Keccak256Hash), depth)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn name(&self) -> &'static str {
        self.function.name()
    }

    pub fn parent_of(&self, left: &Field, right: &Field) -> Field {
        self.function.hash_pair(left, right)
    }

    /// Root of an all-zero subtree of height `level`; `pre_hash(0)` is the
    /// zero leaf
    pub fn pre_hash(&self, level: usize) -> Field {
        self.pre_hash[level]
    }

    pub fn pre_hashes(&self) -> &[Field] {
        &self.pre_hash
    }

    /// Canonical root of an empty tree of this depth
    pub fn empty_root(&self) -> Field {
        self.pre_hash[self.depth]
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("function", &self.function.name())
            .field("depth", &self.depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_hash_chain() {
        let hasher = Hasher::sha256(4);
        assert_eq!(hasher.pre_hashes().len(), 5);
        assert_eq!(hasher.pre_hash(0), Field::zero());
        for level in 1..=4 {
            let below = hasher.pre_hash(level - 1);
            assert_eq!(hasher.pre_hash(level), hasher.parent_of(&below, &below));
        }
        assert_eq!(hasher.empty_root(), hasher.pre_hash(4));
    }

    #[test]
    fn test_functions_are_distinct_and_ordered() {
        let a = Field::from_u64(1);
        let b = Field::from_u64(2);
        let sha = Sha256Hash;
        let keccak = Keccak256Hash;
        assert_ne!(sha.hash_pair(&a, &b), sha.hash_pair(&b, &a));
        assert_ne!(sha.hash_pair(&a, &b), keccak.hash_pair(&a, &b));
    }
}
