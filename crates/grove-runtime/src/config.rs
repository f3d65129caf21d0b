//! Forest configuration

use crate::error::{GroveError, GroveResult};
use crate::hasher::Hasher;
use serde::{Deserialize, Serialize};

/// Largest depth accepted for append-only trees; leaf indices are `u64`
pub const MAX_APPEND_DEPTH: usize = 62;

/// Which two-to-one function a tree hashes with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Sha256,
    Keccak256,
}

impl HashKind {
    pub fn hasher(&self, depth: usize) -> Hasher {
        match self {
            HashKind::Sha256 => Hasher::sha256(depth),
            HashKind::Keccak256 => Hasher::keccak256(depth),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroveConfig {
    pub utxo_tree_depth: usize,
    pub withdrawal_tree_depth: usize,
    pub nullifier_tree_depth: usize,
    /// Leaves per appended subtree of the output trees
    pub utxo_subtree_size: u64,
    pub withdrawal_subtree_size: u64,
    /// Track every leaf instead of only the observed owners' ones
    pub full_sync: bool,
    /// Track every leaf for this run without making it the persisted mode
    pub force_update: bool,
    pub utxo_hash: HashKind,
    pub withdrawal_hash: HashKind,
    pub nullifier_hash: HashKind,
}

impl Default for GroveConfig {
    fn default() -> Self {
        Self {
            utxo_tree_depth: 48,
            withdrawal_tree_depth: 48,
            nullifier_tree_depth: 254,
            utxo_subtree_size: 32,
            withdrawal_subtree_size: 32,
            full_sync: true,
            force_update: false,
            utxo_hash: HashKind::Sha256,
            withdrawal_hash: HashKind::Keccak256,
            nullifier_hash: HashKind::Keccak256,
        }
    }
}

impl GroveConfig {
    pub fn validate(&self) -> GroveResult<()> {
        for (name, depth, subtree) in [
            ("utxo", self.utxo_tree_depth, self.utxo_subtree_size),
            ("withdrawal", self.withdrawal_tree_depth, self.withdrawal_subtree_size),
        ] {
            if depth == 0 || depth > MAX_APPEND_DEPTH {
                return Err(GroveError::Config(format!(
                    "{} tree depth {} outside 1..={}",
                    name, depth, MAX_APPEND_DEPTH
                )));
            }
            if !subtree.is_power_of_two() {
                return Err(GroveError::Config(format!(
                    "{} subtree size {} is not a power of two",
                    name, subtree
                )));
            }
            if subtree > 1u64 << depth {
                return Err(GroveError::Config(format!(
                    "{} subtree size {} exceeds tree capacity 2^{}",
                    name, subtree, depth
                )));
            }
        }
        if self.nullifier_tree_depth == 0 || self.nullifier_tree_depth > crate::field::MODULUS_BITS {
            return Err(GroveError::Config(format!(
                "nullifier tree depth {} outside 1..={}",
                self.nullifier_tree_depth,
                crate::field::MODULUS_BITS
            )));
        }
        Ok(())
    }

    /// Whether every leaf is tracked regardless of its owner
    pub fn tracks_everything(&self) -> bool {
        self.full_sync || self.force_update
    }
}

/// The three hashers of a forest
#[derive(Debug, Clone)]
pub struct GroveHashers {
    pub utxo: Hasher,
    pub withdrawal: Hasher,
    pub nullifier: Hasher,
}

impl GroveHashers {
    pub fn default_for(config: &GroveConfig) -> Self {
        Self {
            utxo: config.utxo_hash.hasher(config.utxo_tree_depth),
            withdrawal: config.withdrawal_hash.hasher(config.withdrawal_tree_depth),
            nullifier: config.nullifier_hash.hasher(config.nullifier_tree_depth),
        }
    }
}
