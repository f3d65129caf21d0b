//! Blocks, their lifecycle records and engine configuration

use crate::error::{SyncError, SyncResult};
use anyhow::Context;
use grove_runtime::{Field, GroveConfig, GrovePatch, GroveSnapshot, Item};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tiny_keccak::{Hasher as _, Keccak};

/// Status of an observed block. The numeric codes are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum BlockStatus {
    NotFetched = 0,
    Fetched = 1,
    Verified = 3,
    Finalized = 4,
    Invalidated = 5,
    Reverted = 6,
}

impl BlockStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BlockStatus::Finalized | BlockStatus::Invalidated | BlockStatus::Reverted
        )
    }

    pub fn can_transition_to(&self, next: BlockStatus) -> bool {
        use BlockStatus::*;
        match (self, next) {
            (NotFetched, Fetched) | (Fetched, Verified) | (Verified, Finalized) => true,
            (NotFetched | Fetched | Verified, Invalidated | Reverted) => true,
            _ => false,
        }
    }
}

impl From<BlockStatus> for u8 {
    fn from(status: BlockStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for BlockStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => BlockStatus::NotFetched,
            1 => BlockStatus::Fetched,
            3 => BlockStatus::Verified,
            4 => BlockStatus::Finalized,
            5 => BlockStatus::Invalidated,
            6 => BlockStatus::Reverted,
            other => return Err(format!("unknown block status code {}", other)),
        })
    }
}

/// Roots and indices a block commits to, plus its chain position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent_hash: Field,
    pub proposal_num: u64,
    pub utxo_root: Field,
    pub utxo_index: u64,
    pub withdrawal_root: Field,
    pub withdrawal_index: u64,
    pub nullifier_root: Field,
}

impl BlockHeader {
    /// Keccak-256 of the fixed-width big-endian encoding, reduced into the field
    pub fn hash(&self) -> Field {
        let mut hasher = Keccak::v256();
        hasher.update(&self.parent_hash.to_be_bytes());
        hasher.update(&self.proposal_num.to_be_bytes());
        hasher.update(&self.utxo_root.to_be_bytes());
        hasher.update(&self.utxo_index.to_be_bytes());
        hasher.update(&self.withdrawal_root.to_be_bytes());
        hasher.update(&self.withdrawal_index.to_be_bytes());
        hasher.update(&self.nullifier_root.to_be_bytes());
        let mut output = [0u8; 32];
        hasher.finalize(&mut output);
        Field::from_be_bytes_reduced(output)
    }

    pub fn claimed_snapshot(&self) -> GroveSnapshot {
        GroveSnapshot {
            utxo_tree_index: self.utxo_index,
            utxo_tree_root: self.utxo_root,
            withdrawal_tree_index: self.withdrawal_index,
            withdrawal_tree_root: self.withdrawal_root,
            nullifier_tree_root: self.nullifier_root,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    pub utxos: Vec<Item>,
    pub withdrawals: Vec<Item>,
    pub nullifiers: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn hash(&self) -> Field {
        self.header.hash()
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::Decode(e.to_string()))
    }

    pub fn decode(raw: &[u8]) -> SyncResult<Self> {
        serde_json::from_slice(raw).map_err(|e| SyncError::Decode(e.to_string()))
    }

    /// The forest changes of this block, tagged with its hash
    pub fn patch(&self) -> GrovePatch {
        GrovePatch {
            block_hash: self.hash(),
            utxos: self.body.utxos.clone(),
            withdrawals: self.body.withdrawals.clone(),
            nullifiers: self.body.nullifiers.clone(),
        }
    }
}

/// Persisted lifecycle state of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: Field,
    pub proposal_num: u64,
    pub l1_origin: u64,
    pub status: BlockStatus,
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
    /// Unix time (seconds) after which a verified block may be finalized
    #[serde(default)]
    pub challenge_deadline: Option<u64>,
}

impl BlockRecord {
    pub fn proposed(hash: Field, proposal_num: u64, l1_origin: u64) -> Self {
        Self {
            hash,
            proposal_num,
            l1_origin,
            status: BlockStatus::NotFetched,
            raw: None,
            challenge_deadline: None,
        }
    }

    pub fn block(&self) -> SyncResult<Block> {
        match &self.raw {
            Some(raw) => Block::decode(raw),
            None => Err(SyncError::Decode(format!("block {} has no body yet", self.hash))),
        }
    }
}

/// Notifications delivered by the chain synchronizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Proposed {
        hash: Field,
        proposal_num: u64,
        l1_origin: u64,
    },
    Fetched {
        hash: Field,
        raw: Vec<u8>,
    },
    ChallengePeriodElapsed {
        hash: Field,
    },
    Challenged {
        hash: Field,
    },
    Reorged {
        hash: Field,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub challenge_period_secs: u64,
    pub channel_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            challenge_period_secs: 7 * 24 * 60 * 60,
            channel_capacity: 1024,
        }
    }
}

/// Everything a node needs to run the forest and its lifecycle engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub grove: GroveConfig,
    pub lifecycle: LifecycleConfig,
}

impl NodeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading node config {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&contents)
            .with_context(|| format!("parsing node config {}", path.display()))?;
        config.grove.validate()?;
        Ok(config)
    }
}

/// Number of tracked blocks per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleStats {
    pub not_fetched: usize,
    pub fetched: usize,
    pub verified: usize,
    pub finalized: usize,
    pub invalidated: usize,
    pub reverted: usize,
}

impl LifecycleStats {
    pub fn count(&mut self, status: BlockStatus) {
        match status {
            BlockStatus::NotFetched => self.not_fetched += 1,
            BlockStatus::Fetched => self.fetched += 1,
            BlockStatus::Verified => self.verified += 1,
            BlockStatus::Finalized => self.finalized += 1,
            BlockStatus::Invalidated => self.invalidated += 1,
            BlockStatus::Reverted => self.reverted += 1,
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
