//! Records persisted by the forest and the values exchanged with callers

use crate::field::Field;
use crate::hasher::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three tree families of the forest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TreeKind {
    Utxo,
    Withdrawal,
    Nullifier,
}

impl TreeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeKind::Utxo => "utxo",
            TreeKind::Withdrawal => "withdrawal",
            TreeKind::Nullifier => "nullifier",
        }
    }
}

impl fmt::Display for TreeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arena address of one tree generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeId {
    pub kind: TreeKind,
    pub generation: u32,
}

impl TreeId {
    pub fn new(kind: TreeKind, generation: u32) -> Self {
        Self { kind, generation }
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.generation)
    }
}

/// Opaque note attached to an output, with the key that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Owner public key or address bytes, matched against the observed sets
    #[serde(with = "hex_bytes")]
    pub owner: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

/// One leaf to append. `leaf_hash` is always required to keep the root
/// correct; `note` is only present for outputs the wallet can open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub leaf_hash: Field,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<Note>,
}

impl Item {
    pub fn new(leaf_hash: Field) -> Self {
        Self {
            leaf_hash,
            note: None,
        }
    }

    pub fn with_note(leaf_hash: Field, note: Note) -> Self {
        Self {
            leaf_hash,
            note: Some(note),
        }
    }
}

impl From<Field> for Item {
    fn from(leaf_hash: Field) -> Self {
        Item::new(leaf_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMetadata {
    pub id: TreeId,
    /// Block that opened this generation; `None` for the genesis generation
    pub root_owner: Option<Field>,
    /// First global leaf index owned by this generation
    pub start: u64,
    /// One past the last global leaf index appended so far
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeData {
    pub root: Field,
    pub next_index: u64,
    /// Sibling needed at each level for the insertion at `next_index`
    pub rightmost_siblings: Vec<Field>,
    /// Highest local index whose leaf is tracked by this wallet
    #[serde(default)]
    pub last_tracked_index: Option<u64>,
}

impl TreeData {
    pub fn empty(hasher: &Hasher) -> Self {
        Self {
            root: hasher.empty_root(),
            next_index: 0,
            rightmost_siblings: hasher.pre_hashes()[..hasher.depth()].to_vec(),
            last_tracked_index: None,
        }
    }
}

/// Metadata and data of one append-only generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeGeneration {
    pub metadata: TreeMetadata,
    pub data: TreeData,
}

impl TreeGeneration {
    pub fn id(&self) -> TreeId {
        self.metadata.id
    }

    /// Global index the next appended leaf will receive
    pub fn global_next_index(&self) -> u64 {
        self.metadata.start + self.data.next_index
    }
}

/// Marker of a generation whose writes stay halted across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub tree: TreeId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullifierRecord {
    pub index: Field,
    pub nullified: bool,
    pub causing_block_hash: Option<Field>,
}

/// Where a tracked leaf lives, written once at append time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRecord {
    pub hash: Field,
    pub tree: TreeId,
    /// Local index inside the generation
    pub index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<Note>,
}

/// Result of an append, identical between dry and committed runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    pub tree: TreeId,
    pub root: Field,
    /// Next local index after the append
    pub index: u64,
    pub siblings: Vec<Field>,
}

/// Everything a block changes in the forest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrovePatch {
    pub block_hash: Field,
    pub utxos: Vec<Item>,
    pub withdrawals: Vec<Item>,
    pub nullifiers: Vec<Field>,
}

/// Roots and indices a block header commits to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroveSnapshot {
    pub utxo_tree_index: u64,
    pub utxo_tree_root: Field,
    pub withdrawal_tree_index: u64,
    pub withdrawal_tree_root: Field,
    pub nullifier_tree_root: Field,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
