//! Typed repositories over the key-value store
//!
//! Each repository owns the key layout and encoding of one entity. Reads go
//! through a [`Staged`] view so that callers inside an open transaction see
//! their own pending writes; writes are always staged, never applied
//! directly.

use crate::error::{GroveError, GroveResult};
use crate::field::Field;
use crate::key_utils::{
    generations_list_key, halted_key, leaf_key, node_key, nullified_by_key, nullifier_record_key,
    tree_data_key, tree_metadata_key, HALTED_PREFIX, NULLIFIER_ROOT_KEY,
};
use crate::traits::KeyValueStoreLike;
use crate::transaction::{Staged, StoreTransaction};
use crate::types::{HaltRecord, LeafRecord, NullifierRecord, TreeData, TreeGeneration, TreeId, TreeKind, TreeMetadata};
use ruint::aliases::U256;
use serde::de::DeserializeOwned;
use serde::Serialize;

fn decode<V: DeserializeOwned>(bytes: &[u8]) -> GroveResult<V> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode<V: Serialize>(value: &V) -> GroveResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub struct TreeGenerationRepo;

impl TreeGenerationRepo {
    /// All generations of `kind`, ordered by generation index
    pub fn load_all<T: KeyValueStoreLike>(
        reader: &Staged<'_, T>,
        kind: TreeKind,
    ) -> GroveResult<Vec<TreeGeneration>> {
        let mut generations = Vec::new();
        for raw in reader.get_list(&generations_list_key(kind))? {
            let generation = String::from_utf8_lossy(&raw)
                .parse::<u32>()
                .map_err(|e| GroveError::Serialization(format!("bad generation index: {}", e)))?;
            generations.push(Self::load(reader, &TreeId::new(kind, generation))?);
        }
        Ok(generations)
    }

    pub fn load<T: KeyValueStoreLike>(reader: &Staged<'_, T>, id: &TreeId) -> GroveResult<TreeGeneration> {
        let metadata: TreeMetadata = match reader.get(&tree_metadata_key(id))? {
            Some(bytes) => decode(&bytes)?,
            None => return Err(GroveError::Storage(format!("missing metadata for tree {}", id))),
        };
        let data: TreeData = match reader.get(&tree_data_key(id))? {
            Some(bytes) => decode(&bytes)?,
            None => return Err(GroveError::Storage(format!("missing data for tree {}", id))),
        };
        Ok(TreeGeneration { metadata, data })
    }

    /// Stages a brand new generation and registers it in the kind's list
    pub fn create<T: KeyValueStoreLike>(
        store: &T,
        tx: &mut StoreTransaction,
        generation: &TreeGeneration,
    ) -> GroveResult<()> {
        let id = generation.id();
        Self::save(tx, generation)?;
        tx.push_to_list(store, &generations_list_key(id.kind), id.generation.to_string().as_bytes())?;
        Ok(())
    }

    pub fn save(tx: &mut StoreTransaction, generation: &TreeGeneration) -> GroveResult<()> {
        let id = generation.id();
        tx.put(tree_metadata_key(&id), encode(&generation.metadata)?);
        tx.put(tree_data_key(&id), encode(&generation.data)?);
        Ok(())
    }
}

pub struct CachedNodeRepo;

impl CachedNodeRepo {
    pub fn get<T: KeyValueStoreLike>(
        reader: &Staged<'_, T>,
        tree: &TreeId,
        node_index: &U256,
    ) -> GroveResult<Option<Field>> {
        match reader.get(&node_key(tree, node_index))? {
            Some(bytes) => Field::from_be_slice(&bytes)
                .map(Some)
                .map_err(|e| GroveError::Serialization(format!("cached node of {}: {}", tree, e))),
            None => Ok(None),
        }
    }

    pub fn put(tx: &mut StoreTransaction, tree: &TreeId, node_index: &U256, value: &Field) {
        tx.put(node_key(tree, node_index), value.to_be_bytes());
    }
}

pub struct LeafRepo;

impl LeafRepo {
    pub fn get<T: KeyValueStoreLike>(
        reader: &Staged<'_, T>,
        kind: TreeKind,
        leaf_hash: &Field,
    ) -> GroveResult<Option<LeafRecord>> {
        reader
            .get(&leaf_key(kind, leaf_hash))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn save(tx: &mut StoreTransaction, record: &LeafRecord) -> GroveResult<()> {
        tx.put(leaf_key(record.tree.kind, &record.hash), encode(record)?);
        Ok(())
    }
}

pub struct HaltRepo;

impl HaltRepo {
    pub fn save(tx: &mut StoreTransaction, record: &HaltRecord) -> GroveResult<()> {
        tx.put(halted_key(&record.tree), encode(record)?);
        Ok(())
    }

    /// Every halted generation, in key order
    pub fn load_all<T: KeyValueStoreLike>(store: &T) -> GroveResult<Vec<HaltRecord>> {
        store
            .scan_prefix(HALTED_PREFIX.as_bytes())
            .map_err(GroveError::storage)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }
}

pub struct NullifierRepo;

impl NullifierRepo {
    pub fn get<T: KeyValueStoreLike>(
        reader: &Staged<'_, T>,
        index: &U256,
    ) -> GroveResult<Option<NullifierRecord>> {
        reader
            .get(&nullifier_record_key(index))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn save(tx: &mut StoreTransaction, index: &U256, record: &NullifierRecord) -> GroveResult<()> {
        tx.put(nullifier_record_key(index), encode(record)?);
        Ok(())
    }

    /// Nullifier indices spent by `block_hash`, in nullification order
    pub fn indices_by_block<T: KeyValueStoreLike>(
        reader: &Staged<'_, T>,
        block_hash: &Field,
    ) -> GroveResult<Vec<U256>> {
        reader
            .get_list(&nullified_by_key(block_hash))?
            .into_iter()
            .map(|bytes| {
                U256::try_from_be_slice(&bytes)
                    .ok_or_else(|| GroveError::Serialization("bad nullifier index".to_string()))
            })
            .collect()
    }

    pub fn push_block_index<T: KeyValueStoreLike>(
        store: &T,
        tx: &mut StoreTransaction,
        block_hash: &Field,
        index: &U256,
    ) -> GroveResult<()> {
        tx.push_to_list(store, &nullified_by_key(block_hash), &index.to_be_bytes::<32>())?;
        Ok(())
    }

    pub fn clear_block<T: KeyValueStoreLike>(
        store: &T,
        tx: &mut StoreTransaction,
        block_hash: &Field,
    ) -> GroveResult<()> {
        tx.clear_list(store, &nullified_by_key(block_hash))
    }

    pub fn root<T: KeyValueStoreLike>(reader: &Staged<'_, T>) -> GroveResult<Option<Field>> {
        match reader.get(NULLIFIER_ROOT_KEY.as_bytes())? {
            Some(bytes) => Field::from_be_slice(&bytes)
                .map(Some)
                .map_err(|e| GroveError::Serialization(format!("nullifier root: {}", e))),
            None => Ok(None),
        }
    }

    pub fn save_root(tx: &mut StoreTransaction, root: &Field) {
        tx.put(NULLIFIER_ROOT_KEY.as_bytes(), root.to_be_bytes());
    }
}
