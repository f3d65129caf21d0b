//! Persisted block records and the proposal index

use crate::types::BlockRecord;
use crate::{SyncError, SyncResult};
use grove_runtime::{Field, KeyValueStoreLike, Staged, StoreTransaction};

pub const BLOCK_PREFIX: &str = "block:";
pub const PROPOSAL_PREFIX: &str = "block:proposal:";

pub fn block_key(hash: &Field) -> Vec<u8> {
    format!("{}{}", BLOCK_PREFIX, hex::encode(hash.to_be_bytes())).into_bytes()
}

/// Zero padded so that a prefix scan returns proposals in order
pub fn proposal_key(proposal_num: u64) -> Vec<u8> {
    format!("{}{:020}", PROPOSAL_PREFIX, proposal_num).into_bytes()
}

pub struct BlockRepo;

impl BlockRepo {
    pub fn get<T: KeyValueStoreLike>(reader: &Staged<'_, T>, hash: &Field) -> SyncResult<Option<BlockRecord>> {
        reader
            .get(&block_key(hash))?
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|e| SyncError::Storage(format!("block record {}: {}", hash, e)))
            })
            .transpose()
    }

    /// Stages the record and points its proposal slot at it
    pub fn save(tx: &mut StoreTransaction, record: &BlockRecord) -> SyncResult<()> {
        let bytes = serde_json::to_vec(record).map_err(|e| SyncError::Storage(e.to_string()))?;
        tx.put(block_key(&record.hash), bytes);
        tx.put(proposal_key(record.proposal_num), record.hash.to_be_bytes());
        Ok(())
    }

    /// Current record of every proposal slot, in proposal order
    pub fn load_all<T: KeyValueStoreLike>(store: &T) -> SyncResult<Vec<BlockRecord>> {
        let reader = Staged::direct(store);
        let slots = store
            .scan_prefix(PROPOSAL_PREFIX.as_bytes())
            .map_err(|e| SyncError::Storage(format!("{:?}", e)))?;
        let mut records = Vec::with_capacity(slots.len());
        for (key, value) in slots {
            let hash = Field::from_be_slice(&value)
                .map_err(|e| SyncError::Storage(format!("proposal slot {}: {}", String::from_utf8_lossy(&key), e)))?;
            let record = Self::get(&reader, &hash)?.ok_or(SyncError::UnknownBlock(hash))?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockStatus;
    use memgrove::MemStoreAdapter;

    #[test]
    fn test_records_load_in_proposal_order() {
        let mut store = MemStoreAdapter::new();
        let mut tx = StoreTransaction::new();
        for (n, hash) in [(10u64, 3u64), (2, 1), (7, 2)] {
            BlockRepo::save(&mut tx, &BlockRecord::proposed(Field::from_u64(hash), n, 500 + n)).unwrap();
        }
        tx.commit(&mut store).unwrap();

        let records = BlockRepo::load_all(&store).unwrap();
        let order: Vec<u64> = records.iter().map(|r| r.proposal_num).collect();
        assert_eq!(order, vec![2, 7, 10]);
        assert!(records.iter().all(|r| r.status == BlockStatus::NotFetched));
    }

    #[test]
    fn test_replaced_slot_points_at_new_record() {
        let mut store = MemStoreAdapter::new();
        let mut old = BlockRecord::proposed(Field::from_u64(1), 4, 0);
        old.status = BlockStatus::Reverted;
        let new = BlockRecord::proposed(Field::from_u64(2), 4, 1);

        let mut tx = StoreTransaction::new();
        BlockRepo::save(&mut tx, &old).unwrap();
        BlockRepo::save(&mut tx, &new).unwrap();
        tx.commit(&mut store).unwrap();

        assert_eq!(BlockRepo::load_all(&store).unwrap(), vec![new]);
        let reader = Staged::direct(&store);
        assert_eq!(BlockRepo::get(&reader, &Field::from_u64(1)).unwrap(), Some(old));
    }
}
