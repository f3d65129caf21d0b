//! In-memory implementation of KeyValueStoreLike

use grove_runtime::{BatchLike, KeyValueStoreLike};
use log::debug;
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::sync::{Arc, Mutex, MutexGuard};

/// Clones share the same map; use [`MemStoreAdapter::deep_copy`] for an
/// isolated copy
#[derive(Clone, Default)]
pub struct MemStoreAdapter {
    pub db: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemStoreAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: HashMap<Vec<u8>, Vec<u8>>) -> Self {
        Self {
            db: Arc::new(Mutex::new(data)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Vec<u8>, Vec<u8>>>> {
        self.db
            .lock()
            .map_err(|_| Error::new(ErrorKind::Other, "memstore lock poisoned"))
    }

    /// Get a snapshot of all data
    pub fn get_all_data(&self) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        Ok(self.lock()?.clone())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    /// Get the number of keys stored
    pub fn len(&self) -> usize {
        self.lock().map(|db| db.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a deep copy with isolated data (useful for preview operations)
    pub fn deep_copy(&self) -> Result<Self> {
        Ok(Self::with_data(self.get_all_data()?))
    }
}

pub struct MemStoreBatch {
    operations: Vec<BatchOperation>,
}

#[derive(Clone)]
enum BatchOperation {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl MemStoreBatch {
    pub fn new() -> Self {
        <Self as BatchLike>::default()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl BatchLike for MemStoreBatch {
    fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        self.operations.push(BatchOperation::Put(
            key.as_ref().to_vec(),
            value.as_ref().to_vec(),
        ));
    }

    fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.operations
            .push(BatchOperation::Delete(key.as_ref().to_vec()));
    }

    fn default() -> Self {
        Self {
            operations: Vec::new(),
        }
    }
}

impl KeyValueStoreLike for MemStoreAdapter {
    type Batch = MemStoreBatch;
    type Error = Error;

    /// The whole batch is applied under one lock acquisition
    fn write(&mut self, batch: Self::Batch) -> Result<()> {
        let mut db = self.lock()?;
        let count = batch.operations.len();
        for operation in batch.operations {
            match operation {
                BatchOperation::Put(key, value) => {
                    db.insert(key, value);
                }
                BatchOperation::Delete(key) => {
                    db.remove(&key);
                }
            }
        }
        debug!("memstore applied batch of {} operations", count);
        Ok(())
    }

    fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key.as_ref()).cloned())
    }

    fn put<K, V>(&mut self, key: K, value: V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.lock()?
            .insert(key.as_ref().to_vec(), value.as_ref().to_vec());
        Ok(())
    }

    fn delete<K: AsRef<[u8]>>(&mut self, key: K) -> Result<()> {
        self.lock()?.remove(key.as_ref());
        Ok(())
    }

    fn scan_prefix<K: AsRef<[u8]>>(&self, prefix: K) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let db = self.lock()?;
        let prefix = prefix.as_ref();
        let mut results: Vec<(Vec<u8>, Vec<u8>)> = db
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        // Sort results by key for consistent ordering
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    fn create_batch(&self) -> Self::Batch {
        <MemStoreBatch as BatchLike>::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_runtime::{Field, GroveConfig, Item, StoreTransaction};

    #[test]
    fn test_memstore_basic_operations() {
        let mut store = MemStoreAdapter::new();

        store.put(b"key1", b"value1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));

        store.delete(b"key1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), None);
    }

    #[test]
    fn test_memstore_batch_operations() {
        let mut store = MemStoreAdapter::new();
        store.put(b"gone", b"x").unwrap();
        let mut batch = MemStoreBatch::new();

        batch.put(b"key1", b"value1");
        batch.put(b"key2", b"value2");
        batch.delete(b"gone");
        assert_eq!(batch.len(), 3);

        store.write(batch).unwrap();

        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.get(b"key2").unwrap(), Some(b"value2".to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_is_sorted() {
        let mut store = MemStoreAdapter::new();
        for key in ["p:3", "p:1", "q:0", "p:2"] {
            store.put(key, b"v").unwrap();
        }
        let keys: Vec<Vec<u8>> = store
            .scan_prefix(b"p:")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"p:1".to_vec(), b"p:2".to_vec(), b"p:3".to_vec()]);
    }

    #[test]
    fn test_deep_copy_is_isolated() {
        let mut store = MemStoreAdapter::new();
        store.put(b"a", b"1").unwrap();
        let shared = store.clone();
        let mut isolated = store.deep_copy().unwrap();

        isolated.put(b"b", b"2").unwrap();
        store.put(b"c", b"3").unwrap();

        assert_eq!(isolated.get(b"c").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(shared.get(b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_lists_through_transaction() {
        let mut store = MemStoreAdapter::new();
        let mut tx = StoreTransaction::new();
        tx.push_to_list(&store, b"list", b"first").unwrap();
        tx.push_to_list(&store, b"list", b"second").unwrap();
        tx.commit(&mut store).unwrap();

        let mut tx = StoreTransaction::new();
        tx.batch_push(&store, vec![(b"list".to_vec(), b"third".to_vec())])
            .unwrap();
        tx.commit(&mut store).unwrap();

        let items = grove_runtime::get_list(&store, b"list").unwrap();
        assert_eq!(
            items,
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
    }

    #[test]
    fn test_grove_over_memstore() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut grove = crate::open_mem_grove(GroveConfig {
            utxo_tree_depth: 8,
            utxo_subtree_size: 4,
            ..Default::default()
        })
        .unwrap();
        let leaves: Vec<Item> = (1..=6u64).map(|v| Item::new(Field::from_u64(v))).collect();
        grove.append_outputs(&leaves).unwrap();

        let proof = grove.output_merkle_proof(&Field::from_u64(5)).unwrap();
        assert_eq!(proof.index, Field::from_u64(4));
        assert!(proof.verify(grove.hasher(grove_runtime::TreeKind::Utxo)));
        assert!(!grove.store().is_empty());
    }

    #[test]
    fn test_halt_marker_is_shared_with_reopened_grove() {
        let config = GroveConfig {
            utxo_tree_depth: 4,
            utxo_subtree_size: 2,
            ..Default::default()
        };
        let mut grove = crate::open_mem_grove(config.clone()).unwrap();
        grove.append_outputs(&[Item::new(Field::from_u64(3)), Item::new(Field::from_u64(4))]).unwrap();

        // damage every cached node of the first output tree behind the grove's back
        let mut shared = grove.store().clone();
        for (key, _) in shared.scan_prefix(b"grove:node:utxo:0:").unwrap() {
            shared.put(key, Field::from_u64(999).to_be_bytes()).unwrap();
        }
        assert!(grove.output_merkle_proof(&Field::from_u64(3)).is_err());

        let mut reopened = grove_runtime::Grove::new(shared.clone(), config).unwrap();
        reopened.init().unwrap();
        let tree = grove_runtime::TreeId::new(grove_runtime::TreeKind::Utxo, 0);
        assert!(reopened.is_halted(&tree));
        assert!(matches!(
            reopened.append_outputs(&[Item::new(Field::from_u64(5))]),
            Err(grove_runtime::GroveError::WritesHalted { .. })
        ));
    }
}
