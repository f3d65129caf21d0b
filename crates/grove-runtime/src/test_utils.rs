//! Minimal ordered in-memory store and a from-scratch root builder, shared
//! with downstream tests through the `test-utils` feature

use crate::field::Field;
use crate::hasher::Hasher;
use crate::traits::{BatchLike, KeyValueStoreLike};
use std::collections::BTreeMap;
use std::convert::Infallible;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TestStore {
    pub data: BTreeMap<Vec<u8>, Vec<u8>>,
}

pub struct TestBatch(Vec<(Vec<u8>, Option<Vec<u8>>)>);

impl BatchLike for TestBatch {
    fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        self.0.push((key.as_ref().to_vec(), Some(value.as_ref().to_vec())));
    }

    fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.0.push((key.as_ref().to_vec(), None));
    }

    fn default() -> Self {
        TestBatch(Vec::new())
    }
}

impl KeyValueStoreLike for TestStore {
    type Error = Infallible;
    type Batch = TestBatch;

    fn write(&mut self, batch: Self::Batch) -> Result<(), Self::Error> {
        for (key, value) in batch.0 {
            match value {
                Some(value) => {
                    self.data.insert(key, value);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.data.get(key.as_ref()).cloned())
    }

    fn put<K, V>(&mut self, key: K, value: V) -> Result<(), Self::Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.data.insert(key.as_ref().to_vec(), value.as_ref().to_vec());
        Ok(())
    }

    fn delete<K: AsRef<[u8]>>(&mut self, key: K) -> Result<(), Self::Error> {
        self.data.remove(key.as_ref());
        Ok(())
    }

    fn scan_prefix<K: AsRef<[u8]>>(&self, prefix: K) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error> {
        let prefix = prefix.as_ref();
        Ok(self
            .data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn create_batch(&self) -> Self::Batch {
        <TestBatch as BatchLike>::default()
    }
}

/// Root of a fully materialised tree over `leaves`, padded with zero leaves
pub fn reference_root(hasher: &Hasher, leaves: &[Field]) -> Field {
    let mut level: Vec<Field> = leaves.to_vec();
    level.resize(1usize << hasher.depth(), hasher.pre_hash(0));
    for _ in 0..hasher.depth() {
        level = level
            .chunks(2)
            .map(|pair| hasher.parent_of(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}
